//! Transport and client configuration.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::jar::CookieJar;
use crate::proxy::ProxySelector;
use crate::request::Request;

/// Hook for custom TCP dialing. Receives the request context (deadline,
/// cancellation) and the `host:port` to connect to.
pub type DialHook = Arc<dyn Fn(&Context, &str) -> io::Result<TcpStream> + Send + Sync>;

/// Configuration for [`Transport`][crate::Transport].
///
/// Plain struct with public fields; fill in what you need and leave the
/// rest to `Default`.
///
/// ```
/// use httpool::{Transport, TransportConfig};
/// use std::time::Duration;
///
/// let transport = Transport::new(TransportConfig {
///     max_idle_conns_per_host: 4,
///     response_header_timeout: Some(Duration::from_secs(10)),
///     ..Default::default()
/// });
/// ```
#[derive(Clone)]
pub struct TransportConfig {
    /// How to pick an upstream proxy per request. The default consults
    /// the `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` environment.
    pub proxy: ProxySelector,
    /// Custom TCP dialer. Defaults to `TcpStream::connect` honoring the
    /// context deadline.
    pub dial: Option<DialHook>,
    /// TLS parameters. `None` uses a process-wide default with webpki
    /// roots.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Deadline for the TLS handshake. Default 10 seconds.
    pub tls_handshake_timeout: Option<Duration>,
    /// Send `Connection: close` on every request and pool nothing.
    pub disable_keep_alives: bool,
    /// Suppress the automatic `Accept-Encoding: gzip` and transparent
    /// decompression.
    pub disable_compression: bool,
    /// Pool-wide cap on idle connections. Default 100.
    pub max_idle_conns: usize,
    /// Per connection-key cap on idle connections. Default 2.
    pub max_idle_conns_per_host: usize,
    /// Per connection-key cap on total (active + idle) connections.
    /// `0` means unlimited. Excess requests queue FIFO.
    pub max_conns_per_host: usize,
    /// Idle connections are torn down after this long. Default 90
    /// seconds. `None` keeps them forever.
    pub idle_conn_timeout: Option<Duration>,
    /// Per-request limit on waiting for the response head after the
    /// request was fully written.
    pub response_header_timeout: Option<Duration>,
    /// How long to wait for a `100 Continue` before sending the body
    /// anyway when the request carries `Expect: 100-continue`.
    /// Default 1 second.
    pub expect_continue_timeout: Option<Duration>,
    /// Hard limit on the response head. Default 10 MiB.
    pub max_response_header_bytes: usize,
}

pub(crate) const DEFAULT_MAX_IDLE_CONNS: usize = 100;
pub(crate) const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;
pub(crate) const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 10 << 20;

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            proxy: ProxySelector::Environment,
            dial: None,
            tls_config: None,
            tls_handshake_timeout: Some(Duration::from_secs(10)),
            disable_keep_alives: false,
            disable_compression: false,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            max_conns_per_host: 0,
            idle_conn_timeout: Some(Duration::from_secs(90)),
            response_header_timeout: None,
            expect_continue_timeout: Some(Duration::from_secs(1)),
            max_response_header_bytes: DEFAULT_MAX_RESPONSE_HEADER_BYTES,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("disable_keep_alives", &self.disable_keep_alives)
            .field("disable_compression", &self.disable_compression)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_idle_conns_per_host", &self.max_idle_conns_per_host)
            .field("max_conns_per_host", &self.max_conns_per_host)
            .field("idle_conn_timeout", &self.idle_conn_timeout)
            .field("response_header_timeout", &self.response_header_timeout)
            .finish()
    }
}

/// What a [`check_redirect`][ClientConfig::check_redirect] hook decides.
pub enum RedirectDecision {
    /// Follow the redirect. The default policy follows up to 10 hops.
    Follow,
    /// Stop redirecting and hand the 3xx response to the caller as-is,
    /// without error.
    UseLastResponse,
    /// Abort with this error.
    Abort(crate::Error),
}

/// Hook deciding whether to follow a redirect. Receives the request
/// about to be issued and the requests issued so far (oldest first).
pub type CheckRedirect =
    Arc<dyn Fn(&Request, &[Request]) -> RedirectDecision + Send + Sync>;

/// Configuration for [`Client`][crate::Client].
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Redirect policy override. `None` follows up to 10 redirects and
    /// then fails.
    pub check_redirect: Option<CheckRedirect>,
    /// Cookie jar consulted before and fed after every request.
    pub cookie_jar: Option<Arc<CookieJar>>,
    /// Overrides the transport's default `User-Agent` for requests that
    /// do not set their own.
    pub user_agent: Option<String>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("check_redirect", &self.check_redirect.is_some())
            .field("cookie_jar", &self.cookie_jar.is_some())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}
