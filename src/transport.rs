//! The round-trip dispatcher: owns the pool, validates requests, picks
//! or dials connections, retries where that is provably safe, and
//! installs the transparent gzip decoder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use http::Method;

use crate::body::{Body, CancelGuard};
use crate::config::TransportConfig;
use crate::conn::{ConnKey, ConnTarget, InboundResponse, PersistConn, RoundTrip};
use crate::error::Error;
use crate::pool::Pool;
use crate::proxy::Proxy;
use crate::request::Request;
use crate::response::Response;
use crate::send_body::SendBody;
use crate::util;
use crate::wire;

use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!("httpool/", env!("CARGO_PKG_VERSION"));

/// A pooled HTTP/1.x round-tripper.
///
/// A `Transport` is `Send + Sync`; share one behind an `Arc` and it will
/// reuse connections across threads. Dropping it tears down the idle
/// pool.
pub struct Transport {
    config: TransportConfig,
    pool: Pool,
    next_conn_id: AtomicU64,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Transport {
        let pool = Pool::new(&config);
        Transport {
            config,
            pool,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Close every idle connection in the pool. In-flight requests are
    /// unaffected.
    pub fn close_idle_connections(&self) {
        self.pool.close_idle();
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Send one request and return its response, without redirect or
    /// cookie handling (that is the [`Client`][crate::Client] layer).
    pub fn round_trip(&self, req: &mut Request) -> Result<Response, Error> {
        validate(req)?;

        let proxy = match req.url.scheme() {
            "http" | "https" => self.config.proxy.proxy_for(&req.url),
            _ => None,
        };
        let key = conn_key(&proxy, req);
        let target = ConnTarget {
            host: req.url.host_str().unwrap_or_default().to_string(),
            addr: util::host_port(&req.url),
            proxy,
            is_https: req.url.scheme() == "https",
        };

        let ctx = req.context.clone();
        loop {
            if ctx.is_canceled() {
                return Err(Error::RequestCanceled);
            }

            let dial = || {
                let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                PersistConn::connect(
                    key.clone(),
                    &target,
                    &self.config,
                    &ctx,
                    self.pool.shared_weak(),
                    id,
                )
            };
            let checkout = self.pool.get(&key, &ctx, &dial)?;
            let pconn = checkout.conn;
            let reused = checkout.reused;

            // request.cancel() must tear down exactly this conn.
            let hook_conn = pconn.clone();
            let hook_id = ctx.on_cancel(Box::new(move || hook_conn.cancel()));

            let body = req.next_body()?;
            let (rt, added_gzip) = self.build_round_trip(req, body, &key)?;

            match pconn.round_trip(rt) {
                Ok(inbound) => {
                    return Ok(self.assemble_response(req, &pconn, inbound, added_gzip, hook_id))
                }
                Err(e) => {
                    ctx.remove_hook(hook_id);
                    if should_retry(&e, req, reused) {
                        debug!("retrying {} {} after: {}", req.method, req.url, e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Serialize the request head and collect everything the conn needs
    /// for one attempt. Returns whether we added `Accept-Encoding:
    /// gzip` ourselves (which licenses transparent decoding).
    fn build_round_trip(
        &self,
        req: &Request,
        body: Option<SendBody>,
        key: &ConnKey,
    ) -> Result<(RoundTrip, bool), Error> {
        let cfg = &self.config;
        let headers = &req.headers;

        let user_chunked = headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let has_trailer = !req.trailer.is_empty();
        let body_len = body.as_ref().and_then(|b| b.content_length());
        let chunked = body.is_some() && (user_chunked || has_trailer || body_len.is_none());

        let added_gzip = cfg!(feature = "gzip")
            && !cfg.disable_compression
            && !headers.contains_key(http::header::ACCEPT_ENCODING)
            && req.method != Method::HEAD
            && !headers.contains_key(http::header::RANGE);

        let req_close = req.close || cfg.disable_keep_alives;

        // absolute-form target for plain http through a proxy,
        // origin-form otherwise.
        let absolute_form = key.proxy.is_some() && req.url.scheme() == "http";
        let target = request_target(req, absolute_form);

        let mut head = Vec::with_capacity(256);
        wire::begin_request_head(&mut head, &req.method, &target);

        let host = req
            .host
            .clone()
            .unwrap_or_else(|| util::host_header(&req.url));
        wire::push_header(&mut head, "host", host.as_bytes());

        for (name, value) in headers.iter() {
            if name == http::header::HOST {
                continue;
            }
            wire::push_header(&mut head, name.as_str(), value.as_bytes());
        }

        if !headers.contains_key(http::header::USER_AGENT) {
            wire::push_header(&mut head, "user-agent", DEFAULT_USER_AGENT.as_bytes());
        }
        if !headers.contains_key(http::header::ACCEPT) {
            wire::push_header(&mut head, "accept", b"*/*");
        }
        if req_close && !headers.contains_key(http::header::CONNECTION) {
            wire::push_header(&mut head, "connection", b"close");
        }
        if added_gzip {
            wire::push_header(&mut head, "accept-encoding", b"gzip");
        }
        if let Some(proxy) = proxy_auth_for(key, req) {
            if !headers.contains_key(http::header::PROXY_AUTHORIZATION) {
                wire::push_header(&mut head, "proxy-authorization", proxy.as_bytes());
            }
        }

        if chunked {
            if !user_chunked {
                wire::push_header(&mut head, "transfer-encoding", b"chunked");
            }
            if has_trailer {
                let names: Vec<&str> = req.trailer.keys().map(|k| k.as_str()).collect();
                wire::push_header(&mut head, "trailer", names.join(", ").as_bytes());
            }
        } else if !headers.contains_key(http::header::CONTENT_LENGTH) {
            match (&body, body_len) {
                (Some(_), Some(n)) => {
                    wire::push_header(&mut head, "content-length", n.to_string().as_bytes());
                }
                (None, _) => {
                    // bodyless POST family still announces zero.
                    let announces = req.method == Method::POST
                        || req.method == Method::PUT
                        || req.method == Method::PATCH;
                    if announces {
                        wire::push_header(&mut head, "content-length", b"0");
                    }
                }
                _ => {}
            }
        }
        wire::finish_request_head(&mut head);

        let expect_continue = body.is_some()
            && headers
                .get(http::header::EXPECT)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);

        let rt = RoundTrip {
            head,
            body,
            chunked,
            trailer: req.trailer.clone(),
            is_head: req.method == Method::HEAD,
            req_close,
            expect_continue,
            ctx: req.context.clone(),
            response_header_timeout: cfg.response_header_timeout,
            expect_continue_timeout: cfg
                .expect_continue_timeout
                .unwrap_or(Duration::from_secs(1)),
        };
        Ok((rt, added_gzip))
    }

    fn assemble_response(
        &self,
        req: &Request,
        pconn: &PersistConn,
        inbound: InboundResponse,
        added_gzip: bool,
        hook_id: u64,
    ) -> Response {
        let InboundResponse {
            head,
            mut content_length,
            transfer_encoding,
            close,
            body,
            trailer,
        } = inbound;
        let mut headers = head.headers;

        let ctx = req.context.clone();
        let guard = CancelGuard { ctx, hook_id };

        let mut uncompressed = false;
        let body = match body {
            None => {
                drop(guard);
                Body::empty()
            }
            Some(raw) => {
                let is_gzip = added_gzip
                    && headers
                        .get(http::header::CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
                        .unwrap_or(false);
                if is_gzip {
                    headers.remove(http::header::CONTENT_ENCODING);
                    headers.remove(http::header::CONTENT_LENGTH);
                    content_length = None;
                    uncompressed = true;
                    gzip_body(raw, guard)
                } else {
                    Body::plain(raw, Some(guard))
                }
            }
        };

        Response {
            status: head.status,
            version: head.version,
            headers,
            content_length,
            transfer_encoding,
            trailer,
            close,
            uncompressed,
            body,
            tls: pconn.shared.tls.clone(),
            request: Some(Box::new(req.clone_without_body())),
        }
    }
}

#[cfg(feature = "gzip")]
fn gzip_body(raw: crate::body::RawBody, guard: CancelGuard) -> Body {
    Body::gzip(raw, Some(guard))
}

#[cfg(not(feature = "gzip"))]
fn gzip_body(raw: crate::body::RawBody, guard: CancelGuard) -> Body {
    // without the gzip feature we never add Accept-Encoding, so this
    // path is unreachable; hand out the raw body unchanged.
    Body::plain(raw, Some(guard))
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish()
    }
}

fn validate(req: &Request) -> Result<(), Error> {
    match req.url.scheme() {
        "http" | "https" => {}
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    }
    if req.url.host_str().map(|h| h.is_empty()).unwrap_or(true) {
        return Err(Error::BadUrl(format!("{} is missing a host", req.url)));
    }
    if req.request_uri.is_some() {
        return Err(Error::RequestUriSet);
    }
    for (name, value) in req.headers.iter() {
        if !util::valid_header_name(name.as_str()) {
            return Err(Error::BadHeader(name.as_str().to_string()));
        }
        if !util::valid_header_value(value.as_bytes()) {
            return Err(Error::BadHeader(format!("value for {}", name)));
        }
    }
    Ok(())
}

fn conn_key(proxy: &Option<Proxy>, req: &Request) -> ConnKey {
    let scheme = req.url.scheme().to_string();
    // http through a proxy is multiplexed on the proxy conn; the
    // target moves into the request line instead.
    let addr = if proxy.is_some() && scheme == "http" {
        String::new()
    } else {
        util::host_port(&req.url)
    };
    ConnKey {
        proxy: proxy.as_ref().map(|p| p.key()),
        scheme,
        addr,
    }
}

fn proxy_auth_for(key: &ConnKey, req: &Request) -> Option<String> {
    // Only plain http carries credentials per-request; CONNECT tunnels
    // authenticated at dial time.
    if req.url.scheme() != "http" {
        return None;
    }
    let proxy_url = key.proxy.as_ref()?;
    Proxy::new(proxy_url).ok()?.authorization()
}

fn request_target(req: &Request, absolute_form: bool) -> String {
    if absolute_form {
        let mut url = req.url.clone();
        url.set_username("").ok();
        url.set_password(None).ok();
        url.set_fragment(None);
        return url.to_string();
    }
    let path = req.url.path();
    let path = if path.is_empty() { "/" } else { path };
    match req.url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

const IDEMPOTENT_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
];

fn is_idempotent(req: &Request) -> bool {
    IDEMPOTENT_METHODS.contains(&req.method)
        || req.headers.contains_key("idempotency-key")
        || req.headers.contains_key("x-idempotency-key")
}

/// Whether an attempt that failed with `err` may be transparently
/// replayed. Only errors proving the server never processed the request
/// qualify, only on a reused conn (a fresh dial failing the same way
/// would loop), and only when the body can be produced again.
fn should_retry(err: &Error, req: &Request, reused: bool) -> bool {
    if !reused || !req.is_replayable() {
        return false;
    }
    match err {
        // nothing reached the wire; safe for any method.
        Error::NothingWritten(_) => true,
        Error::ServerClosedIdle | Error::ReadFromServer(_) => is_idempotent(req),
        _ => false,
    }
}

/// A process-wide transport for the crate-level convenience calls.
pub(crate) fn default_transport() -> Arc<Transport> {
    static DEFAULT: once_cell::sync::Lazy<Mutex<Option<Arc<Transport>>>> =
        once_cell::sync::Lazy::new(|| Mutex::new(None));
    let mut lock = DEFAULT.lock().unwrap();
    lock.get_or_insert_with(|| Arc::new(Transport::new(TransportConfig::default())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_req(url: &str) -> Request {
        Request::new(Method::GET, url).unwrap()
    }

    #[test]
    fn retry_requires_reuse() {
        let req = get_req("http://example.com/");
        let err = Error::NothingWritten(Box::new(Error::ServerClosedIdle));
        assert!(should_retry(&err, &req, true));
        assert!(!should_retry(&err, &req, false));
    }

    #[test]
    fn post_only_retries_nothing_written() {
        let mut req = Request::new(Method::POST, "http://example.com/").unwrap();
        req.set_body(SendBody::from("data"));

        let nothing = Error::NothingWritten(Box::new(Error::ServerClosedIdle));
        assert!(should_retry(&nothing, &req, true));

        let read_err = Error::ReadFromServer(Box::new(Error::ServerClosedIdle));
        assert!(!should_retry(&read_err, &req, true));
    }

    #[test]
    fn idempotency_key_allows_post_retry() {
        let mut req = Request::new(Method::POST, "http://example.com/").unwrap();
        req.set_header("Idempotency-Key", "abc").unwrap();
        let read_err = Error::ReadFromServer(Box::new(Error::ServerClosedIdle));
        assert!(should_retry(&read_err, &req, true));
    }

    #[test]
    fn streaming_post_never_retries() {
        let mut req = Request::new(Method::POST, "http://example.com/").unwrap();
        req.set_body(SendBody::from_reader(&b"s"[..], Some(1)));
        let nothing = Error::NothingWritten(Box::new(Error::ServerClosedIdle));
        assert!(!should_retry(&nothing, &req, true));
    }

    #[test]
    fn key_clears_addr_for_proxied_http() {
        let proxy = Some(Proxy::new("http://localhost:3128").unwrap());
        let req = get_req("http://example.com/x");
        let key = conn_key(&proxy, &req);
        assert_eq!(key.addr, "");
        assert!(key.proxy.is_some());

        let req = get_req("https://example.com/x");
        let key = conn_key(&proxy, &req);
        assert_eq!(key.addr, "example.com:443");
    }

    #[test]
    fn validate_rejects_request_uri() {
        let mut req = get_req("http://example.com/");
        req.set_request_uri("/absolute");
        assert!(matches!(validate(&req), Err(Error::RequestUriSet)));
    }

    #[test]
    fn validate_rejects_bad_scheme() {
        let req = get_req("ftp://example.com/");
        assert!(matches!(validate(&req), Err(Error::UnsupportedScheme(_))));
    }

    #[test]
    fn origin_form_target() {
        let req = get_req("http://example.com/a/b?x=1");
        assert_eq!(request_target(&req, false), "/a/b?x=1");
        let req = get_req("http://user:pw@example.com/a");
        assert_eq!(request_target(&req, true), "http://example.com/a");
    }
}
