#![forbid(unsafe_code)]
#![warn(clippy::all)]
//! Pooled, persistent-connection HTTP/1.x client transport.
//!
//! httpool is the client-side core of HTTP/1.x: a [`Transport`] that
//! routes logical requests over reused or freshly-dialed TCP/TLS
//! connections, streams response bodies back to callers, and manages
//! the full connection lifecycle (idle recycling, keep-alive,
//! cancellation, retry and teardown). A thin [`Client`] on top applies
//! redirect policy, cookie jar interaction, Basic auth from url
//! userinfo, and Referer rules.
//!
//! Each connection runs a dedicated read loop and write loop on their
//! own threads, coordinating with the calling thread through channels.
//! The I/O is blocking throughout; there is no async runtime.
//!
//! # Usage
//!
//! One-shot calls go through a process-wide default client:
//!
//! ```no_run
//! let mut response = httpool::get("http://example.com/")?;
//! let body = response.body_mut().read_to_string()?;
//! # Ok::<(), httpool::Error>(())
//! ```
//!
//! For connection reuse across requests, cookies and configuration,
//! build a [`Client`] over your own [`Transport`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use httpool::{Client, ClientConfig, CookieJar, Transport, TransportConfig};
//!
//! let transport = Arc::new(Transport::new(TransportConfig {
//!     max_idle_conns_per_host: 4,
//!     response_header_timeout: Some(Duration::from_secs(15)),
//!     ..Default::default()
//! }));
//! let client = Client::with_config(
//!     transport,
//!     ClientConfig {
//!         cookie_jar: Some(Arc::new(CookieJar::new())),
//!         ..Default::default()
//!     },
//! );
//!
//! let response = client.get("http://example.com/")?;
//! // Drain or drop the body to hand the connection back to the pool.
//! # Ok::<(), httpool::Error>(())
//! ```
//!
//! # Bodies and connection reuse
//!
//! A [`Response`] body streams straight off the connection. The
//! connection returns to the idle pool once the body has been read to
//! EOF (or closed with only a small remainder left). Dropping a body
//! early is fine; it just costs the pooled connection.

#[macro_use]
extern crate log;

pub use http;

/// Re-exported cookie-crate; [`CookieJar`] speaks its `Cookie` type.
pub use cookie;

mod body;
mod client;
mod config;
mod conn;
mod context;
mod error;
mod jar;
mod pool;
mod proxy;
mod request;
mod response;
mod rtls;
mod send_body;
mod stream;
mod transport;
mod util;
mod wire;

#[cfg(test)]
mod test;
#[cfg(test)]
mod testserver;

pub use body::Body;
pub use client::Client;
pub use config::{CheckRedirect, ClientConfig, RedirectDecision, TransportConfig};
pub use context::Context;
pub use error::{Error, OpError, TimeoutKind};
pub use jar::{CookieJar, PublicSuffixList};
pub use proxy::{Proxy, ProxySelector};
pub use request::{GetBody, Request};
pub use response::Response;
pub use rtls::TlsInfo;
pub use send_body::SendBody;
pub use transport::Transport;

use once_cell::sync::Lazy;

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// GET a url on the process-wide default client.
pub fn get(url: &str) -> Result<Response, Error> {
    DEFAULT_CLIENT.get(url)
}

/// HEAD a url on the process-wide default client.
pub fn head(url: &str) -> Result<Response, Error> {
    DEFAULT_CLIENT.head(url)
}

/// POST a body on the process-wide default client.
pub fn post(url: &str, content_type: &str, body: impl Into<SendBody>) -> Result<Response, Error> {
    DEFAULT_CLIENT.post(url, content_type, body)
}

/// POST form pairs on the process-wide default client.
pub fn post_form(url: &str, form: &[(&str, &str)]) -> Result<Response, Error> {
    DEFAULT_CLIENT.post_form(url, form)
}
