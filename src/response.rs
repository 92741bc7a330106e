//! The logical response handed back to callers.

use std::fmt;
use std::sync::{Arc, Mutex};

use http::header::HeaderMap;
use http::{StatusCode, Version};

use crate::body::Body;
use crate::request::Request;
use crate::rtls::TlsInfo;

/// A received response.
///
/// The body streams from the connection; it must be drained or closed
/// (dropping it closes it) before the underlying connection can be
/// reused.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) content_length: Option<u64>,
    pub(crate) transfer_encoding: Vec<String>,
    pub(crate) trailer: Arc<Mutex<HeaderMap>>,
    pub(crate) close: bool,
    pub(crate) uncompressed: bool,
    pub(crate) body: Body,
    pub(crate) tls: Option<TlsInfo>,
    pub(crate) request: Option<Box<Request>>,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value for the named header, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values for the named header.
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Declared body length. `None` when unknown (chunked or
    /// read-until-close, or after transparent decompression).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn transfer_encoding(&self) -> &[String] {
        &self.transfer_encoding
    }

    /// Trailer fields. Populated once the body has been read to EOF.
    pub fn trailer(&self) -> HeaderMap {
        self.trailer.lock().unwrap().clone()
    }

    /// Whether the server demanded this connection close.
    pub fn close(&self) -> bool {
        self.close
    }

    /// True when the transport transparently gunzipped the body. The
    /// `Content-Encoding` and `Content-Length` headers are removed in
    /// that case.
    pub fn uncompressed(&self) -> bool {
        self.uncompressed
    }

    /// TLS details, present on https responses.
    pub fn tls(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// The request that produced this response. After redirects this is
    /// the last request issued.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("content_length", &self.content_length)
            .field("close", &self.close)
            .field("uncompressed", &self.uncompressed)
            .finish()
    }
}
