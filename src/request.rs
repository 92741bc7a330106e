//! The logical request handed to the client and transport.

use std::fmt;
use std::io;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::context::Context;
use crate::error::Error;
use crate::send_body::SendBody;

/// Factory producing a fresh copy of the request body, enabling retries
/// and 307/308 redirects for streaming bodies.
pub type GetBody = Arc<dyn Fn() -> io::Result<SendBody> + Send + Sync>;

/// An outgoing request.
///
/// ```
/// use httpool::{Request, SendBody};
/// use http::Method;
///
/// let mut req = Request::new(Method::POST, "http://example.com/ingest")?;
/// req.set_header("Content-Type", "text/plain")?;
/// req.set_body(SendBody::from("hello"));
/// # Ok::<(), httpool::Error>(())
/// ```
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<SendBody>,
    pub(crate) get_body: Option<GetBody>,
    pub(crate) close: bool,
    pub(crate) host: Option<String>,
    pub(crate) content_length: Option<u64>,
    pub(crate) request_uri: Option<String>,
    pub(crate) trailer: HeaderMap,
    pub(crate) context: Context,
    /// Whether a body was ever attached, surviving `body.take()` so the
    /// retry logic can tell "no body" from "body consumed".
    pub(crate) had_body: bool,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Request, Error> {
        let url: Url = url
            .parse()
            .map_err(|e| Error::BadUrl(format!("{}: {}", url, e)))?;
        Ok(Request::with_url(method, url))
    }

    pub fn with_url(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            get_body: None,
            close: false,
            host: None,
            content_length: None,
            request_uri: None,
            trailer: HeaderMap::new(),
            context: Context::new(),
            had_body: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header, replacing previous values for the name.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::BadHeader(name.to_string()))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| Error::BadHeader(format!("value for {}", name)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Attach a body. `Empty` and `Bytes` bodies automatically install a
    /// [`get_body`][Request::set_get_body] factory since they are
    /// trivially replayable.
    pub fn set_body(&mut self, body: SendBody) {
        self.had_body = !body.is_empty();
        self.content_length = body.content_length();
        if let SendBody::Bytes(b) = &body {
            let copy = b.clone();
            self.get_body = Some(Arc::new(move || Ok(SendBody::Bytes(copy.clone()))));
        }
        self.body = Some(body);
    }

    /// Install a factory producing fresh copies of the body.
    pub fn set_get_body(&mut self, get_body: GetBody) {
        self.get_body = Some(get_body);
    }

    /// Ask for `Connection: close` on this request.
    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Override the Host header (the url's host is still dialed).
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    /// Server-side field; setting it on a client request is a usage
    /// error the transport rejects.
    pub fn set_request_uri(&mut self, request_uri: impl Into<String>) {
        self.request_uri = Some(request_uri.into());
    }

    /// Declare request trailer fields, sent after a chunked body.
    pub fn trailer_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailer
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    /// The body for the next send attempt: the original body on the
    /// first attempt, a fresh copy from `get_body` afterwards.
    pub(crate) fn next_body(&mut self) -> Result<Option<SendBody>, Error> {
        if let Some(body) = self.body.take() {
            return Ok(Some(body));
        }
        if !self.had_body {
            return Ok(None);
        }
        match &self.get_body {
            Some(get_body) => Ok(Some(get_body().map_err(Error::Io)?)),
            None => Ok(None),
        }
    }

    /// Whether this request can safely be sent again.
    pub(crate) fn is_replayable(&self) -> bool {
        !self.had_body || self.get_body.is_some()
    }

    /// A copy of everything except the body, used for the redirect `via`
    /// chain and the response back-pointer.
    pub(crate) fn clone_without_body(&self) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: None,
            get_body: self.get_body.clone(),
            close: self.close,
            host: self.host.clone(),
            content_length: self.content_length,
            request_uri: self.request_uri.clone(),
            trailer: self.trailer.clone(),
            context: self.context.clone(),
            had_body: self.had_body,
        }
    }
}

// Debug lists only non-sensitive fields; header values can carry
// credentials.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("header_count", &self.headers.len())
            .field("close", &self.close)
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_body_installs_get_body() {
        let mut req = Request::new(Method::POST, "http://example.com/").unwrap();
        req.set_body(SendBody::from("data"));
        assert!(req.is_replayable());
        assert_eq!(req.content_length, Some(4));

        // first body is the original.
        let b1 = req.next_body().unwrap().unwrap();
        assert_eq!(b1.content_length(), Some(4));
        // second comes from the factory.
        let b2 = req.next_body().unwrap().unwrap();
        assert_eq!(b2.content_length(), Some(4));
    }

    #[test]
    fn reader_body_not_replayable() {
        let mut req = Request::new(Method::POST, "http://example.com/").unwrap();
        req.set_body(SendBody::from_reader(&b"stream"[..], Some(6)));
        assert!(!req.is_replayable());

        req.next_body().unwrap().unwrap();
        // consumed and no factory: nothing left to send.
        assert!(req.next_body().unwrap().is_none());
    }

    #[test]
    fn no_body_is_replayable() {
        let req = Request::new(Method::GET, "http://example.com/").unwrap();
        assert!(req.is_replayable());
    }
}
