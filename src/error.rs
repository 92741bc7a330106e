use std::fmt;
use std::io;

/// Errors surfaced by this crate.
///
/// The variants group into usage errors (bad url, invalid header),
/// network errors, protocol errors, timeouts and cancellation. Errors
/// returned from the [`Client`][crate::Client] operations are wrapped in
/// [`Error::Op`] carrying the operation name and the url.
#[derive(Debug)]
pub enum Error {
    /// The url could not be understood or is missing a host.
    BadUrl(String),
    /// The url scheme is not http or https.
    UnsupportedScheme(String),
    /// A header name or value that is not legal on the wire.
    BadHeader(String),
    /// `request_uri` is a server-side field and must be unset in client
    /// requests.
    RequestUriSet,
    /// Some unspecified `std::io::Error`.
    Io(io::Error),
    /// The request failed before a single byte reached the wire. Such
    /// requests are safe to retry regardless of method.
    NothingWritten(Box<Error>),
    /// The connection broke while a request was in flight.
    ConnectionBroken(Box<Error>),
    /// The server closed a pooled connection before the request was
    /// written to it.
    ServerClosedIdle,
    /// Reading the response from the server failed. Kept distinct from
    /// [`Error::Io`] so the dispatcher can classify it for retry.
    ReadFromServer(Box<Error>),
    /// The server spoke plain HTTP on a connection we negotiated TLS on.
    HttpsMismatch,
    /// The response head exceeded the configured size limit.
    HeadersTooLarge,
    /// A status line we could not parse.
    BadStatusLine(String),
    /// The proxy refused or garbled the CONNECT exchange.
    Proxy(String),
    /// TLS-level failure.
    Tls(rustls::Error),
    /// A timeout fired. Reported as both timeout and temporary.
    Timeout(TimeoutKind),
    /// The request context was canceled.
    RequestCanceled,
    /// The default redirect policy gave up.
    TooManyRedirects,
    /// An error wrapped with the client operation and url that caused it.
    Op(Box<OpError>),
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    TlsHandshake,
    ResponseHeader,
    Deadline,
}

/// Carrier for [`Error::Op`]: operation name ("Get", "Post", ...), the
/// url as a string, and the underlying cause.
#[derive(Debug)]
pub struct OpError {
    pub op: &'static str,
    pub url: String,
    pub source: Error,
}

impl Error {
    pub(crate) fn into_op(self, op: &'static str, url: &str) -> Error {
        match self {
            // don't double-wrap when a redirect hop already wrapped it.
            Error::Op(_) => self,
            source => Error::Op(Box::new(OpError {
                op,
                url: url.to_string(),
                source,
            })),
        }
    }

    /// Whether the error was ultimately caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            Error::NothingWritten(e)
            | Error::ConnectionBroken(e)
            | Error::ReadFromServer(e) => e.is_timeout(),
            Error::Op(op) => op.source.is_timeout(),
            _ => false,
        }
    }

    /// Whether retrying later could plausibly succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::ServerClosedIdle => true,
            Error::NothingWritten(_) => true,
            Error::Op(op) => op.source.is_temporary(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping dispatcher and client wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::NothingWritten(e)
            | Error::ConnectionBroken(e)
            | Error::ReadFromServer(e) => e.root_cause(),
            Error::Op(op) => op.source.root_cause(),
            _ => self,
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            Error::RequestCanceled => io::Error::new(io::ErrorKind::Other, "request canceled"),
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, self.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

// io::Error does not implement Clone. The read/write loops publish one
// error on two channels, so clone by reconstructing an equivalent error.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::BadUrl(s) => Error::BadUrl(s.clone()),
            Error::UnsupportedScheme(s) => Error::UnsupportedScheme(s.clone()),
            Error::BadHeader(s) => Error::BadHeader(s.clone()),
            Error::RequestUriSet => Error::RequestUriSet,
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::NothingWritten(e) => Error::NothingWritten(e.clone()),
            Error::ConnectionBroken(e) => Error::ConnectionBroken(e.clone()),
            Error::ServerClosedIdle => Error::ServerClosedIdle,
            Error::ReadFromServer(e) => Error::ReadFromServer(e.clone()),
            Error::HttpsMismatch => Error::HttpsMismatch,
            Error::HeadersTooLarge => Error::HeadersTooLarge,
            Error::BadStatusLine(s) => Error::BadStatusLine(s.clone()),
            Error::Proxy(s) => Error::Proxy(s.clone()),
            Error::Tls(e) => Error::Tls(e.clone()),
            Error::Timeout(k) => Error::Timeout(*k),
            Error::RequestCanceled => Error::RequestCanceled,
            Error::TooManyRedirects => Error::TooManyRedirects,
            Error::Op(op) => Error::Op(Box::new(OpError {
                op: op.op,
                url: op.url.clone(),
                source: op.source.clone(),
            })),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadUrl(s) => write!(f, "bad url: {}", s),
            Error::UnsupportedScheme(s) => write!(f, "unsupported scheme: {}", s),
            Error::BadHeader(s) => write!(f, "invalid header: {}", s),
            Error::RequestUriSet => write!(f, "request_uri must be empty in client requests"),
            Error::Io(e) => write!(f, "{}", e),
            Error::NothingWritten(e) => write!(f, "request not written: {}", e),
            Error::ConnectionBroken(e) => {
                write!(f, "HTTP/1.x transport connection broken: {}", e)
            }
            Error::ServerClosedIdle => write!(f, "server closed idle connection"),
            Error::ReadFromServer(e) => write!(f, "error reading from server: {}", e),
            Error::HttpsMismatch => {
                write!(f, "server gave HTTP response to HTTPS client")
            }
            Error::HeadersTooLarge => write!(f, "response headers exceeded limit"),
            Error::BadStatusLine(s) => write!(f, "bad status line: {:?}", s),
            Error::Proxy(s) => write!(f, "proxy: {}", s),
            Error::Tls(e) => write!(f, "tls: {}", e),
            Error::Timeout(kind) => match kind {
                TimeoutKind::Connect => write!(f, "timeout connecting"),
                TimeoutKind::TlsHandshake => write!(f, "timeout in TLS handshake"),
                TimeoutKind::ResponseHeader => write!(f, "timeout awaiting response headers"),
                TimeoutKind::Deadline => write!(f, "request deadline exceeded"),
            },
            Error::RequestCanceled => write!(f, "request canceled"),
            Error::TooManyRedirects => write!(f, "stopped after 10 redirects"),
            Error::Op(op) => write!(f, "{} {:?}: {}", op.op, op.url, op.source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::NothingWritten(e)
            | Error::ConnectionBroken(e)
            | Error::ReadFromServer(e) => Some(e.as_ref()),
            Error::Op(op) => Some(&op.source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Error {
        Error::Tls(err)
    }
}
