//! Request bodies.

use std::fmt;
use std::io::{self, Read, Write};

/// The body of an outgoing request.
///
/// `Empty` and `Bytes` bodies are inherently replayable for retries and
/// 307/308 redirects. A `Reader` body is consumed by sending it; it can
/// only be replayed if the request carries a
/// [`get_body`][crate::Request::set_get_body] factory.
pub enum SendBody {
    Empty,
    Bytes(Vec<u8>),
    /// A streaming body with a known length, or `None` for chunked
    /// transfer encoding.
    Reader(Box<dyn Read + Send>, Option<u64>),
}

impl SendBody {
    pub fn from_reader(reader: impl Read + Send + 'static, len: Option<u64>) -> Self {
        SendBody::Reader(Box::new(reader), len)
    }

    /// The exact byte length, when known. `None` means the body will be
    /// sent chunked.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match self {
            SendBody::Empty => Some(0),
            SendBody::Bytes(b) => Some(b.len() as u64),
            SendBody::Reader(_, len) => *len,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, SendBody::Empty)
            || matches!(self, SendBody::Bytes(b) if b.is_empty())
    }

    /// Send the body. `chunked` picks the transfer encoding; the head
    /// already announced it.
    pub(crate) fn write_to<W: Write + ?Sized>(self, w: &mut W, chunked: bool) -> io::Result<()> {
        match self {
            SendBody::Empty => Ok(()),
            SendBody::Bytes(b) => {
                if chunked {
                    write_chunked(&mut &b[..], w)
                } else {
                    w.write_all(&b)
                }
            }
            SendBody::Reader(mut r, _) => {
                if chunked {
                    write_chunked(&mut r, w)
                } else {
                    pipe(&mut r, w)
                }
            }
        }
    }
}

fn pipe<R: Read + ?Sized, W: Write + ?Sized>(r: &mut R, w: &mut W) -> io::Result<()> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n])?;
    }
}

/// Chunked transfer encoding of the data chunks. The terminating zero
/// chunk (and any request trailer) is written by the write loop after
/// this returns.
fn write_chunked<R: Read + ?Sized, W: Write + ?Sized>(r: &mut R, w: &mut W) -> io::Result<()> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        write!(w, "{:x}\r\n", n)?;
        w.write_all(&buf[..n])?;
        w.write_all(b"\r\n")?;
    }
}

impl fmt::Debug for SendBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendBody::Empty => write!(f, "SendBody::Empty"),
            SendBody::Bytes(b) => write!(f, "SendBody::Bytes({} bytes)", b.len()),
            SendBody::Reader(_, len) => write!(f, "SendBody::Reader(len: {:?})", len),
        }
    }
}

impl From<&str> for SendBody {
    fn from(s: &str) -> Self {
        SendBody::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for SendBody {
    fn from(s: String) -> Self {
        SendBody::Bytes(s.into_bytes())
    }
}

impl From<&[u8]> for SendBody {
    fn from(b: &[u8]) -> Self {
        SendBody::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for SendBody {
    fn from(b: Vec<u8>) -> Self {
        SendBody::Bytes(b)
    }
}

impl From<()> for SendBody {
    fn from(_: ()) -> Self {
        SendBody::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_encoding() {
        let mut out = Vec::new();
        let body = SendBody::Bytes(b"hello world".to_vec());
        body.write_to(&mut out, true).unwrap();
        assert_eq!(out, b"b\r\nhello world\r\n");
    }

    #[test]
    fn plain_write() {
        let mut out = Vec::new();
        let body: SendBody = "abc".into();
        assert_eq!(body.content_length(), Some(3));
        body.write_to(&mut out, false).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn reader_unknown_length() {
        let body = SendBody::from_reader(&b"xyz"[..], None);
        assert_eq!(body.content_length(), None);
        let mut out = Vec::new();
        body.write_to(&mut out, true).unwrap();
        assert_eq!(out, b"3\r\nxyz\r\n");
    }
}
