//! HTTP/1.x wire format: request head serialization, response head
//! parsing (via httparse) and body framing readers.

use std::io::{self, BufRead, Read, Write};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::error::Error;
use crate::util::canonical_header_key;

/// Parsed status line and headers of a response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Read a response head (status line + headers + terminating blank
/// line) from `r`. Never consumes past the blank line. `limit` bounds
/// the total head size.
pub(crate) fn read_response_head<R: BufRead + ?Sized>(
    r: &mut R,
    limit: usize,
) -> Result<ResponseHead, Error> {
    let mut head: Vec<u8> = Vec::with_capacity(512);

    'outer: loop {
        let avail = match r.fill_buf() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        if avail.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            )));
        }
        let mut used = 0;
        for &b in avail {
            head.push(b);
            used += 1;
            if head.len() > limit {
                r.consume(used);
                return Err(Error::HeadersTooLarge);
            }
            if head.ends_with(b"\r\n\r\n") {
                r.consume(used);
                break 'outer;
            }
        }
        r.consume(used);
    }

    parse_response_head(&head)
}

fn parse_response_head(head: &[u8]) -> Result<ResponseHead, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; 256];
    let mut parsed = httparse::Response::new(&mut header_buf);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::BadStatusLine(excerpt(head)));
        }
        Err(httparse::Error::TooManyHeaders) => return Err(Error::HeadersTooLarge),
        Err(_) => return Err(Error::BadStatusLine(excerpt(head))),
    }

    let code = parsed.code.ok_or_else(|| Error::BadStatusLine(excerpt(head)))?;
    let status = StatusCode::from_u16(code).map_err(|_| Error::BadStatusLine(excerpt(head)))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = match HeaderName::from_bytes(h.name.as_bytes()) {
            Ok(n) => n,
            Err(_) => {
                debug!("dropping malformed header name {:?}", h.name);
                continue;
            }
        };
        let value = match HeaderValue::from_bytes(h.value) {
            Ok(v) => v,
            Err(_) => {
                debug!("dropping malformed value for header {}", name);
                continue;
            }
        };
        headers.append(name, value);
    }

    Ok(ResponseHead {
        status,
        version,
        headers,
    })
}

fn excerpt(head: &[u8]) -> String {
    let line = head.split(|&b| b == b'\n').next().unwrap_or(head);
    String::from_utf8_lossy(line).trim_end().chars().take(80).collect()
}

/// How the response body is delimited on the wire.
#[derive(Debug)]
pub(crate) enum Framing {
    /// No body follows the head.
    None,
    /// Exactly `remaining` more bytes.
    Length { remaining: u64 },
    /// Chunked transfer coding, with optional trailer.
    Chunked(Chunked),
    /// Body runs until the server closes the connection.
    UntilClose,
}

#[derive(Debug)]
pub(crate) struct FramingInfo {
    pub framing: Framing,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    /// The response demands the connection be closed after the body.
    pub close: bool,
}

pub(crate) fn response_framing(
    is_head: bool,
    status: StatusCode,
    version: Version,
    headers: &HeaderMap,
) -> FramingInfo {
    let close = wants_close(version, headers);

    let transfer_encoding: Vec<String> = headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let chunked = transfer_encoding.iter().any(|t| t == "chunked");

    let content_length = if chunked {
        // Transfer-Encoding wins over Content-Length.
        None
    } else {
        headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    let bodyless_status = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let framing = if is_head || bodyless_status {
        Framing::None
    } else if chunked {
        Framing::Chunked(Chunked::new())
    } else {
        match content_length {
            Some(0) => Framing::None,
            Some(n) => Framing::Length { remaining: n },
            None => Framing::UntilClose,
        }
    };

    FramingInfo {
        framing,
        content_length,
        transfer_encoding,
        close,
    }
}

fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    for v in headers.get_all(http::header::CONNECTION) {
        if let Ok(v) = v.to_str() {
            for token in v.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }
    }
    close || (version == Version::HTTP_10 && !keep_alive)
}

impl Framing {
    pub fn has_body(&self) -> bool {
        !matches!(self, Framing::None)
    }

    /// Whether reaching natural EOF leaves the connection positioned at
    /// the next response, i.e. reusable.
    pub fn allows_reuse(&self) -> bool {
        !matches!(self, Framing::UntilClose)
    }

    /// Read decoded body bytes. `Ok(0)` means the body is complete (or,
    /// for [`Framing::UntilClose`], the server closed).
    pub fn read<R: BufRead + ?Sized>(
        &mut self,
        r: &mut R,
        buf: &mut [u8],
        trailer: &mut HeaderMap,
    ) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self {
            Framing::None => Ok(0),
            Framing::UntilClose => r.read(buf),
            Framing::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let max = (*remaining).min(buf.len() as u64) as usize;
                let n = r.read(&mut buf[..max])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before full body",
                    ));
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Framing::Chunked(chunked) => chunked.read(r, buf, trailer),
        }
    }
}

/// Chunked transfer decoder, driving an external `BufRead`.
#[derive(Debug)]
pub(crate) struct Chunked {
    phase: ChunkPhase,
}

#[derive(Debug, PartialEq)]
enum ChunkPhase {
    /// At a chunk-size line.
    Size,
    /// Inside chunk data, this many bytes left.
    Data(u64),
    /// Between chunk data and the following CRLF.
    DataEnd,
    /// Reading trailer lines after the zero chunk.
    Trailer,
    Done,
}

impl Chunked {
    pub fn new() -> Self {
        Chunked {
            phase: ChunkPhase::Size,
        }
    }

    fn read<R: BufRead + ?Sized>(
        &mut self,
        r: &mut R,
        buf: &mut [u8],
        trailer: &mut HeaderMap,
    ) -> io::Result<usize> {
        loop {
            match self.phase {
                ChunkPhase::Done => return Ok(0),
                ChunkPhase::Size => {
                    let line = read_line(r, 256)?;
                    // chunk extensions after ';' are ignored.
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_part, 16).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad chunk size line {:?}", line),
                        )
                    })?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailer;
                    } else {
                        self.phase = ChunkPhase::Data(size);
                    }
                }
                ChunkPhase::Data(remaining) => {
                    let max = remaining.min(buf.len() as u64) as usize;
                    let n = r.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunk",
                        ));
                    }
                    let left = remaining - n as u64;
                    self.phase = if left == 0 {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(left)
                    };
                    return Ok(n);
                }
                ChunkPhase::DataEnd => {
                    let line = read_line(r, 2)?;
                    if !line.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk",
                        ));
                    }
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    let line = read_line(r, 8 * 1024)?;
                    if line.is_empty() {
                        self.phase = ChunkPhase::Done;
                        return Ok(0);
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        let name = HeaderName::from_bytes(name.trim().as_bytes());
                        let value = HeaderValue::from_str(value.trim());
                        if let (Ok(name), Ok(value)) = (name, value) {
                            trailer.append(name, value);
                        }
                    }
                }
            }
        }
    }
}

/// Read one CRLF (or bare LF) terminated line, excluding the
/// terminator. `max` bounds the line length.
fn read_line<R: BufRead + ?Sized>(r: &mut R, max: usize) -> io::Result<String> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = r.read(&mut byte)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid line",
            ));
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 line"));
        }
        if line.len() > max {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        line.push(byte[0]);
    }
}

/// Start a request head: `METHOD SP target SP HTTP/1.1 CRLF`.
pub(crate) fn begin_request_head(buf: &mut Vec<u8>, method: &Method, target: &str) {
    let _ = write!(buf, "{} {} HTTP/1.1\r\n", method, target);
}

/// Append one header field, canonicalizing the name for the wire.
pub(crate) fn push_header(buf: &mut Vec<u8>, name: &str, value: &[u8]) {
    let _ = write!(buf, "{}: ", canonical_header_key(name));
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

pub(crate) fn finish_request_head(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn parse_simple_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nX-Foo: bar\r\n\r\nabc";
        let mut r = BufReader::new(&raw[..]);
        let head = read_response_head(&mut r, 1024).unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("x-foo").unwrap(), "bar");
        // body bytes are not consumed.
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut r, &mut rest).unwrap();
        assert_eq!(rest, "abc");
    }

    #[test]
    fn head_limit_enforced() {
        let raw = b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let err = read_response_head(&mut r, 20).unwrap_err();
        assert!(matches!(err, Error::HeadersTooLarge));
    }

    #[test]
    fn bad_status_line() {
        let raw = b"FTP/1.1 whatever\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let err = read_response_head(&mut r, 1024).unwrap_err();
        assert!(matches!(err, Error::BadStatusLine(_)));
    }

    #[test]
    fn framing_chunked_wins_over_length() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-length", "42".parse().unwrap());
        let info = response_framing(false, StatusCode::OK, Version::HTTP_11, &headers);
        assert!(matches!(info.framing, Framing::Chunked(_)));
        assert_eq!(info.content_length, None);
    }

    #[test]
    fn framing_head_has_no_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "42".parse().unwrap());
        let info = response_framing(true, StatusCode::OK, Version::HTTP_11, &headers);
        assert!(!info.framing.has_body());
        assert_eq!(info.content_length, Some(42));
    }

    #[test]
    fn framing_until_close() {
        let headers = HeaderMap::new();
        let info = response_framing(false, StatusCode::OK, Version::HTTP_11, &headers);
        assert!(matches!(info.framing, Framing::UntilClose));
        assert!(!info.framing.allows_reuse());
    }

    #[test]
    fn framing_http10_closes() {
        let headers = HeaderMap::new();
        let info = response_framing(false, StatusCode::OK, Version::HTTP_10, &headers);
        assert!(info.close);
    }

    #[test]
    fn chunked_decode_with_trailer() {
        let raw = b"3\r\nhel\r\nb\r\nlo world!!!\r\n0\r\nX-Check: sum\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let mut framing = Framing::Chunked(Chunked::new());
        let mut trailer = HeaderMap::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = framing.read(&mut r, &mut buf, &mut trailer).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world!!!");
        assert_eq!(trailer.get("x-check").unwrap(), "sum");
    }

    #[test]
    fn fixed_length_decode() {
        let raw = b"hello leftover";
        let mut r = BufReader::new(&raw[..]);
        let mut framing = Framing::Length { remaining: 5 };
        let mut trailer = HeaderMap::new();
        let mut buf = [0u8; 16];
        let n = framing.read(&mut r, &mut buf, &mut trailer).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = framing.read(&mut r, &mut buf, &mut trailer).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn length_eof_early_is_error() {
        let raw = b"he";
        let mut r = BufReader::new(&raw[..]);
        let mut framing = Framing::Length { remaining: 5 };
        let mut trailer = HeaderMap::new();
        let mut buf = [0u8; 16];
        framing.read(&mut r, &mut buf, &mut trailer).unwrap();
        let err = framing.read(&mut r, &mut buf, &mut trailer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn request_head_canonical_names() {
        let mut buf = Vec::new();
        begin_request_head(&mut buf, &Method::GET, "/x?q=1");
        push_header(&mut buf, "host", b"example.com");
        push_header(&mut buf, "accept-encoding", b"gzip");
        finish_request_head(&mut buf);
        let s = String::from_utf8(buf).unwrap();
        assert_eq!(
            s,
            "GET /x?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept-Encoding: gzip\r\n\r\n"
        );
    }
}
