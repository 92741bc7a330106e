//! A real TCP server for tests: binds port 0, runs a handler per
//! accepted connection on its own thread, and counts accepted
//! connections so tests can assert on dial behavior.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct TestServer {
    pub port: u16,
    done: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn new<H>(handler: H) -> Self
    where
        H: Fn(TcpStream) -> io::Result<()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let done = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));

        let done2 = done.clone();
        let accepted2 = accepted.clone();
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        eprintln!("testserver accept: {}", e);
                        break;
                    }
                };
                if done2.load(Ordering::SeqCst) {
                    break;
                }
                accepted2.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                thread::spawn(move || {
                    if let Err(e) = handler(stream) {
                        // connection teardown mid-handler is routine.
                        if e.kind() != io::ErrorKind::UnexpectedEof {
                            eprintln!("testserver handler: {}", e);
                        }
                    }
                });
            }
        });

        // make sure the accept loop is running before returning.
        while let Err(e) = TcpStream::connect(("127.0.0.1", port)) {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            eprintln!("testserver pre-connect: {}", e);
            break;
        }

        TestServer {
            port,
            done,
            accepted,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Connections accepted, minus the readiness probe in `new`.
    pub fn dials(&self) -> usize {
        self.accepted.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

/// One parsed request off the wire.
pub struct TestRequest {
    pub line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestRequest {
    pub fn method(&self) -> &str {
        self.line.split(' ').next().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.line.split(' ').nth(1).unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// Read one request (head + content-length body) off the reader.
/// `None` when the client closed the connection.
pub fn read_request(reader: &mut BufReader<TcpStream>) -> Option<TestRequest> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let line = line.trim_end().to_string();

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).ok()?;
    }

    Some(TestRequest {
        line,
        headers,
        body,
    })
}

/// Write a minimal response with a content-length body.
pub fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[&str],
    body: &[u8],
) -> io::Result<()> {
    write!(stream, "HTTP/1.1 {} {}\r\n", status, reason)?;
    for h in headers {
        write!(stream, "{}\r\n", h)?;
    }
    write!(stream, "Content-Length: {}\r\n\r\n", body.len())?;
    stream.write_all(body)?;
    stream.flush()
}

/// A handler serving every request on the connection with the same
/// response.
pub fn serve_all(
    status: u16,
    headers: Vec<String>,
    body: Vec<u8>,
) -> impl Fn(TcpStream) -> io::Result<()> + Send + Sync + 'static {
    move |stream: TcpStream| {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut out = stream;
        while read_request(&mut reader).is_some() {
            let hdrs: Vec<&str> = headers.iter().map(|s| s.as_str()).collect();
            write_response(&mut out, status, "OK", &hdrs, &body)?;
        }
        Ok(())
    }
}
