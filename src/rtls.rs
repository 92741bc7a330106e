//! TLS via rustls.
//!
//! The read and write loops need independent blocking access to the same
//! TLS session. rustls itself is sans-io, so the session state lives
//! behind a mutex while each half does its socket I/O on a cloned
//! `TcpStream` without holding the session lock. Lock order is always
//! session, then write socket.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rustls::{ClientConnection, RootCertStore};
use rustls_pki_types::ServerName;

use crate::error::{Error, TimeoutKind};
use crate::stream::CloseHandle;

/// TLS details of an established HTTPS connection, surfaced on the
/// response.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// SNI name the certificate was verified against.
    pub server_name: String,
    /// Negotiated protocol version, e.g. "TLSv1.3".
    pub protocol: Option<&'static str>,
}

static DEFAULT_TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

pub(crate) fn default_tls_config() -> Arc<rustls::ClientConfig> {
    DEFAULT_TLS_CONFIG.clone()
}

struct TlsShared {
    conn: Mutex<ClientConnection>,
    wsock: Mutex<TcpStream>,
}

pub(crate) struct TlsReadHalf {
    shared: Arc<TlsShared>,
    rsock: TcpStream,
}

pub(crate) struct TlsWriteHalf {
    shared: Arc<TlsShared>,
}

/// Perform the TLS handshake on `sock` within `timeout`, returning split
/// halves. Detects a plaintext HTTP server answering on the port: the
/// first five response bytes being `HTTP/` is not a TLS record.
pub(crate) fn handshake(
    sock: TcpStream,
    server_name: &str,
    config: Arc<rustls::ClientConfig>,
    timeout: Option<Duration>,
) -> Result<(TlsReadHalf, TlsWriteHalf, CloseHandle, TlsInfo), Error> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| Error::BadUrl(format!("invalid tls name: {}", server_name)))?;
    let mut conn = ClientConnection::new(config, name)?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut sock = sock;
    let mut first = [0u8; 5];
    let mut first_len = 0usize;

    while conn.is_handshaking() {
        while conn.wants_write() {
            write_tls_records(&mut conn, &mut sock, deadline)?;
        }
        if !conn.is_handshaking() {
            break;
        }
        if conn.wants_read() {
            set_read_deadline(&sock, deadline)?;
            let mut buf = [0u8; 16 * 1024];
            let n = match sock.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed during tls handshake",
                    )))
                }
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout(TimeoutKind::TlsHandshake))
                }
                Err(e) => return Err(Error::Io(e)),
            };
            if first_len < first.len() {
                let take = (first.len() - first_len).min(n);
                first[first_len..first_len + take].copy_from_slice(&buf[..take]);
                first_len += take;
            }
            let mut rd = &buf[..n];
            while !rd.is_empty() {
                if conn.read_tls(&mut rd)? == 0 {
                    break;
                }
                if let Err(e) = conn.process_new_packets() {
                    if &first == b"HTTP/" {
                        return Err(Error::HttpsMismatch);
                    }
                    // let the alert out, best effort.
                    let _ = conn.write_tls(&mut sock);
                    return Err(Error::Tls(e));
                }
            }
        }
    }
    while conn.wants_write() {
        write_tls_records(&mut conn, &mut sock, deadline)?;
    }

    sock.set_read_timeout(None).ok();
    sock.set_write_timeout(None).ok();

    let info = TlsInfo {
        server_name: server_name.to_string(),
        protocol: conn.protocol_version().map(|v| match v {
            rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
            rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
            _ => "unknown",
        }),
    };

    let rsock = sock.try_clone().map_err(Error::Io)?;
    let csock = sock.try_clone().map_err(Error::Io)?;
    let shared = Arc::new(TlsShared {
        conn: Mutex::new(conn),
        wsock: Mutex::new(sock),
    });
    Ok((
        TlsReadHalf {
            shared: shared.clone(),
            rsock,
        },
        TlsWriteHalf { shared },
        CloseHandle::from_stream(csock),
        info,
    ))
}

fn set_read_deadline(sock: &TcpStream, deadline: Option<Instant>) -> Result<(), Error> {
    if let Some(d) = deadline {
        let now = Instant::now();
        if now >= d {
            return Err(Error::Timeout(TimeoutKind::TlsHandshake));
        }
        sock.set_read_timeout(Some(d - now)).ok();
    }
    Ok(())
}

fn write_tls_records(
    conn: &mut ClientConnection,
    sock: &mut TcpStream,
    deadline: Option<Instant>,
) -> Result<(), Error> {
    if let Some(d) = deadline {
        let now = Instant::now();
        if now >= d {
            return Err(Error::Timeout(TimeoutKind::TlsHandshake));
        }
        sock.set_write_timeout(Some(d - now)).ok();
    }
    match conn.write_tls(sock) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            Err(Error::Timeout(TimeoutKind::TlsHandshake))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

impl TlsShared {
    /// Push any pending TLS records (application data, alerts, key
    /// updates) to the socket. Called with the session lock held.
    fn flush_tls(&self, conn: &mut ClientConnection) -> io::Result<()> {
        while conn.wants_write() {
            let mut wsock = self.wsock.lock().unwrap();
            conn.write_tls(&mut *wsock)?;
        }
        Ok(())
    }
}

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut conn = self.shared.conn.lock().unwrap();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(e),
                }
            }
            // No plaintext buffered. Read TLS records without holding
            // the session lock so the write half stays responsive.
            let mut tmp = [0u8; 16 * 1024];
            let n = self.rsock.read(&mut tmp)?;
            let mut conn = self.shared.conn.lock().unwrap();
            if n == 0 {
                // signal EOF to the session, then drain what remains.
                let _ = conn.read_tls(&mut io::empty())?;
            } else {
                let mut rd = &tmp[..n];
                while !rd.is_empty() {
                    if conn.read_tls(&mut rd)? == 0 {
                        break;
                    }
                }
            }
            conn.process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.shared.flush_tls(&mut conn)?;
            if n == 0 {
                return match conn.reader().read(buf) {
                    Ok(m) => Ok(m),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                    Err(e) => Err(e),
                };
            }
        }
    }
}

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = self.shared.conn.lock().unwrap();
        let n = conn.writer().write(buf)?;
        self.shared.flush_tls(&mut conn)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut conn = self.shared.conn.lock().unwrap();
        self.shared.flush_tls(&mut conn)?;
        self.shared.wsock.lock().unwrap().flush()
    }
}
