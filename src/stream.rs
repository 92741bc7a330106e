//! TCP dialing and the split read/write halves the connection loops own.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Instant;

use crate::config::DialHook;
use crate::context::Context;
use crate::error::{Error, TimeoutKind};
use crate::rtls::{TlsReadHalf, TlsWriteHalf};

/// Read side of a connection, owned by the read loop (and temporarily by
/// the response body while the caller drains it).
pub(crate) enum ReadHalf {
    Tcp(TcpStream),
    Tls(TlsReadHalf),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Tcp(sock) => sock.read(buf),
            ReadHalf::Tls(tls) => tls.read(buf),
        }
    }
}

/// Write side of a connection, owned by the write loop.
pub(crate) enum WriteHalf {
    Tcp(TcpStream),
    Tls(TlsWriteHalf),
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Tcp(sock) => sock.write(buf),
            WriteHalf::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Tcp(sock) => sock.flush(),
            WriteHalf::Tls(tls) => tls.flush(),
        }
    }
}

/// Handle that can tear a connection down from any thread. Shutting the
/// socket down unblocks both loops and any in-progress body read.
pub(crate) struct CloseHandle {
    sock: TcpStream,
}

impl CloseHandle {
    pub(crate) fn from_stream(sock: TcpStream) -> Self {
        CloseHandle { sock }
    }

    pub fn shutdown(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CloseHandle({:?})", self.sock.peer_addr().ok())
    }
}

/// Dial `addr` ("host:port"), honoring the context deadline and an
/// optional dial hook.
pub(crate) fn dial(ctx: &Context, addr: &str, hook: &Option<DialHook>) -> Result<TcpStream, Error> {
    if ctx.is_canceled() {
        return Err(Error::RequestCanceled);
    }
    let sock = match hook {
        Some(dial) => dial(ctx, addr)?,
        None => dial_tcp(ctx, addr)?,
    };
    sock.set_nodelay(true).ok();
    Ok(sock)
}

fn dial_tcp(ctx: &Context, addr: &str) -> Result<TcpStream, Error> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("dns lookup {}: {}", addr, e))))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", addr),
        )));
    }

    // Try each resolved address; the first to connect wins.
    let mut last_err = None;
    for sock_addr in addrs {
        let attempt = match ctx.deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout(TimeoutKind::Connect));
                }
                TcpStream::connect_timeout(&sock_addr, deadline - now)
            }
            None => TcpStream::connect(sock_addr),
        };
        match attempt {
            Ok(sock) => return Ok(sock),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => {
            Err(Error::Timeout(TimeoutKind::Connect))
        }
        Some(e) => Err(Error::Io(e)),
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", addr),
        ))),
    }
}

/// Split a plain TCP connection into loop-owned halves plus a close
/// handle. The clones share one socket.
pub(crate) fn split_tcp(sock: TcpStream) -> io::Result<(ReadHalf, WriteHalf, CloseHandle)> {
    let read = sock.try_clone()?;
    let close = sock.try_clone()?;
    Ok((
        ReadHalf::Tcp(read),
        WriteHalf::Tcp(sock),
        CloseHandle { sock: close },
    ))
}
