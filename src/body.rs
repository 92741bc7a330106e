//! Response body wrappers.
//!
//! A body handed to the caller layers three concerns: wire framing
//! (fixed length, chunked or until-close), completion signaling back to
//! the connection's read loop, and optional transparent gzip. The read
//! loop lends the connection's buffered reader to the body and gets it
//! back, along with an eof flag, through a channel once the caller
//! drains or closes the body.

use std::io::{self, BufReader, Read};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use http::HeaderMap;

use crate::context::Context;
use crate::stream::ReadHalf;
use crate::wire::Framing;

#[cfg(feature = "gzip")]
use flate2::read::MultiGzDecoder;

/// Message returning the connection reader to the read loop.
pub(crate) struct BodyDone {
    pub reader: Option<BufReader<ReadHalf>>,
    /// The body reached its natural end.
    pub eof: bool,
    /// The conn is positioned at the next response and may be pooled.
    pub reusable: bool,
}

/// Error returned by reads on a closed body.
pub(crate) const ERR_BODY_READ_AFTER_CLOSE: &str = "read of closed response body";

/// How much we are willing to read on close to finish off a nearly-done
/// body, buying connection reuse.
const CLOSE_DRAIN_LIMIT: u64 = 2048;

#[derive(PartialEq)]
enum RawState {
    Open,
    Eof,
    Closed,
}

/// Framing + signaling wrapper around the connection's reader.
pub(crate) struct RawBody {
    reader: Option<BufReader<ReadHalf>>,
    framing: Framing,
    trailer: Arc<Mutex<HeaderMap>>,
    done_tx: Sender<BodyDone>,
    ctx: Context,
    state: RawState,
}

impl RawBody {
    pub(crate) fn new(
        reader: BufReader<ReadHalf>,
        framing: Framing,
        trailer: Arc<Mutex<HeaderMap>>,
        done_tx: Sender<BodyDone>,
        ctx: Context,
    ) -> Self {
        RawBody {
            reader: Some(reader),
            framing,
            trailer,
            done_tx,
            ctx,
            state: RawState::Open,
        }
    }

    fn signal(&mut self, eof: bool) {
        let reusable = eof && self.framing.allows_reuse();
        let done = BodyDone {
            reader: self.reader.take(),
            eof,
            reusable,
        };
        let _ = self.done_tx.send(done);
    }

    /// Close before EOF. A small remainder is drained to allow the
    /// connection back into the pool; anything larger forfeits reuse.
    pub(crate) fn close(&mut self) {
        match self.state {
            RawState::Closed | RawState::Eof => {
                self.state = RawState::Closed;
                return;
            }
            RawState::Open => {}
        }
        self.state = RawState::Closed;

        let mut drained = 0u64;
        let mut buf = [0u8; 512];
        loop {
            if drained >= CLOSE_DRAIN_LIMIT {
                self.signal(false);
                return;
            }
            match self.read_framed(&mut buf) {
                Ok(0) => {
                    self.signal(true);
                    return;
                }
                Ok(n) => drained += n as u64,
                Err(_) => {
                    self.signal(false);
                    return;
                }
            }
        }
    }

    fn read_framed(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(0),
        };
        let mut trailer = self.trailer.lock().unwrap();
        self.framing.read(reader, buf, &mut trailer)
    }
}

impl Read for RawBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            RawState::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    ERR_BODY_READ_AFTER_CLOSE,
                ))
            }
            RawState::Eof => return Ok(0),
            RawState::Open => {}
        }
        match self.read_framed(buf) {
            Ok(0) => {
                self.state = RawState::Eof;
                self.signal(true);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                // The cancel hook tears the socket down; surface the
                // cancellation rather than the resulting read error.
                let e = if self.ctx.is_canceled() {
                    io::Error::new(io::ErrorKind::Other, "request canceled")
                } else {
                    e
                };
                self.state = RawState::Closed;
                self.signal(false);
                Err(e)
            }
        }
    }
}

impl Drop for RawBody {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes the transport's cancel hook from the request context once
/// the body is finished with.
pub(crate) struct CancelGuard {
    pub ctx: Context,
    pub hook_id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.ctx.remove_hook(self.hook_id);
    }
}

enum BodyInner {
    Empty,
    Plain(RawBody),
    #[cfg(feature = "gzip")]
    Gzip(Box<MultiGzDecoder<RawBody>>),
}

/// The streaming body of a [`Response`][crate::Response].
///
/// Dropping the body closes it; closing before the body is drained may
/// cost the connection its place in the pool. Reading after
/// [`close`][Body::close] returns a stable error.
pub struct Body {
    inner: BodyInner,
    closed: bool,
    _guard: Option<CancelGuard>,
}

impl Body {
    pub(crate) fn empty() -> Body {
        Body {
            inner: BodyInner::Empty,
            closed: false,
            _guard: None,
        }
    }

    pub(crate) fn plain(raw: RawBody, guard: Option<CancelGuard>) -> Body {
        Body {
            inner: BodyInner::Plain(raw),
            closed: false,
            _guard: guard,
        }
    }

    #[cfg(feature = "gzip")]
    pub(crate) fn gzip(raw: RawBody, guard: Option<CancelGuard>) -> Body {
        Body {
            inner: BodyInner::Gzip(Box::new(MultiGzDecoder::new(raw))),
            closed: false,
            _guard: guard,
        }
    }

    /// Close the body. Idempotent. Reads after this fail.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.inner {
            BodyInner::Empty => {}
            BodyInner::Plain(raw) => raw.close(),
            #[cfg(feature = "gzip")]
            BodyInner::Gzip(dec) => dec.get_mut().close(),
        }
        self._guard = None;
    }

    /// Read the remaining body to a string.
    pub fn read_to_string(&mut self) -> io::Result<String> {
        let mut s = String::new();
        Read::read_to_string(self, &mut s)?;
        Ok(s)
    }

    /// Read the remaining body to a byte vector.
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut v = Vec::new();
        Read::read_to_end(self, &mut v)?;
        Ok(v)
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                ERR_BODY_READ_AFTER_CLOSE,
            ));
        }
        match &mut self.inner {
            BodyInner::Empty => Ok(0),
            BodyInner::Plain(raw) => raw.read(buf),
            #[cfg(feature = "gzip")]
            BodyInner::Gzip(dec) => dec.read(buf),
        }
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            BodyInner::Empty => "empty",
            BodyInner::Plain(_) => "plain",
            #[cfg(feature = "gzip")]
            BodyInner::Gzip(_) => "gzip",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("closed", &self.closed)
            .finish()
    }
}
