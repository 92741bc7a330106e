//! A single persistent connection: one owned socket, a dedicated read
//! loop and write loop, and the round-trip select that coordinates them.
//!
//! The loops communicate with the dispatcher through channels only. The
//! dispatcher never touches the socket; closing a connection means
//! shutting the socket down, which unblocks whichever loop is parked on
//! it.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{
    Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError,
};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use http::header::HeaderMap;
use http::StatusCode;

use crate::body::{BodyDone, RawBody};
use crate::config::TransportConfig;
use crate::context::Context;
use crate::error::{Error, TimeoutKind};
use crate::pool::PoolShared;
use crate::proxy::{self, Proxy};
use crate::rtls::{self, TlsInfo};
use crate::send_body::SendBody;
use crate::stream::{self, CloseHandle, ReadHalf, WriteHalf};
use crate::util::canonical_header_key;
use crate::wire::{self, Framing, ResponseHead};

/// Index into the idle pool. Two requests may share a connection iff
/// their keys are equal. For plain http through a proxy the target
/// address is cleared so all such requests share the proxy conns.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    pub proxy: Option<String>,
    pub scheme: String,
    pub addr: String,
}

impl std::fmt::Debug for ConnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.proxy.as_deref().unwrap_or("-"),
            self.scheme,
            self.addr
        )
    }
}

/// Events funneled to the dispatcher's round-trip select.
pub(crate) enum Event {
    /// Write loop finished writing the request (or failed to).
    WroteRequest(Option<Error>),
    /// Read loop produced a response.
    Response(Box<InboundResponse>),
    /// Read loop failed to produce a response.
    ResponseErr(Error),
    /// The connection died; the stored close reason.
    Closed(Error),
}

/// What the read loop hands the dispatcher.
pub(crate) struct InboundResponse {
    pub head: ResponseHead,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    pub close: bool,
    pub body: Option<RawBody>,
    pub trailer: Arc<Mutex<HeaderMap>>,
}

struct WriteRequest {
    head: Vec<u8>,
    body: Option<SendBody>,
    chunked: bool,
    trailer: HeaderMap,
    event_tx: Sender<Event>,
    continue_rx: Option<Receiver<()>>,
    expect_timeout: Duration,
}

struct RequestHandle {
    event_tx: Sender<Event>,
    is_head: bool,
    req_close: bool,
    continue_tx: Option<SyncSender<()>>,
    ctx: Context,
}

/// Everything the dispatcher assembled for one attempt on a connection.
pub(crate) struct RoundTrip {
    pub head: Vec<u8>,
    pub body: Option<SendBody>,
    pub chunked: bool,
    pub trailer: HeaderMap,
    pub is_head: bool,
    pub req_close: bool,
    pub expect_continue: bool,
    pub ctx: Context,
    pub response_header_timeout: Option<Duration>,
    pub expect_continue_timeout: Duration,
}

#[derive(Clone)]
pub(crate) struct PersistConn {
    pub(crate) shared: Arc<ConnShared>,
}

pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) key: ConnKey,
    pub(crate) tls: Option<TlsInfo>,
    write_tx: SyncSender<WriteRequest>,
    req_tx: SyncSender<RequestHandle>,
    close_handle: CloseHandle,
    /// Total bytes written to the socket; shared with the write loop's
    /// counting writer.
    nwrite: Arc<AtomicU64>,
    state: Mutex<ConnState>,
    pool: Weak<PoolShared>,
}

struct ConnState {
    closed_err: Option<Error>,
    canceled: bool,
    broken: bool,
    reused: bool,
    num_expected_responses: usize,
    event_tx: Option<Sender<Event>>,
}

/// Targets needed to establish a connection; the key alone is not
/// enough once a proxy clears the address.
pub(crate) struct ConnTarget {
    /// Hostname for SNI and certificate checks.
    pub host: String,
    /// `host:port` of the origin server.
    pub addr: String,
    pub proxy: Option<Proxy>,
    pub is_https: bool,
}

impl PersistConn {
    /// Dial, handshake and spawn the loops.
    pub(crate) fn connect(
        key: ConnKey,
        target: &ConnTarget,
        config: &TransportConfig,
        ctx: &Context,
        pool: Weak<PoolShared>,
        id: u64,
    ) -> Result<PersistConn, Error> {
        let dial_addr = match &target.proxy {
            Some(proxy) => proxy.addr(),
            None => target.addr.clone(),
        };
        let sock = stream::dial(ctx, &dial_addr, &config.dial)?;

        // https through a proxy needs a CONNECT tunnel before TLS.
        if target.is_https {
            if let Some(proxy) = &target.proxy {
                let mut io = Duplex {
                    r: BufReader::new(sock.try_clone().map_err(Error::Io)?),
                    w: &sock,
                };
                proxy::connect_tunnel(
                    &mut io,
                    &target.addr,
                    proxy,
                    config.max_response_header_bytes,
                )?;
            }
        }

        let (read_half, write_half, close_handle, tls) = if target.is_https {
            let tls_config = config
                .tls_config
                .clone()
                .unwrap_or_else(rtls::default_tls_config);
            let (r, w, c, info) =
                rtls::handshake(sock, &target.host, tls_config, config.tls_handshake_timeout)?;
            (ReadHalf::Tls(r), WriteHalf::Tls(w), c, Some(info))
        } else {
            let (r, w, c) = stream::split_tcp(sock).map_err(Error::Io)?;
            (r, w, c, None)
        };

        let (write_tx, write_rx) = mpsc::sync_channel::<WriteRequest>(1);
        let (req_tx, req_rx) = mpsc::sync_channel::<RequestHandle>(1);
        let (write_result_tx, write_result_rx) = mpsc::sync_channel::<bool>(1);

        let nwrite = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(ConnShared {
            id,
            key,
            tls,
            write_tx,
            req_tx,
            close_handle,
            nwrite: Arc::clone(&nwrite),
            state: Mutex::new(ConnState {
                closed_err: None,
                canceled: false,
                broken: false,
                reused: false,
                num_expected_responses: 0,
                event_tx: None,
            }),
            pool,
        });

        let counting = CountingWriter {
            inner: write_half,
            count: nwrite,
        };
        let writer = BufWriter::with_capacity(8 * 1024, counting);
        let reader = BufReader::with_capacity(8 * 1024, read_half);

        let max_header_bytes = config.max_response_header_bytes;

        let wl_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("httpool-write-{}", id))
            .spawn(move || write_loop(wl_shared, writer, write_rx, write_result_tx))
            .map_err(Error::Io)?;

        let rl_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("httpool-read-{}", id))
            .spawn(move || read_loop(rl_shared, reader, req_rx, write_result_rx, max_header_bytes))
            .map_err(Error::Io)?;

        trace!("new connection {} to {:?}", id, shared.key);
        Ok(PersistConn { shared })
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.shared.state.lock().unwrap().broken
    }

    pub(crate) fn mark_reused(&self) {
        self.shared.state.lock().unwrap().reused = true;
    }

    /// Tear the connection down on behalf of a canceled request.
    pub(crate) fn cancel(&self) {
        self.shared.state.lock().unwrap().canceled = true;
        self.shared.close_with(Error::RequestCanceled);
    }

    pub(crate) fn close(&self, err: Error) {
        self.shared.close_with(err);
    }

    /// Issue one request and wait for its response head. This is the
    /// three-way select between the write outcome, the read loop's
    /// reply, connection teardown and the applicable deadlines.
    pub(crate) fn round_trip(&self, rt: RoundTrip) -> Result<InboundResponse, Error> {
        let shared = &self.shared;
        let nwrite_before = shared.nwrite.load(Ordering::SeqCst);

        let (event_tx, event_rx) = mpsc::channel::<Event>();
        {
            let mut st = shared.state.lock().unwrap();
            if let Some(err) = &st.closed_err {
                // a pooled conn that died between checkout and use
                // reads as the server closing on us; a fresh one
                // surfaces whatever actually killed it.
                let err = if st.reused {
                    Error::ServerClosedIdle
                } else {
                    err.clone()
                };
                drop(st);
                return Err(self.map_error(err, nwrite_before));
            }
            debug_assert!(st.num_expected_responses == 0);
            st.num_expected_responses += 1;
            st.event_tx = Some(event_tx.clone());
        }

        let (continue_tx, continue_rx) = if rt.expect_continue {
            let (tx, rx) = mpsc::sync_channel::<()>(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let wr = WriteRequest {
            head: rt.head,
            body: rt.body,
            chunked: rt.chunked,
            trailer: rt.trailer,
            event_tx: event_tx.clone(),
            continue_rx,
            expect_timeout: rt.expect_continue_timeout,
        };
        if shared.write_tx.send(wr).is_err() {
            return Err(self.map_error(self.closed_reason(), nwrite_before));
        }

        let handle = RequestHandle {
            event_tx,
            is_head: rt.is_head,
            req_close: rt.req_close,
            continue_tx,
            ctx: rt.ctx.clone(),
        };
        if shared.req_tx.send(handle).is_err() {
            return Err(self.map_error(self.closed_reason(), nwrite_before));
        }

        let ctx_deadline = rt.ctx.deadline();
        let mut header_deadline: Option<Instant> = None;

        loop {
            let nearest = match (ctx_deadline, header_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let event = match nearest {
                None => match event_rx.recv() {
                    Ok(ev) => ev,
                    Err(_) => return Err(self.map_error(self.closed_reason(), nwrite_before)),
                },
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match event_rx.recv_timeout(timeout) {
                        Ok(ev) => ev,
                        Err(RecvTimeoutError::Timeout) => {
                            let kind = match header_deadline {
                                Some(h) if Instant::now() >= h => TimeoutKind::ResponseHeader,
                                _ => TimeoutKind::Deadline,
                            };
                            shared.close_with(Error::Timeout(kind));
                            return Err(Error::Timeout(kind));
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(self.map_error(self.closed_reason(), nwrite_before))
                        }
                    }
                }
            };

            match event {
                Event::WroteRequest(None) => {
                    if let Some(t) = rt.response_header_timeout {
                        header_deadline = Some(Instant::now() + t);
                    }
                }
                Event::WroteRequest(Some(err)) => {
                    shared.close_with(err.clone());
                    return Err(self.map_error(err, nwrite_before));
                }
                Event::Response(inbound) => {
                    // the stale event_tx slot is left in place: sends to
                    // it after we return land in a dropped receiver, and
                    // the next round trip overwrites it.
                    return Ok(*inbound);
                }
                Event::ResponseErr(err) => {
                    return Err(self.map_error(err, nwrite_before));
                }
                Event::Closed(err) => {
                    return Err(self.map_error(err, nwrite_before));
                }
            }
        }
    }

    fn closed_reason(&self) -> Error {
        let st = self.shared.state.lock().unwrap();
        st.closed_err
            .clone()
            .unwrap_or(Error::ServerClosedIdle)
    }

    /// Filter the first observed error per the policy: a prior
    /// cancellation wins; read-from-server errors pass through raw for
    /// retry classification; otherwise "no bytes hit the wire" makes
    /// the whole request retriable via NothingWritten.
    fn map_error(&self, err: Error, nwrite_before: u64) -> Error {
        {
            let st = self.shared.state.lock().unwrap();
            if st.canceled {
                return Error::RequestCanceled;
            }
        }
        match err {
            Error::RequestCanceled | Error::Timeout(_) | Error::ReadFromServer(_) => err,
            // protocol errors surface undisguised.
            Error::HeadersTooLarge | Error::BadStatusLine(_) | Error::HttpsMismatch => err,
            err => {
                let nothing_written =
                    self.shared.nwrite.load(Ordering::SeqCst) == nwrite_before;
                if nothing_written {
                    Error::NothingWritten(Box::new(err))
                } else if matches!(err, Error::ServerClosedIdle) {
                    err
                } else {
                    Error::ConnectionBroken(Box::new(err))
                }
            }
        }
    }
}

impl ConnShared {
    /// Mark the connection dead. First caller wins; the socket is shut
    /// down exactly once and the current round trip (if any) is told.
    pub(crate) fn close_with(&self, err: Error) {
        let notify = {
            let mut st = self.state.lock().unwrap();
            if st.closed_err.is_some() {
                return;
            }
            debug!("closing connection {}: {}", self.id, err);
            st.closed_err = Some(err.clone());
            st.broken = true;
            st.event_tx.take()
        };
        if let Some(tx) = notify {
            let _ = tx.send(Event::Closed(err));
        }
        self.close_handle.shutdown();
        if let Some(pool) = self.pool.upgrade() {
            pool.conn_gone(&self.key, self.id);
        }
    }

    fn expecting_response(&self) -> bool {
        self.state.lock().unwrap().num_expected_responses > 0
    }

    fn dec_expected(&self) {
        let mut st = self.state.lock().unwrap();
        st.num_expected_responses = st.num_expected_responses.saturating_sub(1);
    }
}

struct CountingWriter {
    inner: WriteHalf,
    count: Arc<AtomicU64>,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Duplex<'a> {
    r: BufReader<std::net::TcpStream>,
    w: &'a std::net::TcpStream,
}

impl<'a> Read for Duplex<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.r.read(buf)
    }
}

impl<'a> BufRead for Duplex<'a> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.r.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.r.consume(amt)
    }
}

impl<'a> Write for Duplex<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

fn write_loop(
    shared: Arc<ConnShared>,
    mut w: BufWriter<CountingWriter>,
    write_rx: Receiver<WriteRequest>,
    write_result_tx: SyncSender<bool>,
) {
    while let Ok(wr) = write_rx.recv() {
        let event_tx = wr.event_tx.clone();
        let result = perform_write(&mut w, wr);
        let ok = result.is_ok();
        // reuse-check channel; try_send since a crashed prior round
        // trip may have left the slot full.
        match write_result_tx.try_send(ok) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
        match result {
            Ok(()) => {
                let _ = event_tx.send(Event::WroteRequest(None));
            }
            Err(e) => {
                let err = Error::Io(e);
                let _ = event_tx.send(Event::WroteRequest(Some(err.clone())));
                shared.close_with(err);
                break;
            }
        }
    }
    trace!("write loop {} exits", shared.id);
}

fn perform_write(w: &mut BufWriter<CountingWriter>, wr: WriteRequest) -> io::Result<()> {
    w.write_all(&wr.head)?;

    if let Some(continue_rx) = wr.continue_rx {
        // Expect: 100-continue. Flush the head and hold the body until
        // the server says go, the wait times out, or a final response
        // arrives (read loop drops its end).
        w.flush()?;
        match continue_rx.recv_timeout(wr.expect_timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return w.flush(),
        }
    }

    if let Some(body) = wr.body {
        body.write_to(w, wr.chunked)?;
        if wr.chunked {
            w.write_all(b"0\r\n")?;
            for (name, value) in wr.trailer.iter() {
                write!(w, "{}: ", canonical_header_key(name.as_str()))?;
                w.write_all(value.as_bytes())?;
                w.write_all(b"\r\n")?;
            }
            w.write_all(b"\r\n")?;
        }
    }
    w.flush()
}

fn read_loop(
    shared: Arc<ConnShared>,
    reader: BufReader<ReadHalf>,
    req_rx: Receiver<RequestHandle>,
    write_result_rx: Receiver<bool>,
    max_header_bytes: usize,
) {
    let mut reader = Some(reader);

    loop {
        let r = match reader.as_mut() {
            Some(r) => r,
            None => break,
        };

        // Peek while idle. Data or EOF with no request in flight means
        // the server pushed something unsolicited or dropped us.
        let peek = match r.fill_buf() {
            Ok(buf) => {
                if buf.is_empty() {
                    Peek::Eof
                } else {
                    Peek::Data
                }
            }
            Err(e) => Peek::Error(e),
        };

        if !shared.expecting_response() {
            match peek {
                Peek::Eof => shared.close_with(Error::ServerClosedIdle),
                Peek::Data => {
                    debug!("connection {}: unsolicited data from server", shared.id);
                    shared.close_with(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unsolicited response on idle connection",
                    )));
                }
                Peek::Error(e) => shared.close_with(Error::Io(e)),
            }
            break;
        }

        let mut rc = match req_rx.recv() {
            Ok(rc) => rc,
            Err(_) => break,
        };

        // Parse the head, absorbing interim 100s.
        let head = loop {
            match wire::read_response_head(r, max_header_bytes) {
                Ok(head) if head.status == StatusCode::CONTINUE => {
                    if let Some(tx) = &rc.continue_tx {
                        let _ = tx.try_send(());
                    }
                }
                other => break other,
            }
        };
        // A final head means no 100 can follow; releasing the sender
        // also tells a still-waiting write loop to skip the body.
        rc.continue_tx = None;

        let head = match head {
            Ok(head) => head,
            Err(e) => {
                // socket-level failures are the retriable
                // read-from-server class; a malformed or oversized head
                // is a protocol error and surfaces as-is.
                let e = match e {
                    Error::Io(_) => Error::ReadFromServer(Box::new(e)),
                    other => other,
                };
                let _ = rc.event_tx.send(Event::ResponseErr(e.clone()));
                shared.dec_expected();
                shared.close_with(e);
                break;
            }
        };

        let info = wire::response_framing(rc.is_head, head.status, head.version, &head.headers);
        let keep_alive = !info.close && !rc.req_close && head.status.as_u16() >= 200;
        let has_body = info.framing.has_body();

        shared.dec_expected();

        if !has_body {
            // Recycle before handing the response over, so the caller
            // observing the response implies the conn is already pooled.
            let recycled = keep_alive
                && wrote_request_ok(&write_result_rx)
                && try_put_idle(&shared);
            let inbound = InboundResponse {
                head,
                content_length: info.content_length,
                transfer_encoding: info.transfer_encoding,
                close: info.close,
                body: None,
                trailer: Arc::new(Mutex::new(HeaderMap::new())),
            };
            let _ = rc.event_tx.send(Event::Response(Box::new(inbound)));
            if recycled {
                continue;
            }
            shared.close_with(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "connection not reusable",
            )));
            break;
        }

        let owned_reader = match reader.take() {
            Some(r) => r,
            None => break,
        };
        let (done_tx, done_rx) = mpsc::channel::<BodyDone>();
        let trailer = Arc::new(Mutex::new(HeaderMap::new()));
        let raw = RawBody::new(
            owned_reader,
            info.framing,
            Arc::clone(&trailer),
            done_tx,
            rc.ctx.clone(),
        );
        let inbound = InboundResponse {
            head,
            content_length: info.content_length,
            transfer_encoding: info.transfer_encoding,
            close: info.close,
            body: Some(raw),
            trailer,
        };
        if let Err(failed) = rc.event_tx.send(Event::Response(Box::new(inbound))) {
            // Dispatcher gave up (timeout, cancel). Reclaim the reader
            // from the unsent event and tear down.
            if let Event::Response(inbound) = failed.0 {
                drop(inbound.body);
            }
            shared.close_with(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "request abandoned before body",
            )));
            break;
        }

        // Suspend until the caller drains or closes the body.
        match done_rx.recv() {
            Ok(done) => {
                reader = done.reader;
                let reuse = done.eof
                    && done.reusable
                    && keep_alive
                    && reader.is_some()
                    && wrote_request_ok(&write_result_rx)
                    && try_put_idle(&shared);
                if !reuse {
                    shared.close_with(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "connection not reusable after body",
                    )));
                    break;
                }
            }
            Err(_) => {
                shared.close_with(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "response body leaked",
                )));
                break;
            }
        }
    }
    trace!("read loop {} exits", shared.id);
}

enum Peek {
    Data,
    Eof,
    Error(io::Error),
}

/// Whether the write loop reported success for the request whose
/// response we just finished. Bounded wait: the read side can win the
/// race against the write status landing.
fn wrote_request_ok(write_result_rx: &Receiver<bool>) -> bool {
    match write_result_rx.try_recv() {
        Ok(ok) => ok,
        Err(TryRecvError::Empty) => write_result_rx
            .recv_timeout(Duration::from_millis(50))
            .unwrap_or(false),
        Err(TryRecvError::Disconnected) => false,
    }
}

fn try_put_idle(shared: &Arc<ConnShared>) -> bool {
    let pool = match shared.pool.upgrade() {
        Some(pool) => pool,
        None => return false,
    };
    let conn = PersistConn {
        shared: Arc::clone(shared),
    };
    pool.try_put_idle(conn)
}
