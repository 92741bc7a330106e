//! The connection pool: idle connections per key, per-host connection
//! caps with FIFO waiters, and dial coalescing.
//!
//! Lock discipline: the pool mutex is never held while closing a
//! connection (closing calls back into [`PoolShared::conn_gone`]).
//! Waiter delivery is a non-blocking send and is fine under the lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::TransportConfig;
use crate::conn::{ConnKey, PersistConn};
use crate::context::Context;
use crate::error::{Error, TimeoutKind};

pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    max_idle: usize,
    max_idle_per_host: usize,
    max_conns_per_host: usize,
    idle_timeout: Option<Duration>,
    /// Idle conns per key; the back of the vec is the most recently
    /// returned (LIFO).
    idle: HashMap<ConnKey, Vec<IdleConn>>,
    /// Cross-key recency; the front is the least recently used.
    idle_lru: VecDeque<(u64, ConnKey)>,
    /// Active + idle conns per key, incremented when a dial begins.
    conn_count: HashMap<ConnKey, usize>,
    /// FIFO of requests blocked on `max_conns_per_host`.
    conn_waiters: HashMap<ConnKey, VecDeque<Waiter>>,
    /// Requests attached to an in-flight dial for their key.
    dial_waiters: HashMap<ConnKey, VecDeque<Waiter>>,
    dialing: HashSet<ConnKey>,
    closed: bool,
}

struct IdleConn {
    conn: PersistConn,
    since: Instant,
}

pub(crate) struct Checkout {
    pub conn: PersistConn,
    pub reused: bool,
}

enum WaiterMsg {
    /// An idle conn freed up for you.
    Conn(PersistConn),
    /// Conditions changed; re-run acquisition.
    Retry,
    Fail(Error),
}

/// One blocked acquisition. Delivery is once-only, enforced by `done`.
#[derive(Clone)]
struct Waiter {
    core: Arc<WaiterCore>,
}

struct WaiterCore {
    tx: SyncSender<WaiterMsg>,
    done: AtomicBool,
}

impl Waiter {
    fn new() -> (Waiter, Receiver<WaiterMsg>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            Waiter {
                core: Arc::new(WaiterCore {
                    tx,
                    done: AtomicBool::new(false),
                }),
            },
            rx,
        )
    }

    fn deliver(&self, msg: WaiterMsg) -> bool {
        if self.core.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.core.tx.try_send(msg).is_ok()
    }

    fn abandon(&self) {
        self.core.done.store(true, Ordering::SeqCst);
    }
}

impl Pool {
    pub(crate) fn new(config: &TransportConfig) -> Pool {
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                max_idle: config.max_idle_conns,
                max_idle_per_host: config.max_idle_conns_per_host,
                max_conns_per_host: config.max_conns_per_host,
                idle_timeout: config.idle_conn_timeout,
                idle: HashMap::new(),
                idle_lru: VecDeque::new(),
                conn_count: HashMap::new(),
                conn_waiters: HashMap::new(),
                dial_waiters: HashMap::new(),
                dialing: HashSet::new(),
                closed: false,
            }),
        });

        if let Some(timeout) = config.idle_conn_timeout {
            spawn_janitor(Arc::downgrade(&shared), timeout);
        }

        Pool { shared }
    }

    pub(crate) fn shared_weak(&self) -> Weak<PoolShared> {
        Arc::downgrade(&self.shared)
    }

    /// Acquire a connection for `key`: a fresh idle one, or by dialing,
    /// or by waiting for a slot / an in-flight dial.
    pub(crate) fn get(
        &self,
        key: &ConnKey,
        ctx: &Context,
        dial_fn: &dyn Fn() -> Result<PersistConn, Error>,
    ) -> Result<Checkout, Error> {
        loop {
            if ctx.is_canceled() {
                return Err(Error::RequestCanceled);
            }
            if ctx.deadline_exceeded() {
                return Err(Error::Timeout(TimeoutKind::Deadline));
            }

            enum Action {
                Idle(PersistConn),
                Dial,
                Wait(Receiver<WaiterMsg>, Waiter),
            }

            let mut to_close = Vec::new();
            let action = {
                let mut inner = self.shared.inner.lock().unwrap();
                if let Some(conn) = inner.pop_idle(key, &mut to_close) {
                    Action::Idle(conn)
                } else if inner.at_conn_limit(key) {
                    let (w, rx) = Waiter::new();
                    inner
                        .conn_waiters
                        .entry(key.clone())
                        .or_insert_with(VecDeque::new)
                        .push_back(w.clone());
                    Action::Wait(rx, w)
                } else if inner.dialing.contains(key) {
                    let (w, rx) = Waiter::new();
                    inner
                        .dial_waiters
                        .entry(key.clone())
                        .or_insert_with(VecDeque::new)
                        .push_back(w.clone());
                    Action::Wait(rx, w)
                } else {
                    inner.dialing.insert(key.clone());
                    *inner.conn_count.entry(key.clone()).or_insert(0) += 1;
                    Action::Dial
                }
            };
            close_all(to_close);

            match action {
                Action::Idle(conn) => {
                    conn.mark_reused();
                    trace!("reusing idle connection for {:?}", key);
                    return Ok(Checkout { conn, reused: true });
                }
                Action::Dial => return self.finish_dial(key, dial_fn()),
                Action::Wait(rx, waiter) => {
                    match self.wait(ctx, rx, &waiter)? {
                        Some(conn) => {
                            conn.mark_reused();
                            return Ok(Checkout { conn, reused: true });
                        }
                        // woken to retry acquisition.
                        None => continue,
                    }
                }
            }
        }
    }

    fn finish_dial(
        &self,
        key: &ConnKey,
        result: Result<PersistConn, Error>,
    ) -> Result<Checkout, Error> {
        let mut failed = Vec::new();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.dialing.remove(key);
            match &result {
                Ok(_) => {
                    // the leader takes this conn; the next attached
                    // waiter becomes the new leader.
                    inner.promote_dial_waiter(key);
                }
                Err(_) => {
                    inner.dec_count(key);
                    // a failed coalesced dial fails everyone attached.
                    if let Some(queue) = inner.dial_waiters.remove(key) {
                        failed.extend(queue);
                    }
                }
            }
        }
        match result {
            Ok(conn) => Ok(Checkout {
                conn,
                reused: false,
            }),
            Err(e) => {
                for w in failed {
                    w.deliver(WaiterMsg::Fail(e.clone()));
                }
                Err(e)
            }
        }
    }

    fn wait(
        &self,
        ctx: &Context,
        rx: Receiver<WaiterMsg>,
        waiter: &Waiter,
    ) -> Result<Option<PersistConn>, Error> {
        let hook_waiter = waiter.clone();
        let hook_id = ctx.on_cancel(Box::new(move || {
            hook_waiter.deliver(WaiterMsg::Fail(Error::RequestCanceled));
        }));

        let msg = match ctx.deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(msg) => Ok(msg),
                    Err(RecvTimeoutError::Timeout) => {
                        waiter.abandon();
                        ctx.remove_hook(hook_id);
                        return Err(Error::Timeout(TimeoutKind::Deadline));
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(()),
                }
            }
            None => rx.recv().map_err(|_| ()),
        };
        ctx.remove_hook(hook_id);

        match msg {
            Ok(WaiterMsg::Conn(conn)) => Ok(Some(conn)),
            Ok(WaiterMsg::Retry) => Ok(None),
            Ok(WaiterMsg::Fail(e)) => Err(e),
            // sender side evaporated; just retry.
            Err(()) => Ok(None),
        }
    }

    /// Return all idle connections to their maker.
    pub(crate) fn close_idle(&self) {
        let conns = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.drain_idle()
        };
        close_all(conns);
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.shared.inner.lock().unwrap().idle_lru.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let conns = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.closed = true;
            inner.drain_idle()
        };
        close_all(conns);
    }
}

impl PoolShared {
    /// Offer a connection back to the pool. Waiters get it directly;
    /// otherwise it joins the idle structures, evicting per the caps.
    /// Returns false if the pool refuses it (caller closes it).
    pub(crate) fn try_put_idle(&self, conn: PersistConn) -> bool {
        if conn.is_broken() {
            return false;
        }
        let key = conn.shared.key.clone();
        let mut to_close = Vec::new();
        let accepted = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.closed {
                false
            } else if inner.deliver_to_waiter(&key, &conn) {
                trace!("idle conn for {:?} handed to waiter", key);
                true
            } else if inner.max_idle == 0 || inner.max_idle_per_host == 0 {
                false
            } else {
                let stack = inner.idle.entry(key.clone()).or_insert_with(Vec::new);
                if stack.len() >= inner.max_idle_per_host {
                    false
                } else {
                    stack.push(IdleConn {
                        conn: conn.clone(),
                        since: Instant::now(),
                    });
                    inner.idle_lru.push_back((conn.shared.id, key.clone()));
                    while inner.idle_lru.len() > inner.max_idle {
                        if let Some((id, k)) = inner.idle_lru.pop_front() {
                            if let Some(c) = inner.remove_idle_entry(&k, id) {
                                to_close.push(c);
                            }
                        }
                    }
                    true
                }
            }
        };
        close_all(to_close);
        accepted
    }

    /// A connection died: forget it and wake the next blocked request
    /// for its key.
    pub(crate) fn conn_gone(&self, key: &ConnKey, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove_idle_entry(key, id);
        inner.dec_count(key);
        inner.promote_conn_waiter(key);
    }
}

impl PoolInner {
    fn at_conn_limit(&self, key: &ConnKey) -> bool {
        self.max_conns_per_host > 0
            && self.conn_count.get(key).copied().unwrap_or(0) >= self.max_conns_per_host
    }

    fn dec_count(&mut self, key: &ConnKey) {
        if let Some(count) = self.conn_count.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.conn_count.remove(key);
            }
        }
    }

    /// Pop the freshest idle conn for `key`, discarding broken or
    /// timed-out entries along the way.
    fn pop_idle(&mut self, key: &ConnKey, to_close: &mut Vec<PersistConn>) -> Option<PersistConn> {
        let idle_timeout = self.idle_timeout;
        let stack = self.idle.get_mut(key)?;
        let mut found = None;
        while let Some(entry) = stack.pop() {
            let stale = entry.conn.is_broken()
                || idle_timeout.map(|t| entry.since.elapsed() >= t).unwrap_or(false);
            let id = entry.conn.shared.id;
            if stale {
                self.idle_lru.retain(|(i, _)| *i != id);
                if entry.conn.is_broken() {
                    // already closing; no need to close again.
                    continue;
                }
                to_close.push(entry.conn);
                continue;
            }
            self.idle_lru.retain(|(i, _)| *i != id);
            found = Some(entry.conn);
            break;
        }
        if self.idle.get(key).map(|s| s.is_empty()).unwrap_or(false) {
            self.idle.remove(key);
        }
        found
    }

    fn remove_idle_entry(&mut self, key: &ConnKey, id: u64) -> Option<PersistConn> {
        self.idle_lru.retain(|(i, _)| *i != id);
        let stack = self.idle.get_mut(key)?;
        let pos = stack.iter().position(|ic| ic.conn.shared.id == id)?;
        let entry = stack.remove(pos);
        if stack.is_empty() {
            self.idle.remove(key);
        }
        Some(entry.conn)
    }

    fn drain_idle(&mut self) -> Vec<PersistConn> {
        self.idle_lru.clear();
        self.idle
            .drain()
            .flat_map(|(_, stack)| stack)
            .map(|ic| ic.conn)
            .collect()
    }

    /// Hand `conn` to the longest-waiting live request for `key`, if
    /// any. Conn-limit waiters have priority over dial-attached ones.
    fn deliver_to_waiter(&mut self, key: &ConnKey, conn: &PersistConn) -> bool {
        for queue_map in [&mut self.conn_waiters, &mut self.dial_waiters] {
            if let Some(queue) = queue_map.get_mut(key) {
                while let Some(w) = queue.pop_front() {
                    if w.deliver(WaiterMsg::Conn(conn.clone())) {
                        if queue.is_empty() {
                            queue_map.remove(key);
                        }
                        return true;
                    }
                }
                queue_map.remove(key);
            }
        }
        false
    }

    fn promote_dial_waiter(&mut self, key: &ConnKey) {
        if let Some(queue) = self.dial_waiters.get_mut(key) {
            while let Some(w) = queue.pop_front() {
                if w.deliver(WaiterMsg::Retry) {
                    break;
                }
            }
            if queue.is_empty() {
                self.dial_waiters.remove(key);
            }
        }
    }

    fn promote_conn_waiter(&mut self, key: &ConnKey) {
        if let Some(queue) = self.conn_waiters.get_mut(key) {
            while let Some(w) = queue.pop_front() {
                if w.deliver(WaiterMsg::Retry) {
                    break;
                }
            }
            if queue.is_empty() {
                self.conn_waiters.remove(key);
            }
        }
    }
}

fn close_all(conns: Vec<PersistConn>) {
    for conn in conns {
        conn.close(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "idle connection evicted",
        )));
    }
}

/// Sweeps timed-out idle connections. A coarse substitute for a timer
/// per connection; checkout re-checks staleness anyway.
fn spawn_janitor(weak: Weak<PoolShared>, idle_timeout: Duration) {
    let quantum = (idle_timeout / 2)
        .max(Duration::from_millis(50))
        .min(Duration::from_secs(1));
    let _ = thread::Builder::new()
        .name("httpool-janitor".into())
        .spawn(move || loop {
            thread::sleep(quantum);
            let shared = match weak.upgrade() {
                Some(s) => s,
                None => break,
            };
            let mut expired = Vec::new();
            {
                let mut inner = shared.inner.lock().unwrap();
                if inner.closed {
                    break;
                }
                let keys: Vec<ConnKey> = inner.idle.keys().cloned().collect();
                for key in keys {
                    let stack = match inner.idle.get_mut(&key) {
                        Some(s) => s,
                        None => continue,
                    };
                    let (dead, live): (Vec<IdleConn>, Vec<IdleConn>) = stack
                        .drain(..)
                        .partition(|ic| ic.since.elapsed() >= idle_timeout);
                    *stack = live;
                    if stack.is_empty() {
                        inner.idle.remove(&key);
                    }
                    for ic in dead {
                        let id = ic.conn.shared.id;
                        inner.idle_lru.retain(|(i, _)| *i != id);
                        expired.push(ic.conn);
                    }
                }
            }
            close_all(expired);
        });
}
