use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cancellation token carried by every request.
///
/// A context can be canceled explicitly and can carry a deadline. The
/// transport registers hooks on it while a request is in flight; firing
/// the token runs the hooks, which close the connection (or remove the
/// pool waiter) serving the request.
///
/// Contexts are cheap to clone and all clones share state.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    by_id: HashMap<u64, Box<dyn FnOnce() + Send>>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    /// A context that is considered expired at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: Some(deadline),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Cancel the context. All registered hooks run on the calling
    /// thread. Idempotent.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = {
            let mut lock = self.inner.hooks.lock().unwrap();
            std::mem::take(&mut lock.by_id)
        };
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Whether the deadline (if any) has passed.
    pub fn deadline_exceeded(&self) -> bool {
        match self.inner.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Register a hook to run on cancellation. If the context is already
    /// canceled the hook runs immediately. Returns an id for
    /// [`remove_hook`][Context::remove_hook].
    pub(crate) fn on_cancel(&self, hook: Box<dyn FnOnce() + Send>) -> u64 {
        if self.is_canceled() {
            hook();
            return 0;
        }
        let mut lock = self.inner.hooks.lock().unwrap();
        // racing cancel() may have drained the map while we waited.
        if self.is_canceled() {
            drop(lock);
            hook();
            return 0;
        }
        lock.next_id += 1;
        let id = lock.next_id;
        lock.by_id.insert(id, hook);
        id
    }

    /// Deregister a hook. Removing an already-run or unknown hook is a
    /// no-op.
    pub(crate) fn remove_hook(&self, id: u64) {
        if id == 0 {
            return;
        }
        let mut lock = self.inner.hooks.lock().unwrap();
        lock.by_id.remove(&id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_hooks_once() {
        let ctx = Context::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        ctx.on_cancel(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.cancel();
        ctx.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(ctx.is_canceled());
    }

    #[test]
    fn hook_after_cancel_runs_immediately() {
        let ctx = Context::new();
        ctx.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        ctx.on_cancel(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_hook_does_not_run() {
        let ctx = Context::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = ctx.on_cancel(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.remove_hook(id);
        ctx.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.deadline_exceeded());
        assert!(!ctx.is_canceled());
    }
}
