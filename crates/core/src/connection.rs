//! Identity and lifetime of one camera connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Inner {
    id: u64,
    open: AtomicBool,
    closed: Notify,
}

/// Shared handle to one TCP connection to a camera.
///
/// Clones refer to the same connection. Equality is identity: two
/// purposes may transiently share a URL, so registry readers compare
/// handles, never URLs.
///
/// Closing is a flag plus a wake-up; the driver task owning the socket
/// observes it through [`closed`](Self::closed) and drops the stream.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            inner: Arc::new(Inner {
                id: CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst),
                open: AtomicBool::new(true),
                closed: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Mark the connection closed and wake its driver. Idempotent.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            tracing::trace!(connection = self.inner.id, "connection closed");
            self.inner.closed.notify_waiters();
        }
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    /// Whether `other` is the same connection instance.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Connection {}
