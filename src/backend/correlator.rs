//! Request/response correlation for one register key
//!
//! The board answers commands on the same (module, register) pair they were
//! sent to, with no sequence number. The only way to tell which request a
//! reply belongs to is ordering, so each [`Correlator`] keeps a FIFO of
//! requests and allows at most one of them on the wire at a time.
//!
//! A request is a deferred action plus a timeout. The action runs when the
//! request reaches the head of the queue, and the timeout starts at the same
//! moment. Whatever arrives first settles the request: a reply
//! ([`Correlator::complete`]), a failure ([`Correlator::fail`]), or the
//! timer. The next queued action then starts.

use crate::error::{BoardError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Work run when a request becomes the in-flight request
pub type Action = Box<dyn FnOnce() -> Result<()> + Send>;

struct Entry<T> {
    ticket: u64,
    timeout: Duration,
    /// `None` once the action has run, i.e. the entry is in flight
    action: Option<Action>,
    tx: oneshot::Sender<Result<T>>,
    /// Dropping this stops the entry's timer
    cancel: Option<oneshot::Sender<()>>,
}

struct Queue<T> {
    entries: VecDeque<Entry<T>>,
    next_ticket: u64,
}

struct Inner<T> {
    label: String,
    queue: Mutex<Queue<T>>,
    runtime: Handle,
}

/// FIFO of pending requests sharing one reply key
pub struct Correlator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Correlator<T> {
    /// Create an empty correlator whose timers run on `runtime`
    pub fn new(label: impl Into<String>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                queue: Mutex::new(Queue {
                    entries: VecDeque::new(),
                    next_ticket: 0,
                }),
                runtime,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Queue a request. `action` runs once every earlier request has settled.
    pub fn submit<F>(&self, timeout: Duration, action: F) -> Deferred<T>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let is_head = {
            let mut queue = self.lock();
            let ticket = queue.next_ticket;
            queue.next_ticket = queue.next_ticket.wrapping_add(1);
            queue.entries.push_back(Entry {
                ticket,
                timeout,
                action: Some(Box::new(action)),
                tx,
                cancel: None,
            });
            trace!(
                "{}: queued request {} ({} pending)",
                self.inner.label,
                ticket,
                queue.entries.len()
            );
            queue.entries.len() == 1
        };
        if is_head {
            self.activate();
        }
        Deferred { rx }
    }

    /// Resolve the in-flight request with `value`.
    ///
    /// Returns `false` when nothing is in flight; the value is dropped. A
    /// head whose action has not run yet cannot have been answered.
    pub fn complete(&self, value: T) -> bool {
        let in_flight = {
            let mut queue = self.lock();
            match queue.entries.front() {
                Some(head) if head.action.is_none() => queue.entries.pop_front(),
                _ => None,
            }
        };
        let Some(entry) = in_flight else {
            debug!("{}: dropping unsolicited reply", self.inner.label);
            return false;
        };
        trace!("{}: request {} completed", self.inner.label, entry.ticket);
        let _ = entry.tx.send(Ok(value));
        self.activate();
        true
    }

    /// Fail the in-flight request with `error`.
    ///
    /// Returns `false` when nothing is pending.
    pub fn fail(&self, error: BoardError) -> bool {
        let Some(entry) = self.lock().entries.pop_front() else {
            return false;
        };
        let _ = entry.tx.send(Err(error));
        self.activate();
        true
    }

    /// Fail every queued request, in order
    pub fn fail_all<F>(&self, error: F)
    where
        F: Fn() -> BoardError,
    {
        let drained: Vec<_> = self.lock().entries.drain(..).collect();
        if !drained.is_empty() {
            debug!("{}: failing {} pending requests", self.inner.label, drained.len());
        }
        for entry in drained {
            let _ = entry.tx.send(Err(error()));
        }
    }

    /// Number of requests not yet settled, including the in-flight one
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        // A panic inside an action never happens while the lock is held
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the head request if it has not started yet.
    ///
    /// Actions run without the lock held: a synchronous transport may deliver
    /// the reply, and so re-enter `complete`, before the action returns.
    fn activate(&self) {
        loop {
            let (ticket, timeout, action, cancel_rx) = {
                let mut queue = self.lock();
                let Some(head) = queue.entries.front_mut() else {
                    return;
                };
                let Some(action) = head.action.take() else {
                    return;
                };
                let (cancel_tx, cancel_rx) = oneshot::channel();
                head.cancel = Some(cancel_tx);
                (head.ticket, head.timeout, action, cancel_rx)
            };

            self.arm_timer(ticket, timeout, cancel_rx);

            match action() {
                Ok(()) => return,
                Err(e) => {
                    warn!("{}: request {} failed to send: {}", self.inner.label, ticket, e);
                    let failed = {
                        let mut queue = self.lock();
                        match queue.entries.front() {
                            Some(head) if head.ticket == ticket => queue.entries.pop_front(),
                            _ => None,
                        }
                    };
                    match failed {
                        Some(entry) => {
                            let _ = entry.tx.send(Err(e));
                        }
                        // Settled during the action; the next head is already running
                        None => return,
                    }
                }
            }
        }
    }

    fn arm_timer(&self, ticket: u64, timeout: Duration, cancel_rx: oneshot::Receiver<()>) {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        Correlator { inner }.expire(ticket, timeout);
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    fn expire(&self, ticket: u64, timeout: Duration) {
        let expired = {
            let mut queue = self.lock();
            match queue.entries.front() {
                Some(head) if head.ticket == ticket => queue.entries.pop_front(),
                _ => None,
            }
        };
        let Some(entry) = expired else {
            return;
        };
        warn!(
            "{}: request {} timed out after {}ms",
            self.inner.label,
            ticket,
            timeout.as_millis()
        );
        let _ = entry.tx.send(Err(BoardError::Timeout {
            key: self.inner.label.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }));
        self.activate();
    }
}

/// Result of a correlated request that resolves later
#[must_use = "a deferred result does nothing unless awaited"]
pub struct Deferred<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Deferred<T> {
    /// An already-settled result
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BoardError::Channel("request dropped before it settled".into()))
            })
        })
    }
}
