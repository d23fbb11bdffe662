//! FIFO async mutex with scoped release.
//!
//! The mutex is a single baton handed from holder to holder in the order
//! `acquire` was called. Each queued acquirer parks on its own oneshot
//! channel; the shared state is a small critical section that is never held
//! across an `.await`.
//!
//! A [`Lock`] is an RAII guard: dropping it releases the mutex, so every exit
//! path of a critical section (including `?` and panics) hands the baton on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Shared baton state.
struct State {
    /// Ticket of the outstanding lock, if any.
    current: Option<u64>,
    /// Ticket handed to the next grant.
    next_ticket: u64,
    /// Parked acquirers in call order. Each receives its ticket on grant.
    waiters: VecDeque<oneshot::Sender<u64>>,
}

impl State {
    fn grant(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.current = Some(ticket);
        ticket
    }
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // No code panics while holding the state lock; recover regardless.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release `ticket` if it is still the outstanding lock and pass the
    /// baton to the first live waiter.
    fn release(&self, ticket: u64) {
        let mut state = self.state();
        if state.current != Some(ticket) {
            return;
        }
        state.current = None;
        while let Some(waiter) = state.waiters.pop_front() {
            let next = state.next_ticket;
            if waiter.send(next).is_ok() {
                state.grant();
                return;
            }
            // Receiver dropped: the acquirer was cancelled while queued.
        }
    }
}

/// A cooperative, FIFO, single-holder async mutex.
///
/// Cloning yields another handle to the same mutex. Two mutexes created with
/// [`FifoMutex::new`] are fully independent.
#[derive(Clone)]
pub struct FifoMutex {
    inner: Arc<Inner>,
}

impl FifoMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    current: None,
                    next_ticket: 1,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait until the caller is the sole holder and return its [`Lock`].
    ///
    /// Callers are granted the lock in the order they called `acquire`.
    /// Dropping the returned future before it completes leaves the queue
    /// without consuming the baton.
    pub async fn acquire(&self) -> Lock {
        loop {
            let rx = {
                let mut state = self.inner.state();
                if state.current.is_none() {
                    let ticket = state.grant();
                    return Lock::new(Arc::clone(&self.inner), ticket);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingAcquire {
                inner: Arc::clone(&self.inner),
                rx: Some(rx),
            };
            if let Some(ticket) = pending.granted().await {
                return Lock::new(Arc::clone(&self.inner), ticket);
            }
        }
    }

    /// Release `lock` if it was minted by this mutex.
    ///
    /// Releasing an already released lock, or one belonging to another
    /// mutex, is a no-op.
    pub fn release(&self, lock: &Lock) {
        if Arc::ptr_eq(&self.inner, &lock.inner) {
            lock.release();
        }
    }

    /// Whether a lock is currently outstanding.
    pub fn is_locked(&self) -> bool {
        self.inner.state().current.is_some()
    }

    /// Number of acquirers parked behind the current holder.
    pub fn waiting(&self) -> usize {
        self.inner
            .state()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

impl Default for FifoMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FifoMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("FifoMutex")
            .field("current", &state.current)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A queued acquirer. If dropped after the baton was sent but before it was
/// observed, the baton is passed on instead of being lost.
struct PendingAcquire {
    inner: Arc<Inner>,
    rx: Option<oneshot::Receiver<u64>>,
}

impl PendingAcquire {
    async fn granted(&mut self) -> Option<u64> {
        let rx = self.rx.as_mut()?;
        let result = rx.await;
        self.rx = None;
        result.ok()
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(ticket) = rx.try_recv() {
                self.inner.release(ticket);
            }
        }
    }
}

/// Exclusive hold on a [`FifoMutex`].
///
/// Released exactly once: by [`Lock::release`], [`FifoMutex::release`], or
/// on drop, whichever comes first.
#[must_use = "dropping a Lock releases it immediately"]
pub struct Lock {
    inner: Arc<Inner>,
    ticket: u64,
    released: AtomicBool,
}

impl Lock {
    fn new(inner: Arc<Inner>, ticket: u64) -> Self {
        Self {
            inner,
            ticket,
            released: AtomicBool::new(false),
        }
    }

    /// Grant order of this lock, starting at 1 for each mutex.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the lock. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release(self.ticket);
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("ticket", &self.ticket)
            .field("released", &self.is_released())
            .finish()
    }
}
