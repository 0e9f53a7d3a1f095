//! Bounded concurrency gate for completion calls
//!
//! A counting admission primitive like `tokio::sync::Semaphore`, plus the two
//! things a pausable pipeline needs from it: `abort()` fails every queued
//! waiter at once, and `reset()` makes the same gate usable for the next run.
//!
//! Waiters are served FIFO. A release hands its slot straight to the oldest
//! waiter, so a burst of new callers can't starve the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("gate aborted")]
    Aborted,
}

#[derive(Debug)]
struct GateState {
    max: usize,
    active: usize,
    aborted: bool,
    waiters: VecDeque<oneshot::Sender<Result<(), GateError>>>,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
}

impl GateInner {
    /// Free one slot, handing it to the oldest live waiter if any.
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return;
            }
            // waiter gave up; try the next one
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// The gate. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

/// An admission slot, released on drop.
#[derive(Debug)]
pub struct GatePermit {
    inner: Arc<GateInner>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Keeps a queued acquire from leaking a slot when its future is dropped
/// after the slot was handed over but before it was observed.
struct PendingAdmission {
    rx: oneshot::Receiver<Result<(), GateError>>,
    inner: Arc<GateInner>,
    settled: bool,
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(Ok(())) = self.rx.try_recv() {
            self.inner.release();
        }
    }
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `max` holders (at least one).
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    max: max.max(1),
                    active: 0,
                    aborted: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for an admission slot.
    ///
    /// Fails immediately if the gate is aborted, or later if it is aborted
    /// while this caller is queued.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.aborted {
                return Err(GateError::Aborted);
            }
            if state.active < state.max && state.waiters.is_empty() {
                state.active += 1;
                return Ok(self.permit());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut pending = PendingAdmission {
            rx,
            inner: self.inner.clone(),
            settled: false,
        };
        let outcome = (&mut pending.rx).await;
        pending.settled = true;

        match outcome {
            Ok(Ok(())) => Ok(self.permit()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GateError::Aborted),
        }
    }

    fn permit(&self) -> GatePermit {
        GatePermit {
            inner: self.inner.clone(),
        }
    }

    /// Fail every queued waiter and refuse new admissions until `reset()`.
    ///
    /// Holders that were already admitted keep their slots.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.aborted = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(GateError::Aborted));
        }
    }

    /// Clear the aborted flag and the wait queue for reuse.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.aborted = false;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(GateError::Aborted));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().unwrap().aborted
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    /// Callers currently queued.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().unwrap().waiters.len()
    }

    pub fn max(&self) -> usize {
        self.inner.state.lock().unwrap().max
    }
}
