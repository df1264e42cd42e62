//! Bounded concurrency for outbound recognition calls, with load shedding.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};

/// Counting permit pool shared by every capture loop in the process.
///
/// A request is *pending* from the moment it enters the gate until it drops
/// its permit, whether it is still queued or already holds a permit. When
/// more than `shed_threshold` requests are pending, new arrivals are turned
/// away instead of queueing.
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    capacity: usize,
    shed_threshold: usize,
    pending: AtomicUsize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, shed_threshold: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            shed_threshold,
            pending: AtomicUsize::new(0),
        }
    }

    /// Wait for a permit, or return `None` if the frame should be shed
    pub async fn enter(&self) -> Option<GatePermit<'_>> {
        let before = self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard { gate: self };

        if before > self.shed_threshold {
            return None;
        }

        match self.semaphore.acquire().await {
            Ok(permit) => Some(GatePermit {
                _permit: permit,
                _pending: guard,
            }),
            Err(e) => {
                tracing::error!("Recognition gate closed: {}", e);
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Requests queued or holding a permit
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Decrements the pending count however the request leaves the gate,
/// including when the waiting future is dropped.
struct PendingGuard<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.gate.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held for the duration of one recognition call
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
    _pending: PendingGuard<'a>,
}
