//! Admission guard bounding the un-acknowledged messages of one endpoint.
//!
//! The counter is a single atomic; admission never blocks and never takes a lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct AdmissionGuard {
    capacity: usize,
    count: AtomicUsize,
}

impl AdmissionGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            count: AtomicUsize::new(0),
        }
    }

    /// Reserve one slot if fewer than `capacity` are taken.
    ///
    /// Returns immediately; `false` leaves the counter untouched.
    pub fn prepare_to_emit(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .is_ok()
    }

    /// Free one slot. Releasing an empty guard is a caller bug and is clamped at zero.
    pub fn release(&self) {
        let released = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1));
        if released.is_err() {
            tracing::warn!("Admission guard released without a matching admission");
        }
    }

    /// Reserve one slot, returning a permit that frees it when dropped
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.prepare_to_emit().then(|| AdmissionPermit {
            guard: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }
}

/// One reserved admission slot
#[derive(Debug)]
pub struct AdmissionPermit {
    guard: Arc<AdmissionGuard>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.guard.release();
    }
}
