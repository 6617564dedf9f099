use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, WorkerError};

/// Admission pool capping how many jobs sync at once, plus a gauge of jobs
/// currently in the syncing phase.
///
/// The gauge is for reporting only. Force-started runs skip the permit but
/// still count towards it, so it may exceed the capacity.
#[derive(Debug)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    capacity: usize,
    syncing: AtomicUsize,
    peak: AtomicUsize,
}

impl Limiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            syncing: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Internal("concurrency limiter closed".to_string()))
    }

    /// Count the caller as syncing until the guard drops.
    pub fn enter_syncing(self: &Arc<Self>) -> SyncingGuard {
        let now = self.syncing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        SyncingGuard {
            limiter: self.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn syncing(&self) -> usize {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Highest syncing count seen since creation or the last reset.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.syncing(), Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SyncingGuard {
    limiter: Arc<Limiter>,
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        self.limiter.syncing.fetch_sub(1, Ordering::SeqCst);
    }
}
