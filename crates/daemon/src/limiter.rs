//! Global limit on concurrently running encoder processes.
//!
//! One [`ConcurrencyLimiter`] is shared by every pipeline in the process. A
//! slot is held as an [`EncoderSlot`] guard for as long as its encoder process
//! lives; dropping the guard returns the slot, whichever way the task ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("limiter is closed")]
    Closed,

    #[error("cancelled while waiting for an encoder slot")]
    Cancelled,
}

/// Counting semaphore bounding encoder processes across all jobs.
///
/// Waiters are served in FIFO order.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_use: Arc<AtomicUsize>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    /// A limiter with at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<EncoderSlot, LimiterError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        Ok(self.slot(permit))
    }

    /// Wait for a free slot unless `cancel` fires first.
    pub async fn acquire_or_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EncoderSlot, LimiterError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LimiterError::Cancelled),
            slot = self.acquire() => slot,
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<EncoderSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.slot(permit))
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> EncoderSlot {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        EncoderSlot {
            _permit: permit,
            in_use: self.in_use.clone(),
        }
    }
}

/// A held limiter slot. Dropping it is the release.
#[derive(Debug)]
pub struct EncoderSlot {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for EncoderSlot {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
