//! Admission gate
//!
//! A counting semaphore sized by `listener.max_connections`. Each accepted
//! connection holds one [`AdmissionPermit`] for its whole lifetime; when the
//! gate is full new connections wait, and give up once shutdown begins.

use super::shutdown::ShutdownSignal;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrently served connections
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Slot in the gate, released on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        AdmissionGate {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait for a slot
    ///
    /// Returns None when shutdown starts first; the caller abandons the
    /// connection.
    pub async fn acquire(&self, shutdown: &ShutdownSignal) -> Option<AdmissionPermit> {
        if shutdown.is_draining() {
            return None;
        }

        let mut shutdown = shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.draining() => None,
            permit = self.semaphore.clone().acquire_owned() => {
                permit.ok().map(|permit| AdmissionPermit { _permit: permit })
            }
        }
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }
}
