//! Shutdown coordination
//!
//! One [`Shutdown`] owns the phase; every connection task, worker and the
//! accept loop holds a [`ShutdownSignal`] and reacts to phase changes:
//!
//! - `Draining`: stop accepting, finish the current request cycle, close
//! - `Terminated`: abandon in-flight work immediately

use std::sync::Arc;
use tokio::sync::watch;

/// Server lifecycle phase; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Coordinator for graceful shutdown
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Phase>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Running);
        Shutdown { tx: Arc::new(tx) }
    }

    /// Begin graceful drain
    pub fn drain(&self) {
        self.advance(Phase::Draining);
    }

    /// Cancel everything still running
    pub fn terminate(&self) {
        self.advance(Phase::Terminated);
    }

    pub fn phase(&self) -> Phase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    fn advance(&self, next: Phase) {
        self.tx.send_if_modified(|phase| {
            if next > *phase {
                tracing::info!(from = ?*phase, to = ?next, "shutdown phase changed");
                *phase = next;
                true
            } else {
                false
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to tasks
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Phase>,
}

impl ShutdownSignal {
    pub fn phase(&self) -> Phase {
        *self.rx.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.phase() >= Phase::Draining
    }

    pub fn is_terminated(&self) -> bool {
        self.phase() >= Phase::Terminated
    }

    /// Resolves once draining (or later) has begun
    pub async fn draining(&mut self) {
        self.wait_for(Phase::Draining).await
    }

    /// Resolves once in-flight work must be abandoned
    pub async fn terminated(&mut self) {
        self.wait_for(Phase::Terminated).await
    }

    async fn wait_for(&mut self, target: Phase) {
        // A dropped coordinator counts as reaching every phase.
        let _ = self.rx.wait_for(|phase| *phase >= target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_phase_only_moves_forward() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.phase(), Phase::Running);

        shutdown.terminate();
        shutdown.drain();
        assert_eq!(shutdown.phase(), Phase::Terminated);
    }

    #[test]
    fn test_signal_flags() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        assert!(!signal.is_draining());

        shutdown.drain();
        assert!(signal.is_draining());
        assert!(!signal.is_terminated());

        shutdown.terminate();
        assert!(signal.is_terminated());
    }

    #[tokio::test]
    async fn test_draining_wakes_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        let waiter = tokio::spawn(async move { signal.draining().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.drain();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminated_resolves_when_coordinator_dropped() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), signal.terminated())
            .await
            .unwrap();
    }
}
