//! Cooperative pause and cancellation shared by every orchestrator of a workflow.

use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Cancelled,
}

/// Cloned into sub-orchestrators, so a cancel propagates top-down.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<RunState>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RunState::Cancelled
    }

    /// Returns false unless the run was Running.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                return true;
            }
            false
        })
    }

    /// Returns false unless the run was Paused.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                return true;
            }
            false
        })
    }

    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == RunState::Cancelled {
                return false;
            }
            *state = RunState::Cancelled;
            true
        })
    }

    /// Safe point between spawns: holds while paused, errors once cancelled.
    pub async fn checkpoint(&self, before: &str) -> OrchestrationResult<()> {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Running => return Ok(()),
                RunState::Cancelled => return Err(OrchestrationError::Cancelled(before.to_string())),
                RunState::Paused => {
                    if rx.changed().await.is_err() {
                        return Err(OrchestrationError::Cancelled(before.to_string()));
                    }
                }
            }
        }
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == RunState::Cancelled {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_holds_while_paused() {
        let control = RunControl::new();
        assert!(control.pause());
        assert!(!control.pause());

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint("next spawn").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(control.resume());
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_checkpoint() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint("next spawn").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(control.cancel());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));
        assert!(!control.resume());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let control = RunControl::new();
        let signal = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            signal.cancel();
        });
        tokio::time::timeout(Duration::from_secs(1), control.cancelled()).await.unwrap();
        assert!(control.is_cancelled());
    }
}
