//! Single-use initialization gate.
//!
//! The first caller of [`InitGate::run`] executes the initializer; every
//! concurrent or later caller waits for it and receives a clone of the same
//! outcome, success or failure. A gate never runs twice. Owners that need to
//! re-initialize install a fresh gate (`Arc::new(InitGate::new())`) and compare
//! gates with [`Arc::ptr_eq`] to detect that a generation ended.
//!
//! If the caller running the initializer is cancelled before it finishes, the
//! next waiter takes over and runs its own initializer.

use std::future::Future;

use tokio::sync::OnceCell;

use crate::error::Result;

/// Lazy, exactly-once constructor with a memoized result.
#[derive(Debug, Default)]
pub struct InitGate {
    outcome: OnceCell<Result<()>>,
}

impl InitGate {
    /// Creates a gate that has not fired yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `init` if no caller has done so yet, then returns the memoized outcome.
    ///
    /// # Errors
    ///
    /// Returns the error produced by whichever caller ran the initializer.
    pub async fn run<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.outcome.get_or_init(init).await.clone()
    }

    /// Outcome of the initializer, if it has completed.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<()>> {
        self.outcome.get().cloned()
    }

    /// Returns true once the initializer has completed.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.outcome.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OverlayError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_initializer_once() {
        let gate = InitGate::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            gate.run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .expect("init succeeds");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.is_fired());
    }

    #[tokio::test]
    async fn test_failure_is_memoized() {
        let gate = InitGate::new();

        let first = gate
            .run(|| async { Err(OverlayError::Sandbox("netns busy".to_string())) })
            .await;
        let second = gate.run(|| async { Ok(()) }).await;

        assert!(matches!(first, Err(OverlayError::Sandbox(_))));
        assert!(matches!(second, Err(OverlayError::Sandbox(ref m)) if m == "netns busy"));
        assert!(gate.outcome().is_some_and(|o| o.is_err()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_callers_share_one_attempt() {
        let gate = Arc::new(InitGate::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                gate.run(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(OverlayError::Sandbox("device busy".to_string()))
                })
                .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.expect("task should not panic");
            assert!(matches!(outcome, Err(OverlayError::Sandbox(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fresh_gate_has_no_outcome() {
        let gate = InitGate::new();
        assert!(!gate.is_fired());
        assert!(gate.outcome().is_none());
    }
}
