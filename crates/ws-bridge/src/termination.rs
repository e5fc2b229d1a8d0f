use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// One-shot teardown signal shared by the two pumps of a session.
///
/// Either pump may call [`trigger`](Self::trigger) any number of times from
/// any task; only the first call wins and wakes every waiter.
#[derive(Debug, Clone, Default)]
pub struct Termination {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    fired: AtomicBool,
    token: CancellationToken,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the signal has fired.
    pub fn triggered(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_once() {
        let signal = Termination::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_fire_exactly_once() {
        for _ in 0..50 {
            let signal = Termination::new();
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let signal = signal.clone();
                    let winners = Arc::clone(&winners);
                    tokio::spawn(async move {
                        if signal.trigger() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let signal = Termination::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
