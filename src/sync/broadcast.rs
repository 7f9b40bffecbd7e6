//! One-shot wake-all trigger.

use std::sync::Arc;

use tokio::sync::watch;

/// A signal that fires once and wakes every current and future waiter.
///
/// Clones share the same underlying signal, so a `Broadcast` can be handed
/// to any number of tasks and triggered from any of them.
#[derive(Debug, Clone)]
pub struct Broadcast {
    tx: Arc<watch::Sender<bool>>,
}

impl Broadcast {
    /// Create a signal that has not fired yet.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Broadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trigger_reports_first_caller_only() {
        let signal = Broadcast::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn wakes_every_waiter() {
        let signal = Broadcast::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.triggered().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn late_waiter_returns_immediately() {
        let signal = Broadcast::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(50), signal.triggered())
            .await
            .expect("already fired signal must not block");
    }
}
