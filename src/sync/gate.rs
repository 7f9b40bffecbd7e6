//! Binary block/open latch.

use tokio::sync::watch;

/// A latch that is either blocking or open.
///
/// Unlike [`Broadcast`](super::Broadcast) a gate can be re-blocked, which is
/// how per-connection rendezvous points are reset when a link goes down.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    /// Create a gate that blocks until [`open`](Self::open) is called.
    pub fn blocked() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Make subsequent waiters block again.
    pub fn block(&self) {
        self.open.send_replace(false);
    }

    /// Whether waiters currently pass straight through.
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}
