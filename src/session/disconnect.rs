//! Graceful two-way disconnect.
//!
//! ```text
//! initiator                                  peer
//!   lock sends
//!   DISCONNECT (confirmed) ───────────────▶  lock sends (remote-initiated run)
//!   drain unconfirmed  ◀── confirmation ───  drain unconfirmed
//!   PACKETS_PROCESSED ────────────────────▶  open rendezvous gate
//!   open rendezvous gate ◀─────────────────  PACKETS_PROCESSED
//!   close                                    close
//! ```
//!
//! At most one run per connection: whichever of a local `disconnect()` and
//! an incoming DISCONNECT starts first owns it, later callers wait for its
//! outcome. The whole sequence is bounded by the graceful disconnect timeout
//! and the socket is closed in every outcome.

use std::sync::atomic::Ordering;

use crate::error::{Result, SessionError};
use crate::protocol::{signatures, Packet};
use crate::session::connection::{Connection, ConnectionState, Lifetime};
use crate::sync::{Settled, Trip};

impl Connection {
    /// Disconnect gracefully. Resolves to whether both sides completed the
    /// rendezvous before the timeout, once the connection has fully settled
    /// into `Disconnected` and can be connected again.
    pub async fn disconnect(&self) -> bool {
        let lifetime = self.lifetime();
        if !lifetime.transport.is_connected() && !lifetime.rendezvous_started.load(Ordering::SeqCst) {
            // Already closed; let the receive loop finish the transition.
            if self.state() == ConnectionState::Connected {
                lifetime.settled.triggered().await;
            }
            return lifetime.graceful().unwrap_or(false);
        }
        let graceful = self.rendezvous(&lifetime, true).await;
        lifetime.settled.triggered().await;
        graceful
    }

    /// Run the drain-and-rendezvous sequence on `lifetime`'s socket.
    /// `announce` is false when the peer started it.
    pub(super) async fn rendezvous(&self, lifetime: &Lifetime, announce: bool) -> bool {
        if lifetime.rendezvous_started.swap(true, Ordering::SeqCst) {
            lifetime.rendezvous_done.triggered().await;
            return lifetime.graceful().unwrap_or(false);
        }

        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id(), remote_initiated = !announce, "Disconnect rendezvous started");
        }

        let outcome = self.drain_and_meet(lifetime, announce).await;
        let graceful = match outcome {
            Ok(()) => true,
            Err(e) => {
                if e.is_disconnect() {
                    tracing::debug!(connection_id = %self.id(), "Peer went away during disconnect rendezvous");
                } else {
                    tracing::debug!(connection_id = %self.id(), error = %e, "Disconnect rendezvous incomplete");
                }
                false
            }
        };

        let graceful = *lifetime
            .graceful
            .lock()
            .expect("graceful mutex poisoned")
            .get_or_insert(graceful);

        lifetime.transport.close().await;
        lifetime.rendezvous_done.trigger();

        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id(), graceful, "Disconnect rendezvous finished");
        }
        graceful
    }

    async fn drain_and_meet(&self, lifetime: &Lifetime, announce: bool) -> Result<()> {
        let deadline = self
            .deadline_for(lifetime, None)
            .timeout(self.config.graceful_disconnect_timeout())
            .build();
        let to_error = |trip: Trip| match trip {
            Trip::TimedOut => SessionError::Timeout("disconnect rendezvous"),
            other => other.into(),
        };

        let _guard = deadline.run(self.send_lock.lock()).await.map_err(to_error)?;
        let generation = self.unconfirmed.generation();

        if announce {
            let packet = Packet::internal(signatures::DISCONNECT.to_vec()).requiring_confirmation();
            self.unconfirmed.insert(packet.id());
            if let Err(e) = self.send_raw(lifetime, &packet).await {
                self.unconfirmed.remove(&packet.id());
                return Err(e);
            }
        }

        // Emptied by a teardown rather than by the peer's confirmations.
        if let Settled::Cleared = deadline
            .run(self.unconfirmed.wait_empty(generation))
            .await
            .map_err(to_error)?
        {
            return Err(deadline.tripped().map(to_error).unwrap_or(SessionError::NotConnected));
        }

        self.send_raw(lifetime, &Packet::internal(signatures::PACKETS_PROCESSED.to_vec()))
            .await?;

        deadline
            .run(lifetime.remote_processed.wait())
            .await
            .map_err(to_error)
    }
}
