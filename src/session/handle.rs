//! Accessed-once wrapper around a buffered packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::{Packet, PacketId};
use crate::serializer::PayloadSerializer;
use crate::session::distributor::PacketDistributor;

struct Inner {
    packet: Packet,
    timestamp: Instant,
    taken: AtomicBool,
    owner: Weak<PacketDistributor>,
    serializer: Arc<dyn PayloadSerializer>,
}

/// One received application packet as held by a [`PacketDistributor`].
///
/// Reading the contents through any accessor removes the handle from the
/// distributor if it is still buffered. Cloning shares the same handle.
#[derive(Clone)]
pub struct PacketHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PacketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHandle")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("taken", &self.is_taken())
            .finish()
    }
}

impl PacketHandle {
    pub(super) fn new(
        packet: Packet,
        owner: Weak<PacketDistributor>,
        serializer: Arc<dyn PayloadSerializer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                packet,
                timestamp: Instant::now(),
                taken: AtomicBool::new(false),
                owner,
                serializer,
            }),
        }
    }

    pub fn id(&self) -> PacketId {
        self.inner.packet.id()
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.inner.packet.size()
    }

    /// When the handle was buffered.
    pub fn timestamp(&self) -> Instant {
        self.inner.timestamp
    }

    pub fn descriptor(&self) -> Option<i32> {
        self.inner.packet.descriptor()
    }

    /// Whether the handle has left the distributor's buffer.
    pub fn is_taken(&self) -> bool {
        self.inner.taken.load(Ordering::SeqCst)
    }

    /// Mark as taken. Returns `true` for the first caller only.
    pub(super) fn take(&self) -> bool {
        !self.inner.taken.swap(true, Ordering::SeqCst)
    }

    fn accessed(&self) {
        if self.take() {
            if let Some(owner) = self.inner.owner.upgrade() {
                owner.forget(self);
            }
        }
    }

    /// The packet; removes the handle from the buffer.
    pub fn packet(&self) -> &Packet {
        self.accessed();
        &self.inner.packet
    }

    /// The payload bytes; removes the handle from the buffer.
    pub fn payload(&self) -> &[u8] {
        self.packet().payload()
    }

    /// The payload deserialized with the session's serializer; removes the
    /// handle from the buffer.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload();
        Ok(self.inner.serializer.deserialize(payload)?)
    }
}
