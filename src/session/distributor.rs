//! Inbound packet buffer with eviction and a pull-based consumer API.
//!
//! # Responsibilities
//! - Buffer application packets in arrival order
//! - Evict by age (optional) and by total payload bytes (optional)
//! - Hand each buffered packet to exactly one consumer
//!
//! # Design Decisions
//! - Claiming happens under the buffer lock, so concurrent waiters woken by
//!   one insertion never receive the same handle; losers wait again
//! - The byte cap counts the incoming packet, so it holds after every insert;
//!   a packet larger than the cap is returned detached instead of buffered

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::protocol::Packet;
use crate::serializer::PayloadSerializer;
use crate::session::handle::PacketHandle;
use crate::sync::{CompositeDeadline, Trip};

#[derive(Debug, Default)]
struct Buffer {
    handles: VecDeque<PacketHandle>,
    bytes: usize,
}

impl Buffer {
    /// Drop the oldest handle, read or not.
    fn evict_front(&mut self) -> Option<PacketHandle> {
        let handle = self.handles.pop_front()?;
        self.bytes -= handle.size();
        handle.take();
        Some(handle)
    }

    /// The oldest handle nobody has read yet. Handles whose contents were
    /// read while still buffered are dropped on the way.
    fn claim_front(&mut self) -> Option<PacketHandle> {
        while let Some(handle) = self.handles.pop_front() {
            self.bytes -= handle.size();
            if handle.take() {
                return Some(handle);
            }
        }
        None
    }
}

/// Buffers received packets until the application pulls them.
pub struct PacketDistributor {
    buffer: Mutex<Buffer>,
    added: Notify,
    cap: Option<usize>,
    max_age: Option<Duration>,
    serializer: Arc<dyn PayloadSerializer>,
    me: Weak<PacketDistributor>,
}

impl std::fmt::Debug for PacketDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDistributor")
            .field("len", &self.len())
            .field("bytes", &self.buffered_bytes())
            .field("cap", &self.cap)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl PacketDistributor {
    pub fn new(config: &SessionConfig) -> Arc<Self> {
        let max_age = config
            .auto_delete_old_packets
            .then(|| config.delete_packets_older_than());
        Self::with_limits(config.buffer_cap(), max_age, Arc::clone(&config.serializer))
    }

    /// A distributor with explicit limits; `None` disables a limit.
    pub fn with_limits(
        cap: Option<usize>,
        max_age: Option<Duration>,
        serializer: Arc<dyn PayloadSerializer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            buffer: Mutex::new(Buffer::default()),
            added: Notify::new(),
            cap,
            max_age,
            serializer,
            me: me.clone(),
        })
    }

    /// Evict, buffer `packet`, and wake waiting consumers.
    pub fn add_next(&self, packet: Packet) -> PacketHandle {
        let handle = PacketHandle::new(packet, self.me.clone(), Arc::clone(&self.serializer));
        let size = handle.size();

        {
            let mut buffer = self.buffer.lock().expect("distributor mutex poisoned");

            if let Some(max_age) = self.max_age {
                let now = Instant::now();
                while let Some(front) = buffer.handles.front() {
                    if now.duration_since(front.timestamp()) <= max_age {
                        break;
                    }
                    if let Some(evicted) = buffer.evict_front() {
                        tracing::trace!(packet_id = %evicted.id(), "Evicted stale packet");
                    }
                }
            }

            if let Some(cap) = self.cap {
                if size > cap {
                    handle.take();
                    tracing::debug!(packet_id = %handle.id(), size, cap, "Packet exceeds buffer cap, not buffered");
                    return handle;
                }
                while buffer.bytes + size > cap {
                    match buffer.evict_front() {
                        Some(evicted) => {
                            tracing::trace!(packet_id = %evicted.id(), "Evicted packet over buffer cap");
                        }
                        None => break,
                    }
                }
            }

            buffer.bytes += size;
            buffer.handles.push_back(handle.clone());
        }

        self.added.notify_waiters();
        handle
    }

    /// Take the oldest buffered handle. With `wait`, suspend until one
    /// arrives or `deadline` trips.
    pub async fn get_next(
        &self,
        wait: bool,
        deadline: &CompositeDeadline,
    ) -> std::result::Result<Option<PacketHandle>, Trip> {
        loop {
            let added = self.added.notified();
            tokio::pin!(added);
            added.as_mut().enable();

            if let Some(handle) = self.claim_front() {
                return Ok(Some(handle));
            }
            if !wait {
                return Ok(None);
            }
            deadline.run(added).await?;
        }
    }

    fn claim_front(&self) -> Option<PacketHandle> {
        self.buffer
            .lock()
            .expect("distributor mutex poisoned")
            .claim_front()
    }

    /// Remove a handle whose contents were read directly.
    pub(super) fn forget(&self, handle: &PacketHandle) {
        let mut buffer = self.buffer.lock().expect("distributor mutex poisoned");
        if let Some(index) = buffer.handles.iter().position(|h| h.id() == handle.id()) {
            if let Some(removed) = buffer.handles.remove(index) {
                buffer.bytes -= removed.size();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("distributor mutex poisoned").handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.lock().expect("distributor mutex poisoned").bytes
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        let mut buffer = self.buffer.lock().expect("distributor mutex poisoned");
        while buffer.evict_front().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use crate::sync::Broadcast;

    fn distributor(cap: Option<usize>, max_age: Option<Duration>) -> Arc<PacketDistributor> {
        PacketDistributor::with_limits(cap, max_age, Arc::new(JsonSerializer))
    }

    fn no_deadline() -> CompositeDeadline {
        CompositeDeadline::builder().build()
    }

    #[tokio::test]
    async fn fifo_and_no_wait() {
        let d = distributor(None, None);
        assert!(d.get_next(false, &no_deadline()).await.unwrap().is_none());

        d.add_next(Packet::new(b"one".to_vec()));
        d.add_next(Packet::new(b"two".to_vec()));
        assert_eq!(d.buffered_bytes(), 6);

        let first = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(first.payload(), b"one");
        let second = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(second.payload(), b"two");
        assert!(d.is_empty());
        assert_eq!(d.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn reading_a_handle_removes_it() {
        let d = distributor(None, None);
        let first = d.add_next(Packet::new(b"a".to_vec()));
        d.add_next(Packet::new(b"b".to_vec()));

        assert!(!first.is_taken());
        assert_eq!(first.payload(), b"a");
        assert!(first.is_taken());
        assert_eq!(d.len(), 1);

        let next = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(next.payload(), b"b");
    }

    #[tokio::test]
    async fn handle_read_before_it_is_forgotten_is_never_claimed() {
        let d = distributor(None, None);
        let first = d.add_next(Packet::new(b"a".to_vec()));
        d.add_next(Packet::new(b"b".to_vec()));

        // A reader has taken the handle but not yet removed it from the buffer.
        assert!(first.take());
        assert_eq!(d.len(), 2);

        let next = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(next.payload(), b"b");
        assert!(d.is_empty());
        assert_eq!(d.buffered_bytes(), 0);

        // The late removal finds nothing left to forget.
        d.forget(&first);
        assert_eq!(d.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn byte_cap_holds_after_every_insert() {
        let d = distributor(Some(10), None);
        for i in 0..20u8 {
            d.add_next(Packet::new(vec![i; (i as usize % 4) + 1]));
            assert!(d.buffered_bytes() <= 10);
        }

        let oversized = d.add_next(Packet::new(vec![0u8; 11]));
        assert!(oversized.is_taken());
        assert!(d.buffered_bytes() <= 10);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_first() {
        let d = distributor(Some(4), None);
        d.add_next(Packet::new(b"ab".to_vec()));
        d.add_next(Packet::new(b"cd".to_vec()));
        d.add_next(Packet::new(b"ef".to_vec()));

        let head = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(head.payload(), b"cd");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_packets_are_purged_on_insert() {
        let d = distributor(None, Some(Duration::from_secs(30)));
        let old = d.add_next(Packet::new(b"old".to_vec()));

        tokio::time::advance(Duration::from_secs(31)).await;
        d.add_next(Packet::new(b"new".to_vec()));

        assert!(old.is_taken());
        assert_eq!(d.len(), 1);
        let head = d.get_next(false, &no_deadline()).await.unwrap().unwrap();
        assert_eq!(head.payload(), b"new");
    }

    #[tokio::test(start_paused = true)]
    async fn age_eviction_stops_at_first_fresh_handle() {
        let d = distributor(None, Some(Duration::from_secs(30)));
        d.add_next(Packet::new(b"1".to_vec()));
        tokio::time::advance(Duration::from_secs(20)).await;
        d.add_next(Packet::new(b"2".to_vec()));
        tokio::time::advance(Duration::from_secs(15)).await;
        d.add_next(Packet::new(b"3".to_vec()));

        assert_eq!(d.len(), 2);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_insert() {
        let d = distributor(None, None);
        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.get_next(true, &no_deadline()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        d.add_next(Packet::new(b"wake".to_vec()));

        let handle = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(handle.payload(), b"wake");
    }

    #[tokio::test]
    async fn racing_waiters_never_share_a_handle() {
        let d = distributor(None, None);
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let d = Arc::clone(&d);
            waiters.push(tokio::spawn(async move {
                d.get_next(true, &no_deadline()).await.unwrap().unwrap().id()
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..8u8 {
            d.add_next(Packet::new(vec![i]));
        }

        let mut ids = Vec::new();
        for waiter in waiters {
            ids.push(waiter.await.unwrap());
        }
        ids.sort_by_key(|id| *id.as_bytes());
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert!(d.is_empty());
    }

    #[tokio::test]
    async fn wait_honours_cancellation() {
        let d = distributor(None, None);
        let cancel = Broadcast::new();
        let deadline = CompositeDeadline::builder()
            .link(Trip::Cancelled, &cancel)
            .build();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        assert_eq!(d.get_next(true, &deadline).await.unwrap_err(), Trip::Cancelled);
    }
}
