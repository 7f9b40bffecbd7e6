//! Reliable packet connection over a framed transport.
//!
//! # Responsibilities
//! - Drive the lifecycle `Unconnected → Connecting → Connected → Disconnected`
//! - Negotiate the session id (XOR of one random 16-byte part per side)
//! - Confirm incoming packets and track confirmations for outgoing ones
//! - Route internal packets; surface everything else as [`LinkEvent`]s
//!
//! # Data Flow
//! ```text
//! FramedTransport::receive_loop
//!     → dispatch() on its own task per frame
//!         → Confirmation: unconfirmed.remove(id)
//!         → SessionIdPart: compute session id once, open session gate
//!         → DISCONNECT / PACKETS_PROCESSED: disconnect.rs rendezvous
//!         → other internal: LinkEvent::Control
//!         → application data: LinkEvent::Packet
//!         → confirmation reply if requested (bypasses the send lock)
//! ```
//!
//! # Design Decisions
//! - One send lock per connection; sequential sends hold it until confirmed
//! - The receive task only holds a weak reference, so dropping the last
//!   handle closes the socket
//! - Everything tied to one socket lives in a [`Lifetime`]; reconnecting
//!   swaps in a fresh one, and a stale receive task can only touch its own

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::net::{ConnectionId, FramedTransport};
use crate::protocol::signatures::{self, SESSION_PART_LEN};
use crate::protocol::{Packet, PacketId, PacketOptions};
use crate::session::link::{Direction, Link, LinkEvent, LinkEvents, PacketOrder};
use crate::sync::{Broadcast, CompositeDeadline, DeadlineBuilder, Gate, Settled, Trip, WatchedCollection};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    direction: Direction,
    lifetime: Arc<Lifetime>,
}

/// State that lives from one connect to the matching disconnect.
#[derive(Debug)]
pub(super) struct Lifetime {
    pub(super) transport: Arc<FramedTransport>,
    pub(super) remote_processed: Gate,
    pub(super) rendezvous_started: AtomicBool,
    pub(super) rendezvous_done: Broadcast,
    pub(super) graceful: Mutex<Option<bool>>,
    /// Fires once the disconnect has been fully processed.
    pub(super) settled: Broadcast,
}

impl Lifetime {
    fn new(max_frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            transport: Arc::new(FramedTransport::new(max_frame_size)),
            remote_processed: Gate::blocked(),
            rendezvous_started: AtomicBool::new(false),
            rendezvous_done: Broadcast::new(),
            graceful: Mutex::new(None),
            settled: Broadcast::new(),
        })
    }

    pub(super) fn graceful(&self) -> Option<bool> {
        *self.graceful.lock().expect("graceful mutex poisoned")
    }
}

#[derive(Debug, Default)]
struct SessionParts {
    local: Option<[u8; SESSION_PART_LEN]>,
    id: Option<String>,
}

/// A confirmed, ordered packet connection.
pub struct Connection {
    id: ConnectionId,
    pub(super) config: SessionConfig,
    pub(super) me: Weak<Connection>,
    lifecycle: Mutex<Lifecycle>,
    pending: Mutex<Option<TcpStream>>,
    pub(super) send_lock: tokio::sync::Mutex<()>,
    pub(super) unconfirmed: WatchedCollection<PacketId>,
    session: Mutex<SessionParts>,
    session_ready: Gate,
    pub(super) disposed: Broadcast,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

impl Connection {
    /// A connection that will dial out with [`connect`](Self::connect).
    pub fn new(config: SessionConfig) -> (Arc<Self>, LinkEvents) {
        Self::build(config, None)
    }

    /// A connection around an accepted socket; start it with
    /// [`update_connection`](Self::update_connection).
    pub fn accepted(stream: TcpStream, config: SessionConfig) -> (Arc<Self>, LinkEvents) {
        Self::build(config, Some(stream))
    }

    fn build(config: SessionConfig, pending: Option<TcpStream>) -> (Arc<Self>, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let connection = Arc::new_cyclic(|me| Self {
            id: ConnectionId::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Unconnected,
                direction: Direction::Unknown,
                lifetime: Lifetime::new(config.max_frame_size),
            }),
            config,
            me: me.clone(),
            pending: Mutex::new(pending),
            send_lock: tokio::sync::Mutex::new(()),
            unconfirmed: WatchedCollection::new(),
            session: Mutex::new(SessionParts::default()),
            session_ready: Gate::blocked(),
            disposed: Broadcast::new(),
            events,
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().expect("lifecycle mutex poisoned").state
    }

    pub fn direction(&self) -> Direction {
        self.lifecycle.lock().expect("lifecycle mutex poisoned").direction
    }

    /// State of the current (or most recent) socket.
    pub(super) fn lifetime(&self) -> Arc<Lifetime> {
        Arc::clone(&self.lifecycle.lock().expect("lifecycle mutex poisoned").lifetime)
    }

    pub fn is_connected(&self) -> bool {
        self.lifetime().transport.is_connected()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifetime().transport.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lifetime().transport.remote_addr()
    }

    /// Outcome of the most recent disconnect; `None` while connected.
    pub fn graceful_disconnect(&self) -> Option<bool> {
        self.lifetime().graceful()
    }

    /// Fires when the current socket goes down. A later reconnect comes
    /// with a new signal.
    pub fn disconnect_signal(&self) -> Broadcast {
        self.lifetime().transport.disconnected().clone()
    }

    /// Number of sent packets still awaiting confirmation.
    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Dial `addr`, then run the session-id exchange. A connection that
    /// has been disconnected can be connected again.
    pub async fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> Result<()> {
        if self.disposed.is_triggered() {
            return Err(SessionError::Disposed);
        }
        self.begin_connecting()?;

        match self.open_socket(addr, cancel.as_ref()).await {
            Ok(stream) => self.start(stream, Direction::Initiator).await,
            Err(e) => {
                self.reset_unconnected();
                Err(e)
            }
        }
    }

    /// Start an accepted connection.
    pub async fn update_connection(&self, direction: Direction) -> Result<()> {
        if direction != Direction::Receiver {
            return Err(SessionError::InvalidState("only accepted connections are started here"));
        }
        if self.disposed.is_triggered() {
            return Err(SessionError::Disposed);
        }

        let stream = self
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .take()
            .ok_or(SessionError::InvalidState("no accepted socket to start"))?;
        self.begin_connecting()?;
        self.start(stream, direction).await
    }

    fn begin_connecting(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        match lifecycle.state {
            ConnectionState::Unconnected => {
                lifecycle.state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Disconnected => {
                lifecycle.state = ConnectionState::Connecting;
                lifecycle.direction = Direction::Unknown;
                lifecycle.lifetime = Lifetime::new(self.config.max_frame_size);
                self.reset_session();
                Ok(())
            }
            ConnectionState::Connected if !lifecycle.lifetime.transport.is_connected() => {
                Err(SessionError::InvalidState("disconnect still in progress"))
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(SessionError::InvalidState("already connected"))
            }
        }
    }

    fn reset_session(&self) {
        *self.session.lock().expect("session mutex poisoned") = SessionParts::default();
        self.session_ready.block();
    }

    fn reset_unconnected(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        if lifecycle.state == ConnectionState::Connecting {
            lifecycle.state = ConnectionState::Unconnected;
        }
    }

    async fn open_socket(&self, addr: SocketAddr, cancel: Option<&Broadcast>) -> Result<TcpStream> {
        let (socket, any) = if addr.is_ipv4() {
            (TcpSocket::new_v4(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        } else {
            (TcpSocket::new_v6(), IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        };
        let socket = socket.map_err(SessionError::Connect)?;
        socket
            .bind(SocketAddr::new(any, self.config.local_port))
            .map_err(SessionError::Bind)?;

        let deadline = CompositeDeadline::builder()
            .link_opt(Trip::Cancelled, cancel)
            .link(Trip::Disposed, &self.disposed)
            .build();
        deadline
            .run(socket.connect(addr))
            .await?
            .map_err(SessionError::Connect)
    }

    async fn start(&self, stream: TcpStream, direction: Direction) -> Result<()> {
        let lifetime = self.lifetime();
        let reader = match lifetime.transport.attach(stream).await {
            Ok(reader) => reader,
            Err(e) => {
                self.reset_unconnected();
                return Err(e);
            }
        };

        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            lifecycle.state = ConnectionState::Connected;
            lifecycle.direction = direction;
        }

        let part: [u8; SESSION_PART_LEN] = rand::random();
        self.session.lock().expect("session mutex poisoned").local = Some(part);

        if self.config.debug_log {
            tracing::debug!(
                connection_id = %self.id,
                peer_addr = ?self.remote_addr(),
                ?direction,
                "Connection established"
            );
        }

        let announced = self
            .send_raw(
                &lifetime,
                &Packet::internal(part.to_vec()).with_options(PacketOptions::SESSION_ID_PART),
            )
            .await;
        self.spawn_receive_loop(lifetime, reader);
        announced?;

        self.emit(LinkEvent::Connected);
        Ok(())
    }

    fn spawn_receive_loop(&self, lifetime: Arc<Lifetime>, reader: OwnedReadHalf) {
        let me = self.me.clone();

        tokio::spawn(async move {
            let frames = me.clone();
            let frames_lifetime = Arc::clone(&lifetime);
            let reason = lifetime
                .transport
                .receive_loop(reader, move |frame| {
                    let connection = frames.upgrade();
                    let lifetime = Arc::clone(&frames_lifetime);
                    async move {
                        if let Some(connection) = connection {
                            connection.dispatch(lifetime, frame).await;
                        }
                    }
                })
                .await;

            match me.upgrade() {
                Some(connection) => connection.on_transport_closed(&lifetime, reason).await,
                None => {
                    lifetime.settled.trigger();
                }
            }
        });
    }

    async fn dispatch(self: Arc<Self>, lifetime: Arc<Lifetime>, frame: Vec<u8>) {
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Undecodable packet, closing connection");
                lifetime.transport.close_now();
                return;
            }
        };

        if self.config.logs_packets() {
            tracing::trace!(
                connection_id = %self.id,
                packet_id = %packet.id(),
                options = packet.options().bits(),
                size = packet.size(),
                "Packet received"
            );
        }

        // A packet is queued for delivery before its confirmation goes out.
        let confirmation = packet
            .requires_confirmation()
            .then(|| Packet::confirmation(packet.id()));

        if packet.is_confirmation() {
            self.unconfirmed.remove(&packet.id());
        } else if packet.is_internal() {
            self.dispatch_internal(&lifetime, packet);
        } else {
            self.emit(LinkEvent::Packet(packet));
        }

        if let Some(confirmation) = confirmation {
            if let Err(e) = self.send_raw(&lifetime, &confirmation).await {
                tracing::debug!(connection_id = %self.id, packet_id = %confirmation.id(), error = %e, "Confirmation not sent");
            }
        }
    }

    fn dispatch_internal(self: &Arc<Self>, lifetime: &Arc<Lifetime>, packet: Packet) {
        if packet.has(PacketOptions::SESSION_ID_PART) {
            self.accept_session_part(lifetime, packet.payload());
            return;
        }

        let payload = packet.payload();
        if payload == signatures::DISCONNECT {
            let connection = Arc::clone(self);
            let lifetime = Arc::clone(lifetime);
            tokio::spawn(async move {
                connection.rendezvous(&lifetime, false).await;
            });
        } else if payload == signatures::PACKETS_PROCESSED {
            lifetime.remote_processed.open();
        } else {
            self.emit(LinkEvent::Control(packet));
        }
    }

    fn accept_session_part(&self, lifetime: &Lifetime, remote: &[u8]) {
        if remote.len() != SESSION_PART_LEN {
            tracing::warn!(connection_id = %self.id, len = remote.len(), "Malformed session id part, closing connection");
            lifetime.transport.close_now();
            return;
        }

        let id = {
            let mut session = self.session.lock().expect("session mutex poisoned");
            let Some(local) = session.local else { return };
            if session.id.is_some() {
                return;
            }
            let id: String = local
                .iter()
                .zip(remote)
                .map(|(a, b)| format!("{:02X}", a ^ b))
                .collect();
            session.id = Some(id.clone());
            id
        };

        self.session_ready.open();
        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id, session_id = %id, "Session established");
        }
    }

    /// The session id, once both parts have been exchanged.
    pub async fn session_id(&self) -> Result<String> {
        if self.disposed.is_triggered() {
            return Err(SessionError::Disposed);
        }
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        self.deadline(None)
            .timeout(self.config.confirmation_timeout())
            .build()
            .run(self.session_ready.wait())
            .await
            .map_err(|trip| match trip {
                Trip::TimedOut => SessionError::Timeout("session id"),
                other => other.into(),
            })?;

        self.session
            .lock()
            .expect("session mutex poisoned")
            .id
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    /// Send `packet`; under `Sequential` ordering wait for its confirmation.
    pub async fn send(&self, packet: Packet, order: PacketOrder, cancel: Option<Broadcast>) -> Result<()> {
        if self.disposed.is_triggered() {
            return Err(SessionError::Disposed);
        }
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let id = packet.id();
        let tracked = packet.requires_confirmation();
        let lifetime = self.lifetime();
        let deadline = self.deadline_for(&lifetime, cancel.as_ref()).build();
        let _guard = deadline.run(self.send_lock.lock()).await?;

        // Tracked before writing; the confirmation can beat the write's return.
        let generation = self.unconfirmed.generation();
        if tracked {
            self.unconfirmed.insert(id);
        }
        if let Err(e) = self.send_raw(&lifetime, &packet).await {
            self.unconfirmed.remove(&id);
            return Err(e);
        }

        if !tracked || order == PacketOrder::NonSequential {
            return Ok(());
        }

        let wait = self
            .deadline_for(&lifetime, cancel.as_ref())
            .timeout(self.config.confirmation_timeout())
            .build();
        // A teardown clear is not a confirmation.
        let outcome = match wait.run(self.unconfirmed.wait_removed(&id, generation)).await {
            Ok(Settled::Removed) => Ok(()),
            Ok(Settled::Cleared) => Err(wait.tripped().unwrap_or(Trip::Disconnected)),
            Err(trip) => Err(trip),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(trip) => {
                self.unconfirmed.remove(&id);
                if self.config.debug_log {
                    tracing::debug!(connection_id = %self.id, packet_id = %id, ?trip, "Confirmation wait abandoned");
                }
                Err(match trip {
                    Trip::TimedOut => SessionError::Timeout("confirmation"),
                    other => other.into(),
                })
            }
        }
    }

    /// Write one packet on `lifetime`'s socket, bypassing the send lock.
    pub(super) async fn send_raw(&self, lifetime: &Lifetime, packet: &Packet) -> Result<()> {
        if self.config.logs_packets() {
            tracing::trace!(
                connection_id = %self.id,
                packet_id = %packet.id(),
                options = packet.options().bits(),
                size = packet.size(),
                "Packet sent"
            );
        }
        lifetime.transport.send_frame(&packet.encode()).await.map(|_| ())
    }

    /// Caller cancellation linked with disposal and disconnection of the
    /// current socket.
    pub(super) fn deadline(&self, cancel: Option<&Broadcast>) -> DeadlineBuilder {
        self.deadline_for(&self.lifetime(), cancel)
    }

    pub(super) fn deadline_for(&self, lifetime: &Lifetime, cancel: Option<&Broadcast>) -> DeadlineBuilder {
        CompositeDeadline::builder()
            .link_opt(Trip::Cancelled, cancel)
            .link(Trip::Disposed, &self.disposed)
            .link(Trip::Disconnected, lifetime.transport.disconnected())
    }

    async fn on_transport_closed(&self, lifetime: &Arc<Lifetime>, reason: SessionError) {
        if lifetime.rendezvous_started.load(Ordering::SeqCst) {
            lifetime.rendezvous_done.triggered().await;
        }

        let current = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            let current = lifecycle.state == ConnectionState::Connected && Arc::ptr_eq(&lifecycle.lifetime, lifetime);
            if current {
                // Reset under the lifecycle lock so a reconnect cannot interleave.
                lifecycle.state = ConnectionState::Disconnected;
                self.unconfirmed.clear();
                self.reset_session();
            }
            current
        };

        if current {
            let graceful = *lifetime
                .graceful
                .lock()
                .expect("graceful mutex poisoned")
                .get_or_insert(false);

            match &reason {
                SessionError::NotConnected => {
                    if self.config.debug_log {
                        tracing::debug!(connection_id = %self.id, graceful, "Connection closed");
                    }
                }
                other => {
                    tracing::warn!(connection_id = %self.id, error = %other, "Connection dropped");
                }
            }

            self.emit(LinkEvent::Disconnected { graceful });
        }
        lifetime.settled.trigger();
    }

    /// Force-close the socket without a rendezvous. A rendezvous already
    /// under way records its own outcome.
    pub fn disconnect_fast(&self) {
        let lifetime = self.lifetime();
        if !lifetime.transport.is_connected() {
            return;
        }
        if !lifetime.rendezvous_started.load(Ordering::SeqCst) {
            lifetime
                .graceful
                .lock()
                .expect("graceful mutex poisoned")
                .get_or_insert(false);
        }
        lifetime.transport.close_now();
    }

    /// Tear down. Safe to call any number of times from any task.
    pub fn dispose(&self) {
        if !self.disposed.trigger() {
            return;
        }
        self.disconnect_fast();
        self.lifetime().transport.close_now();
        self.pending.lock().expect("pending mutex poisoned").take();
        self.unconfirmed.clear();
        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id, "Connection disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_triggered()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.lifetime().transport.close_now();
    }
}

impl Link for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> BoxFuture<'_, Result<()>> {
        Connection::connect(self, addr, cancel).boxed()
    }

    fn update_connection(&self, direction: Direction) -> BoxFuture<'_, Result<()>> {
        Connection::update_connection(self, direction).boxed()
    }

    fn send(&self, packet: Packet, order: PacketOrder, cancel: Option<Broadcast>) -> BoxFuture<'_, Result<()>> {
        Connection::send(self, packet, order, cancel).boxed()
    }

    fn session_id(&self) -> BoxFuture<'_, Result<String>> {
        Connection::session_id(self).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, bool> {
        Connection::disconnect(self).boxed()
    }

    fn disconnect_fast(&self) {
        Connection::disconnect_fast(self)
    }

    fn dispose(&self) {
        Connection::dispose(self)
    }

    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }

    fn direction(&self) -> Direction {
        Connection::direction(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Connection::local_addr(self)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Connection::remote_addr(self)
    }

    fn graceful_disconnect(&self) -> Option<bool> {
        Connection::graceful_disconnect(self)
    }

    fn disconnect_signal(&self) -> Broadcast {
        Connection::disconnect_signal(self)
    }
}
