//! Application-facing client: a link, its distributor and an event feed.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::net::{resolver, ConnectionId};
use crate::protocol::Packet;
use crate::session::connection::Connection;
use crate::session::distributor::PacketDistributor;
use crate::session::handle::PacketHandle;
use crate::session::link::{Direction, Link, LinkEvent, LinkEvents, PacketOrder};
use crate::session::secure::SecureConnection;
use crate::sync::{Broadcast, CompositeDeadline, Trip};

const EVENT_CAPACITY: usize = 256;

/// Published to every [`Client::subscribe`] receiver.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected { graceful: bool },
    PacketReceived(PacketHandle),
}

/// A connection plus the buffer its received packets land in.
pub struct Client {
    link: Arc<dyn Link>,
    config: SessionConfig,
    encrypted: bool,
    distributor: Arc<PacketDistributor>,
    events: broadcast::Sender<ClientEvent>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.link.id())
            .field("encrypted", &self.encrypted)
            .field("connected", &self.link.is_connected())
            .field("buffered", &self.distributor.len())
            .finish()
    }
}

impl Client {
    /// A client that dials out; `encrypted` selects the secure link.
    pub fn new(config: SessionConfig, encrypted: bool) -> Self {
        if encrypted {
            let (link, events) = SecureConnection::new(config.clone());
            Self::from_link(link, events, config, true)
        } else {
            let (link, events) = Connection::new(config.clone());
            Self::from_link(link, events, config, false)
        }
    }

    /// A client around an accepted socket. Start it with
    /// [`update_connection`](Self::update_connection).
    pub fn from_stream(stream: TcpStream, config: SessionConfig, encrypted: bool) -> Self {
        if encrypted {
            let (link, events) = SecureConnection::accepted(stream, config.clone());
            Self::from_link(link, events, config, true)
        } else {
            let (link, events) = Connection::accepted(stream, config.clone());
            Self::from_link(link, events, config, false)
        }
    }

    /// Wrap any link and consume its events.
    pub fn from_link(link: Arc<dyn Link>, link_events: LinkEvents, config: SessionConfig, encrypted: bool) -> Self {
        let distributor = PacketDistributor::new(&config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tokio::spawn(forward(
            link.id(),
            link_events,
            Arc::clone(&distributor),
            events.clone(),
        ));

        Self {
            link,
            config,
            encrypted,
            distributor,
            events,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn distributor(&self) -> &Arc<PacketDistributor> {
        &self.distributor
    }

    /// Receive lifecycle and packet events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> Result<()> {
        self.link.connect(addr, cancel).await
    }

    /// Resolve `"host:port"` and connect.
    pub async fn connect_host(&self, host_port: &str, cancel: Option<Broadcast>) -> Result<()> {
        let addr = resolver::resolve(host_port).await?;
        self.connect(addr, cancel).await
    }

    pub async fn connect_host_port(&self, host: &str, port: u16, cancel: Option<Broadcast>) -> Result<()> {
        let addr = resolver::resolve_host(host, port).await?;
        self.connect(addr, cancel).await
    }

    /// Start an accepted client.
    pub async fn update_connection(&self) -> Result<()> {
        self.link.update_connection(Direction::Receiver).await
    }

    /// Send with the configured default ordering.
    pub async fn send(&self, packet: Packet, cancel: Option<Broadcast>) -> Result<()> {
        self.link.send(packet, self.config.packet_order, cancel).await
    }

    pub async fn send_with_order(&self, packet: Packet, order: PacketOrder, cancel: Option<Broadcast>) -> Result<()> {
        self.link.send(packet, order, cancel).await
    }

    /// Send raw bytes, confirmed.
    pub async fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Packet::new(bytes).requiring_confirmation(), None).await
    }

    pub async fn send_bytes_with_descriptor(&self, bytes: impl Into<Vec<u8>>, descriptor: impl Into<i32>) -> Result<()> {
        let packet = Packet::new(bytes).requiring_confirmation().with_descriptor(descriptor);
        self.send(packet, None).await
    }

    /// Serialize `value` with the session serializer and send it, confirmed.
    pub async fn send_object<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = self.config.serializer.serialize(value)?;
        self.send_bytes(bytes).await
    }

    pub async fn send_object_with_descriptor<T: Serialize>(&self, value: &T, descriptor: impl Into<i32>) -> Result<()> {
        let bytes = self.config.serializer.serialize(value)?;
        self.send_bytes_with_descriptor(bytes, descriptor).await
    }

    /// The oldest buffered packet handle; with `wait`, suspend until one
    /// arrives, the link goes down, or `cancel` fires.
    pub async fn get_handle(&self, wait: bool, cancel: Option<Broadcast>) -> Result<Option<PacketHandle>> {
        let deadline = CompositeDeadline::builder()
            .link_opt(Trip::Cancelled, cancel.as_ref())
            .link(Trip::Disconnected, &self.link.disconnect_signal())
            .build();
        Ok(self.distributor.get_next(wait, &deadline).await?)
    }

    pub async fn get_packet(&self, wait: bool) -> Result<Option<Packet>> {
        Ok(self
            .get_handle(wait, None)
            .await?
            .map(|handle| handle.packet().clone()))
    }

    pub async fn get_payload(&self, wait: bool) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_handle(wait, None)
            .await?
            .map(|handle| handle.payload().to_vec()))
    }

    pub async fn get_object<T: DeserializeOwned>(&self, wait: bool) -> Result<Option<T>> {
        match self.get_handle(wait, None).await? {
            Some(handle) => handle.object().map(Some),
            None => Ok(None),
        }
    }

    pub async fn session_id(&self) -> Result<String> {
        self.link.session_id().await
    }

    /// Graceful disconnect; resolves to whether it was graceful.
    pub async fn disconnect(&self) -> bool {
        self.link.disconnect().await
    }

    pub fn disconnect_fast(&self) {
        self.link.disconnect_fast()
    }

    pub fn dispose(&self) {
        self.link.dispose()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn direction(&self) -> Direction {
        self.link.direction()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    pub fn graceful_disconnect(&self) -> Option<bool> {
        self.link.graceful_disconnect()
    }

    pub fn disconnect_signal(&self) -> Broadcast {
        self.link.disconnect_signal()
    }
}

async fn forward(
    id: ConnectionId,
    mut link_events: LinkEvents,
    distributor: Arc<PacketDistributor>,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(event) = link_events.recv().await {
        let published = match event {
            LinkEvent::Connected => ClientEvent::Connected,
            LinkEvent::Packet(packet) => ClientEvent::PacketReceived(distributor.add_next(packet)),
            LinkEvent::Control(packet) => {
                tracing::trace!(connection_id = %id, packet_id = %packet.id(), "Ignoring unhandled internal packet");
                continue;
            }
            LinkEvent::Disconnected { graceful } => ClientEvent::Disconnected { graceful },
        };
        let _ = events.send(published);
    }
}
