//! The connection capability shared by every layer.
//!
//! A plain [`Connection`](super::Connection) implements [`Link`]; the
//! [`SecureConnection`](super::SecureConnection) wraps one and implements it
//! again, so higher layers compose by wrapping instead of overriding.

use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::net::ConnectionId;
use crate::protocol::Packet;
use crate::sync::Broadcast;

/// Whether a send waits for its own confirmation before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketOrder {
    /// Wait for the confirmation; sends complete one at a time.
    #[default]
    Sequential,
    /// Return once written; confirmation is tracked but not awaited.
    NonSequential,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Unknown,
    Initiator,
    Receiver,
}

/// Something a link reports to the layer above it.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link is ready for application traffic.
    Connected,
    /// An application packet arrived.
    Packet(Packet),
    /// An internal packet this layer did not consume.
    Control(Packet),
    /// The link went down.
    Disconnected { graceful: bool },
}

/// Receiving end of a link's events.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// A point-to-point packet connection.
pub trait Link: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    /// Open an outbound connection to `addr`.
    fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> BoxFuture<'_, Result<()>>;

    /// Begin the lifecycle of an already established socket.
    fn update_connection(&self, direction: Direction) -> BoxFuture<'_, Result<()>>;

    fn send(
        &self,
        packet: Packet,
        order: PacketOrder,
        cancel: Option<Broadcast>,
    ) -> BoxFuture<'_, Result<()>>;

    /// The session id negotiated with the peer.
    fn session_id(&self) -> BoxFuture<'_, Result<String>>;

    /// Run the graceful disconnect; resolves to whether it was graceful.
    fn disconnect(&self) -> BoxFuture<'_, bool>;

    /// Close immediately without a rendezvous.
    fn disconnect_fast(&self);

    /// Release every resource. Idempotent.
    fn dispose(&self);

    fn is_connected(&self) -> bool;

    fn direction(&self) -> Direction;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Outcome of the last disconnect, once known.
    fn graceful_disconnect(&self) -> Option<bool>;

    /// Fires when the underlying transport goes down.
    fn disconnect_signal(&self) -> Broadcast;
}
