//! Session subsystem: connections, their protocols and the client facade.
//!
//! # Data Flow
//! ```text
//! net::FramedTransport
//!     → connection.rs (confirmations, session id, internal dispatch)
//!     → disconnect.rs (graceful rendezvous)
//!     → secure.rs (optional: handshake, payload encryption)
//!     → client.rs (distributor.rs buffer, event feed)
//!     → application (get_* / subscribe)
//! ```
//!
//! # Design Decisions
//! - Layers compose by wrapping, each implementing [`Link`]
//! - Events travel up through channels, never callbacks
//! - Every wait links the caller's cancellation with the link's disconnect

pub mod client;
pub mod connection;
mod disconnect;
pub mod distributor;
pub mod handle;
pub mod link;
pub mod secure;

pub use client::{Client, ClientEvent};
pub use connection::{Connection, ConnectionState};
pub use distributor::PacketDistributor;
pub use handle::PacketHandle;
pub use link::{Direction, Link, LinkEvent, LinkEvents, PacketOrder};
pub use secure::{EncryptionState, SecureConnection};
