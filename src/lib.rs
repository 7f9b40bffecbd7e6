//! Point-to-point TCP sessions with confirmed delivery, a graceful
//! disconnect rendezvous and optional end-to-end encryption.

pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod serializer;
pub mod session;
pub mod sync;

pub use config::{FramelinkConfig, SessionConfig};
pub use error::{Result, SessionError};
pub use net::Listener;
pub use protocol::Packet;
pub use session::{Client, ClientEvent, PacketOrder};
