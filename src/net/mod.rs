//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → registry.rs (identity, live-connection tracking)
//!     → session::Client (lifecycle, protocol)
//!
//! Outgoing connection
//!     → resolver.rs (host:port → address)
//!     → session::Client::connect
//!
//! Both directions
//!     → transport.rs (length-prefixed frames)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each accepted connection is registered until it reports disconnection

pub mod listener;
pub mod registry;
pub mod resolver;
pub mod transport;

pub use listener::{ClientFactory, Listener};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use transport::FramedTransport;
