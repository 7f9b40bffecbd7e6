//! Packet model and wire encoding.
//!
//! # Data Flow
//! ```text
//! Outbound: Packet → packet.rs encode() → frame payload → net::transport
//! Inbound:  net::transport frame → packet.rs decode() → Packet { source: Remote }
//! ```
//!
//! # Layout
//! ```text
//! [16-byte id][u32 options]                          base packet (confirmations)
//! [16-byte id][u32 options][payload...][i32 descriptor]  data packet
//! ```
//! All integers are little-endian. A data packet without a descriptor
//! carries `-1` in the trailing field and leaves `HAS_DESCRIPTOR` clear.

pub mod packet;
pub mod signatures;

pub use packet::{Packet, PacketId, PacketOptions, Source};
