//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (connection_id, packet_id, ...)
//!     → logging.rs subscriber (env filter + fmt layer)
//!     → stdout
//! ```
//!
//! # Design Decisions
//! - Lifecycle and handshake events are `debug!`, gated by `debug_log`
//! - Per-packet events are `trace!`, gated by `debug_log` and `debug_packets`
//! - Faults that end a connection are always logged at `warn!`

pub mod logging;

pub use logging::init_logging;
