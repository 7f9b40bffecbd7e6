//! Concurrency primitives the session layers are built from.
//!
//! # Data Flow
//! ```text
//! Broadcast   one-shot wake-all trigger (disconnect, dispose, caller cancel)
//! Gate        re-armable latch (session id resolved, peer drained, link secure)
//! Watched     set with "item removed" / "emptied" waits (unconfirmed packets)
//! Deadline    Broadcast links + optional timeout racing any future
//! ```
//!
//! # Design Decisions
//! - Everything is built on `tokio::sync::watch`, so no wait can miss a
//!   wake-up that happened between checking state and suspending
//! - Timeouts are a deadline racing the waited future, never a polling loop
//! - A deadline reports *which* source fired, so callers can tell their own
//!   cancellation apart from a disconnect or an expiry

pub mod broadcast;
pub mod deadline;
pub mod gate;
pub mod watched;

pub use broadcast::Broadcast;
pub use deadline::{CompositeDeadline, DeadlineBuilder, Trip};
pub use gate::Gate;
pub use watched::{Settled, WatchedCollection};
