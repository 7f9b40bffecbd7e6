//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FramelinkConfig (validated, immutable)
//!     → SessionConfig cloned into every connection
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a connection keeps the copy it was built with
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::EncryptionConfig;
pub use schema::FramelinkConfig;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
pub use schema::SessionConfig;
