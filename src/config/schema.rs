//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Durations are stored as milliseconds and exposed through accessors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serializer::{JsonSerializer, PayloadSerializer};
use crate::session::PacketOrder;

/// Root configuration for the `framelink` binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FramelinkConfig {
    /// Accept-side settings.
    pub listener: ListenerConfig,

    /// Per-connection behaviour, shared by accepted and outbound connections.
    pub session: SessionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7420").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Wrap accepted connections in the end-to-end encryption layer.
    pub encrypted: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7420".to_string(),
            max_connections: 1024,
            encrypted: true,
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Strategy behind the typed send/receive helpers.
    #[serde(skip, default = "default_serializer")]
    pub serializer: Arc<dyn PayloadSerializer>,

    /// Distributor byte cap; `-1` disables the cap.
    pub max_internal_buffer_size: i64,

    /// Bound on the disconnect rendezvous.
    pub graceful_disconnect_timeout_ms: u64,

    /// Age after which unread packets are evicted (when enabled).
    pub delete_packets_older_than_ms: u64,

    /// Bound on a sequential send's confirmation wait.
    pub confirmation_timeout_ms: u64,

    /// Bound on the encryption handshake.
    pub end_to_end_timeout_ms: u64,

    /// Default ordering for sends that don't specify one.
    pub packet_order: PacketOrder,

    /// Enable age-based distributor eviction.
    pub auto_delete_old_packets: bool,

    /// Emit lifecycle and handshake debug events.
    pub debug_log: bool,

    /// Emit per-packet trace events (requires `debug_log`).
    pub debug_packets: bool,

    /// Largest frame accepted from a peer.
    pub max_frame_size: usize,

    /// Local port for outbound connections; 0 picks an ephemeral port.
    pub local_port: u16,

    /// End-to-end encryption parameters.
    pub encryption: EncryptionConfig,
}

fn default_serializer() -> Arc<dyn PayloadSerializer> {
    Arc::new(JsonSerializer)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serializer: default_serializer(),
            max_internal_buffer_size: 5_242_880,
            graceful_disconnect_timeout_ms: 10_000,
            delete_packets_older_than_ms: 30_000,
            confirmation_timeout_ms: 10_000,
            end_to_end_timeout_ms: 10_000,
            packet_order: PacketOrder::Sequential,
            auto_delete_old_packets: false,
            debug_log: false,
            debug_packets: false,
            max_frame_size: 16 * 1024 * 1024,
            local_port: 0,
            encryption: EncryptionConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn graceful_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_disconnect_timeout_ms)
    }

    pub fn delete_packets_older_than(&self) -> Duration {
        Duration::from_millis(self.delete_packets_older_than_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn end_to_end_timeout(&self) -> Duration {
        Duration::from_millis(self.end_to_end_timeout_ms)
    }

    /// The distributor cap in bytes, `None` when unbounded.
    pub fn buffer_cap(&self) -> Option<usize> {
        usize::try_from(self.max_internal_buffer_size).ok()
    }

    pub(crate) fn logs_packets(&self) -> bool {
        self.debug_log && self.debug_packets
    }
}

/// End-to-end encryption parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// RSA modulus size for the ephemeral key pair.
    pub rsa_key_bits: usize,

    /// Prefix every AES payload with a fresh IV instead of reusing the
    /// negotiated one. Both peers must agree.
    pub per_message_iv: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            rsa_key_bits: 2048,
            per_message_iv: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_cap(), Some(5_242_880));
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(10));
        assert_eq!(config.delete_packets_older_than(), Duration::from_secs(30));
        assert_eq!(config.packet_order, PacketOrder::Sequential);
        assert!(!config.auto_delete_old_packets);
        assert!(config.encryption.per_message_iv);
    }

    #[test]
    fn unbounded_buffer() {
        let config = SessionConfig {
            max_internal_buffer_size: -1,
            ..SessionConfig::default()
        };
        assert_eq!(config.buffer_cap(), None);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: FramelinkConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:9000"

            [session]
            packet_order = "non_sequential"
            confirmation_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
        assert_eq!(config.listener.max_connections, 1024);
        assert_eq!(config.session.packet_order, PacketOrder::NonSequential);
        assert_eq!(config.session.confirmation_timeout(), Duration::from_millis(250));
        assert_eq!(config.session.graceful_disconnect_timeout_ms, 10_000);
        assert_eq!(config.observability.log_level, "info");
    }
}
