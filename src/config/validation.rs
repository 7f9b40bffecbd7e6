//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, buffer cap >= -1)
//! - Check the RSA modulus can carry the AES key blob
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FramelinkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{FramelinkConfig, ListenerConfig, SessionConfig};
use crate::crypto::{KEY_BLOB_LEN, MIN_RSA_BITS};

/// A single semantic problem with a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("session.max_internal_buffer_size must be -1 or non-negative, got {0}")]
    BufferSize(i64),

    #[error("session.encryption.rsa_key_bits must be at least {min}, got {actual}")]
    RsaKeyTooSmall { min: usize, actual: usize },

    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),
}

/// Validate a whole configuration.
pub fn validate_config(config: &FramelinkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_listener(&config.listener, &mut errors);
    validate_session(&config.session, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate only the per-connection section.
pub fn validate_session_config(config: &SessionConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    validate_session(config, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(config: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if config.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.bind_address.clone()));
    }
    if config.max_connections == 0 {
        errors.push(ValidationError::NotPositive {
            field: "listener.max_connections",
        });
    }
}

fn validate_session(config: &SessionConfig, errors: &mut Vec<ValidationError>) {
    if config.max_internal_buffer_size < -1 {
        errors.push(ValidationError::BufferSize(config.max_internal_buffer_size));
    }

    let timeouts = [
        ("session.graceful_disconnect_timeout_ms", config.graceful_disconnect_timeout_ms),
        ("session.delete_packets_older_than_ms", config.delete_packets_older_than_ms),
        ("session.confirmation_timeout_ms", config.confirmation_timeout_ms),
        ("session.end_to_end_timeout_ms", config.end_to_end_timeout_ms),
    ];
    for (field, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    if config.max_frame_size == 0 {
        errors.push(ValidationError::NotPositive {
            field: "session.max_frame_size",
        });
    }

    // PKCS#1 v1.5 needs 11 bytes of padding around the key blob.
    let min_bits = MIN_RSA_BITS.max((KEY_BLOB_LEN + 11) * 8);
    if config.encryption.rsa_key_bits < min_bits {
        errors.push(ValidationError::RsaKeyTooSmall {
            min: min_bits,
            actual: config.encryption.rsa_key_bits,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&FramelinkConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = FramelinkConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.listener.max_connections = 0;
        config.session.max_internal_buffer_size = -2;
        config.session.confirmation_timeout_ms = 0;
        config.session.encryption.rsa_key_bits = 512;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::BufferSize(-2)));
        assert!(errors.contains(&ValidationError::NotPositive {
            field: "session.confirmation_timeout_ms"
        }));
        assert!(errors.contains(&ValidationError::BindAddress("nowhere".into())));
    }

    #[test]
    fn unbounded_buffer_is_accepted() {
        let config = SessionConfig {
            max_internal_buffer_size: -1,
            ..SessionConfig::default()
        };
        assert!(validate_session_config(&config).is_ok());
    }
}
