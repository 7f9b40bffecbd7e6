//! Cryptographic primitives for the end-to-end encryption layer.
//!
//! # Key exchange
//! ```text
//! initiator: ephemeral RSA pair ──public key (PKCS#1 DER)──▶ receiver
//! receiver:  AES-256 key ‖ IV   ──RSA-PKCS#1 v1.5 blob───▶ initiator
//! both:      AES-256-CBC/PKCS7 for test signatures and application payloads
//! ```

mod encryptor;

pub use encryptor::{generate_keypair, CryptoError, Encryptor, RsaPrivateKey};

/// AES-256 key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// CBC IV length in bytes.
pub const IV_LEN: usize = 16;

/// Length of the RSA-encrypted `key ‖ IV` blob before encryption.
pub const KEY_BLOB_LEN: usize = AES_KEY_LEN + IV_LEN;

/// Smallest RSA modulus accepted for the ephemeral key pair.
pub const MIN_RSA_BITS: usize = 1024;
