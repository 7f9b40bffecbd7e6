//! Payloads of internal control packets.

/// Announces a locally initiated disconnect; the peer runs the rendezvous.
pub const DISCONNECT: &[u8] = b"DISCONNECT";

/// Sent once all outstanding confirmations have settled during a disconnect.
pub const PACKETS_PROCESSED: &[u8] = b"PACKETS_PROCESSED";

/// Encrypted by both peers to prove they agree on the negotiated key.
pub const ENCRYPTION_TEST: &[u8] = b"E2EE_TEST";

/// Length of each peer's half of the session id.
pub const SESSION_PART_LEN: usize = 16;
