//! End-to-end encryption layered over a [`Connection`].
//!
//! # Handshake
//! ```text
//! initiator (Unencrypted)                       receiver (Unencrypted)
//!   keygen, send public key → Handshake   ───▶  import key, new AES key+IV,
//!                                               send RSA(key ‖ IV) → Control
//!   decrypt blob, send AES(test) → Control ◀──
//!                                         ───▶  verify test, send AES(test) → Encrypted
//!   verify test → Encrypted               ◀──
//! ```
//!
//! All handshake packets are internal and sent `NonSequential`: they are
//! produced inside the event pump, which is also what processes the
//! confirmations, so waiting on them there would deadlock.
//!
//! The pump is the only place state transitions happen, which makes the
//! handshake a single critical section per connection. Application packets
//! that overtake the final handshake packet are held and released,
//! decrypted, once the state reaches `Encrypted`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::crypto::{generate_keypair, CryptoError, Encryptor};
use crate::error::{Result, SessionError};
use crate::net::ConnectionId;
use crate::protocol::{signatures, Packet};
use crate::session::connection::Connection;
use crate::session::link::{Direction, Link, LinkEvent, LinkEvents, PacketOrder};
use crate::sync::{Broadcast, CompositeDeadline, Gate, Trip};

/// Progress of the encryption handshake. Only moves forward, except for the
/// reset to `Unencrypted` when the connection goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionState {
    Unencrypted,
    Handshake,
    Control,
    Encrypted,
}

struct SecureState {
    id: ConnectionId,
    config: SessionConfig,
    phase: Mutex<EncryptionState>,
    encryptor: Mutex<Encryptor>,
    secure: Gate,
    fault: Mutex<Option<String>>,
    held: Mutex<Vec<Packet>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// A [`Connection`] whose application payloads are encrypted end to end.
pub struct SecureConnection {
    inner: Arc<Connection>,
    state: Arc<SecureState>,
}

impl std::fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("inner", &self.inner)
            .field("state", &self.encryption_state())
            .finish()
    }
}

impl SecureConnection {
    /// A secure connection that will dial out.
    pub fn new(config: SessionConfig) -> (Arc<Self>, LinkEvents) {
        let (inner, inner_events) = Connection::new(config.clone());
        Self::wrap(inner, inner_events, config)
    }

    /// A secure connection around an accepted socket.
    pub fn accepted(stream: TcpStream, config: SessionConfig) -> (Arc<Self>, LinkEvents) {
        let (inner, inner_events) = Connection::accepted(stream, config.clone());
        Self::wrap(inner, inner_events, config)
    }

    fn wrap(inner: Arc<Connection>, inner_events: LinkEvents, config: SessionConfig) -> (Arc<Self>, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SecureState {
            id: inner.id(),
            encryptor: Mutex::new(Encryptor::new(config.encryption.per_message_iv)),
            config,
            phase: Mutex::new(EncryptionState::Unencrypted),
            secure: Gate::blocked(),
            fault: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            events,
        });

        tokio::spawn(pump(Arc::downgrade(&inner), Arc::clone(&state), inner_events));
        (Arc::new(Self { inner, state }), rx)
    }

    pub fn encryption_state(&self) -> EncryptionState {
        self.state.phase()
    }

    /// The wrapped plain connection.
    pub fn inner(&self) -> &Arc<Connection> {
        &self.inner
    }

    /// Dial `addr` and complete the handshake within the end-to-end timeout.
    pub async fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> Result<()> {
        // The pump resets a previous session asynchronously; make sure this
        // attempt never sees its open gate.
        if !self.inner.is_connected() {
            self.state.reset();
        }
        self.inner.connect(addr, cancel.clone()).await?;

        match self.wait_secure(cancel.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.disconnect_fast();
                Err(e)
            }
        }
    }

    /// Start an accepted connection and arm the handshake watchdog.
    pub async fn update_connection(&self, direction: Direction) -> Result<()> {
        self.inner.update_connection(direction).await?;

        let inner = Arc::downgrade(&self.inner);
        let state = Arc::clone(&self.state);
        let disconnected = self.inner.disconnect_signal();
        tokio::spawn(async move {
            let deadline = CompositeDeadline::builder()
                .link(Trip::Disconnected, &disconnected)
                .timeout(state.config.end_to_end_timeout())
                .build();
            if let Err(Trip::TimedOut) = deadline.run(state.secure.wait()).await {
                tracing::warn!(connection_id = %state.id, "End-to-end handshake timed out");
                if let Some(inner) = inner.upgrade() {
                    inner.disconnect_fast();
                }
            }
        });
        Ok(())
    }

    async fn wait_secure(&self, cancel: Option<&Broadcast>) -> Result<()> {
        let deadline = self
            .inner
            .deadline(cancel)
            .timeout(self.state.config.end_to_end_timeout())
            .build();

        deadline.run(self.state.secure.wait()).await.map_err(|trip| {
            if let Some(fault) = self.state.fault() {
                return SessionError::HandshakeFault(fault);
            }
            match trip {
                Trip::TimedOut => SessionError::Timeout("end-to-end handshake"),
                other => other.into(),
            }
        })
    }

    /// Encrypt and send. Waits for the handshake if it is still running.
    pub async fn send(&self, mut packet: Packet, order: PacketOrder, cancel: Option<Broadcast>) -> Result<()> {
        if !packet.is_internal() {
            self.wait_secure(cancel.as_ref()).await?;
            let ciphertext = self
                .state
                .encryptor()
                .encrypt_aes(packet.payload())
                .map_err(|e| SessionError::HandshakeFault(e.to_string()))?;
            packet.set_payload(ciphertext);
        }
        self.inner.send(packet, order, cancel).await
    }
}

impl SecureState {
    fn phase(&self) -> EncryptionState {
        *self.phase.lock().expect("encryption state mutex poisoned")
    }

    fn set_phase(&self, next: EncryptionState) {
        *self.phase.lock().expect("encryption state mutex poisoned") = next;
        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id, state = ?next, "Encryption state changed");
        }
    }

    fn encryptor(&self) -> std::sync::MutexGuard<'_, Encryptor> {
        self.encryptor.lock().expect("encryptor mutex poisoned")
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().expect("fault mutex poisoned").clone()
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Initiator step: generate a key pair and offer the public key.
    async fn begin(&self, connection: &Connection) -> Result<()> {
        let bits = self.config.encryption.rsa_key_bits;
        let key = tokio::task::spawn_blocking(move || generate_keypair(bits))
            .await
            .map_err(|e| SessionError::HandshakeFault(format!("key generation aborted: {e}")))?
            .map_err(handshake_fault)?;

        let public_key = {
            let mut encryptor = self.encryptor();
            encryptor.set_private_key(key);
            encryptor.public_key_der().map_err(handshake_fault)?
        };

        connection
            .send(Packet::internal(public_key).requiring_confirmation(), PacketOrder::NonSequential, None)
            .await?;
        self.set_phase(EncryptionState::Handshake);
        Ok(())
    }

    /// React to one internal packet from the peer.
    async fn advance(&self, connection: &Connection, packet: Packet) -> Result<()> {
        let phase = self.phase();
        let direction = connection.direction();

        match (phase, direction) {
            (EncryptionState::Unencrypted, Direction::Receiver) => {
                let sealed = {
                    let mut encryptor = self.encryptor();
                    encryptor
                        .set_peer_public_key(packet.payload())
                        .map_err(handshake_fault)?;
                    encryptor.generate_aes();
                    let blob = encryptor.key_blob().map_err(handshake_fault)?;
                    encryptor.encrypt_rsa(&blob).map_err(handshake_fault)?
                };
                self.send_control(connection, sealed).await?;
                self.set_phase(EncryptionState::Control);
            }
            (EncryptionState::Handshake, Direction::Initiator) => {
                let test = {
                    let mut encryptor = self.encryptor();
                    let blob = encryptor.decrypt_rsa(packet.payload()).map_err(handshake_fault)?;
                    encryptor.set_key_blob(&blob).map_err(handshake_fault)?;
                    encryptor
                        .encrypt_aes(signatures::ENCRYPTION_TEST)
                        .map_err(handshake_fault)?
                };
                self.send_control(connection, test).await?;
                self.set_phase(EncryptionState::Control);
            }
            (EncryptionState::Control, _) => {
                let echo = {
                    let encryptor = self.encryptor();
                    let plain = encryptor
                        .decrypt_aes(packet.payload())
                        .map_err(|_| SessionError::HandshakeFault("test signature does not decrypt".into()))?;
                    if plain != signatures::ENCRYPTION_TEST {
                        return Err(SessionError::HandshakeFault("test signature mismatch".into()));
                    }
                    if direction == Direction::Receiver {
                        Some(
                            encryptor
                                .encrypt_aes(signatures::ENCRYPTION_TEST)
                                .map_err(handshake_fault)?,
                        )
                    } else {
                        None
                    }
                };
                if let Some(echo) = echo {
                    self.send_control(connection, echo).await?;
                }
                self.set_phase(EncryptionState::Encrypted);
                self.secured();
            }
            (EncryptionState::Encrypted, _) => {
                // Not part of the handshake; left to the layer above.
                self.emit(LinkEvent::Control(packet));
            }
            (phase, direction) => {
                return Err(SessionError::HandshakeFault(format!(
                    "unexpected internal packet in state {phase:?} as {direction:?}"
                )));
            }
        }
        Ok(())
    }

    async fn send_control(&self, connection: &Connection, payload: Vec<u8>) -> Result<()> {
        connection
            .send(Packet::internal(payload).requiring_confirmation(), PacketOrder::NonSequential, None)
            .await
    }

    /// Handshake complete: open the gate, announce, release held packets.
    fn secured(&self) {
        self.secure.open();
        if self.config.debug_log {
            tracing::debug!(connection_id = %self.id, "End-to-end encryption established");
        }
        self.emit(LinkEvent::Connected);

        let held = std::mem::take(&mut *self.held.lock().expect("held packets mutex poisoned"));
        for packet in held {
            if let Err(e) = self.deliver(packet) {
                tracing::warn!(connection_id = %self.id, error = %e, "Dropping undecryptable packet");
            }
        }
    }

    /// Decrypt and forward an application packet.
    fn deliver(&self, mut packet: Packet) -> std::result::Result<(), CryptoError> {
        let plain = self.encryptor().decrypt_aes(packet.payload())?;
        packet.set_payload(plain);
        self.emit(LinkEvent::Packet(packet));
        Ok(())
    }

    fn on_packet(&self, connection: Option<&Connection>, packet: Packet) {
        if self.phase() != EncryptionState::Encrypted {
            self.held.lock().expect("held packets mutex poisoned").push(packet);
            return;
        }
        if let Err(e) = self.deliver(packet) {
            tracing::warn!(connection_id = %self.id, error = %e, "Undecryptable packet, closing connection");
            if let Some(connection) = connection {
                connection.disconnect_fast();
            }
        }
    }

    fn fail(&self, connection: &Connection, error: SessionError) {
        tracing::warn!(connection_id = %self.id, error = %error, "End-to-end handshake failed");
        if let SessionError::HandshakeFault(reason) = &error {
            *self.fault.lock().expect("fault mutex poisoned") = Some(reason.clone());
        }
        connection.disconnect_fast();
    }

    fn reset(&self) {
        *self.phase.lock().expect("encryption state mutex poisoned") = EncryptionState::Unencrypted;
        *self.fault.lock().expect("fault mutex poisoned") = None;
        self.encryptor().reset();
        self.secure.block();
        self.held.lock().expect("held packets mutex poisoned").clear();
    }
}

fn handshake_fault(error: CryptoError) -> SessionError {
    SessionError::HandshakeFault(error.to_string())
}

/// Consume the inner connection's events one at a time.
async fn pump(inner: Weak<Connection>, state: Arc<SecureState>, mut events: LinkEvents) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Connected => {
                let Some(connection) = inner.upgrade() else { break };
                if connection.direction() == Direction::Initiator {
                    if let Err(e) = state.begin(&connection).await {
                        state.fail(&connection, e);
                    }
                }
            }
            LinkEvent::Control(packet) => {
                let Some(connection) = inner.upgrade() else { break };
                if let Err(e) = state.advance(&connection, packet).await {
                    state.fail(&connection, e);
                }
            }
            LinkEvent::Packet(packet) => {
                let connection = inner.upgrade();
                state.on_packet(connection.as_deref(), packet);
            }
            LinkEvent::Disconnected { graceful } => {
                state.reset();
                state.emit(LinkEvent::Disconnected { graceful });
            }
        }
    }
}

impl Link for SecureConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn connect(&self, addr: SocketAddr, cancel: Option<Broadcast>) -> BoxFuture<'_, Result<()>> {
        SecureConnection::connect(self, addr, cancel).boxed()
    }

    fn update_connection(&self, direction: Direction) -> BoxFuture<'_, Result<()>> {
        SecureConnection::update_connection(self, direction).boxed()
    }

    fn send(&self, packet: Packet, order: PacketOrder, cancel: Option<Broadcast>) -> BoxFuture<'_, Result<()>> {
        SecureConnection::send(self, packet, order, cancel).boxed()
    }

    fn session_id(&self) -> BoxFuture<'_, Result<String>> {
        self.inner.session_id().boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, bool> {
        self.inner.disconnect().boxed()
    }

    fn disconnect_fast(&self) {
        self.inner.disconnect_fast()
    }

    fn dispose(&self) {
        self.inner.dispose();
        self.state.encryptor().reset();
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn graceful_disconnect(&self) -> Option<bool> {
        self.inner.graceful_disconnect()
    }

    fn disconnect_signal(&self) -> Broadcast {
        self.inner.disconnect_signal()
    }
}
