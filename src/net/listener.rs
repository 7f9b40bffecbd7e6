//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections and build clients via a factory
//! - Enforce max_connections limit via semaphore
//! - Track live clients and hand each newly connected one out once

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::{ListenerConfig, SessionConfig};
use crate::error::{Result, SessionError};
use crate::net::registry::ConnectionRegistry;
use crate::session::{Client, ClientEvent};
use crate::sync::{Broadcast, CompositeDeadline, Trip};

/// Builds a client around each accepted socket.
pub type ClientFactory = Arc<dyn Fn(TcpStream, &SessionConfig) -> Client + Send + Sync>;

/// The factory used by [`Listener::open`].
pub fn default_factory(encrypted: bool) -> ClientFactory {
    Arc::new(move |stream, session| Client::from_stream(stream, session.clone(), encrypted))
}

/// A bounded TCP listener producing connected clients.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait in the OS backlog until a slot becomes available.
pub struct Listener {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry<Arc<Client>>>,
    ready: Mutex<mpsc::UnboundedReceiver<Weak<Client>>>,
    closed: Broadcast,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("open", &self.is_open())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Listener {
    /// Bind and start accepting with the default client factory.
    pub async fn open(config: &ListenerConfig, session: SessionConfig) -> Result<Self> {
        Self::open_with(config, session, default_factory(config.encrypted)).await
    }

    /// Bind and start accepting, building clients with `factory`.
    pub async fn open_with(config: &ListenerConfig, session: SessionConfig, factory: ClientFactory) -> Result<Self> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| SessionError::InvalidAddress(config.bind_address.clone()))?;

        let listener = TcpListener::bind(addr).await.map_err(SessionError::Bind)?;
        let local_addr = listener.local_addr().map_err(SessionError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            encrypted = config.encrypted,
            "Listener bound"
        );

        let registry = Arc::new(ConnectionRegistry::new());
        let closed = Broadcast::new();
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(AcceptLoop {
            inner: listener,
            session,
            factory,
            registry: Arc::clone(&registry),
            ready: ready_tx,
            closed: closed.clone(),
            connection_limit: Arc::clone(&connection_limit),
        }));

        Ok(Self {
            local_addr,
            registry,
            ready: Mutex::new(ready_rx),
            closed,
            connection_limit,
            max_connections: config.max_connections,
        })
    }

    /// The next client that completed its connection, each yielded once.
    /// Clients that went down before being picked up are skipped; the queue
    /// holds them weakly, so one nobody asks for is freed once it is gone.
    pub async fn next_client(&self, cancel: Option<Broadcast>) -> Result<Arc<Client>> {
        let deadline = CompositeDeadline::builder()
            .link_opt(Trip::Cancelled, cancel.as_ref())
            .link(Trip::Closed, &self.closed)
            .build();

        let mut ready = deadline.run(self.ready.lock()).await?;
        loop {
            let client = deadline
                .run(ready.recv())
                .await?
                .ok_or(SessionError::NotListening)?;
            if let Some(client) = client.upgrade().filter(|client| client.is_connected()) {
                return Ok(client);
            }
        }
    }

    /// Stop accepting. Connected clients are left alone.
    pub fn close(&self) {
        if self.closed.trigger() {
            tracing::info!(address = %self.local_addr, "Listener closed");
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_triggered()
    }

    /// Gracefully disconnect every live client concurrently.
    pub async fn disconnect_all(&self) {
        let clients = self.clients();
        join_all(clients.iter().map(|client| client.disconnect())).await;
    }

    /// Every live client.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.registry.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.closed.trigger();
    }
}

struct AcceptLoop {
    inner: TcpListener,
    session: SessionConfig,
    factory: ClientFactory,
    registry: Arc<ConnectionRegistry<Arc<Client>>>,
    ready: mpsc::UnboundedSender<Weak<Client>>,
    closed: Broadcast,
    connection_limit: Arc<Semaphore>,
}

async fn accept_loop(state: AcceptLoop) {
    loop {
        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            _ = state.closed.triggered() => break,
            permit = Arc::clone(&state.connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer_addr) = tokio::select! {
            _ = state.closed.triggered() => break,
            accepted = state.inner.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let client = Arc::new((state.factory)(stream, &state.session));
        tracing::debug!(
            connection_id = %client.id(),
            peer_addr = %peer_addr,
            available_permits = state.connection_limit.available_permits(),
            "Connection accepted"
        );

        state.registry.register(client.id(), Arc::clone(&client));
        tokio::spawn(supervise(
            client,
            permit,
            Arc::clone(&state.registry),
            state.ready.clone(),
        ));
    }
}

/// Start an accepted client, publish it once connected, and unregister it
/// when it goes down. The permit is held for the client's lifetime.
async fn supervise(
    client: Arc<Client>,
    permit: OwnedSemaphorePermit,
    registry: Arc<ConnectionRegistry<Arc<Client>>>,
    ready: mpsc::UnboundedSender<Weak<Client>>,
) {
    let disconnected = client.disconnect_signal();
    let mut events = client.subscribe();

    if let Err(e) = client.update_connection().await {
        tracing::warn!(connection_id = %client.id(), error = %e, "Accepted connection failed to start");
    } else {
        loop {
            tokio::select! {
                biased;
                _ = disconnected.triggered() => break,
                event = events.recv() => match event {
                    Ok(ClientEvent::Connected) => {
                        let _ = ready.send(Arc::downgrade(&client));
                    }
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    registry.remove(client.id());
    client.dispose();
    drop(permit);
}
