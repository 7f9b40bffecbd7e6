//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use framelink::config::{ListenerConfig, SessionConfig};
use framelink::{Client, Listener};

/// Session settings with small keys and short timeouts.
pub fn test_session() -> SessionConfig {
    let mut config = SessionConfig {
        confirmation_timeout_ms: 2_000,
        graceful_disconnect_timeout_ms: 2_000,
        end_to_end_timeout_ms: 5_000,
        ..SessionConfig::default()
    };
    config.encryption.rsa_key_bits = 1024;
    config
}

pub fn listener_config(encrypted: bool) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        max_connections: 64,
        encrypted,
    }
}

/// Fail the test instead of hanging.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(15), future)
        .await
        .expect("operation did not finish in time")
}

/// A listener plus one client connected to it, and the accepted side.
pub async fn connected_pair(session: SessionConfig, encrypted: bool) -> (Listener, Client, Arc<Client>) {
    let listener = Listener::open(&listener_config(encrypted), session.clone())
        .await
        .unwrap();

    let client = Client::new(session, encrypted);
    within(client.connect(listener.local_addr(), None)).await.unwrap();
    let accepted = within(listener.next_client(None)).await.unwrap();
    (listener, client, accepted)
}

/// A peer that accepts one socket, reads everything and never answers.
pub async fn start_silent_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut sink = [0u8; 4096];
            while let Ok(n) = socket.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        }
    });
    addr
}

/// A TCP relay in front of `target` that records every byte it forwards.
pub async fn start_recording_relay(target: SocketAddr) -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::new(Mutex::new(Vec::new()));

    let tap = Arc::clone(&recorded);
    tokio::spawn(async move {
        while let Ok((inbound, _)) = listener.accept().await {
            let outbound = TcpStream::connect(target).await.unwrap();
            let (in_read, in_write) = inbound.into_split();
            let (out_read, out_write) = outbound.into_split();
            tokio::spawn(pipe(in_read, out_write, Arc::clone(&tap)));
            tokio::spawn(pipe(out_read, in_write, Arc::clone(&tap)));
        }
    });
    (addr, recorded)
}

async fn pipe(
    mut from: tokio::net::tcp::OwnedReadHalf,
    mut to: tokio::net::tcp::OwnedWriteHalf,
    tap: Arc<Mutex<Vec<u8>>>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tap.lock().unwrap().extend_from_slice(&buf[..n]);
                if to.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = to.shutdown().await;
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
