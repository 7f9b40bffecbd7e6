//! Length-prefixed framing over a TCP stream.
//!
//! # Responsibilities
//! - Write `[i32 length][payload]` frames, one writer at a time
//! - Read frames back with bounded reads and classify failures
//! - Own the disconnect signal every higher-layer wait links to
//!
//! # Design Decisions
//! - The read half lives in the receive loop, the write half behind a mutex
//! - Every socket fault surfaces as `NotConnected`; only protocol-level
//!   violations (bad lengths, truncated frames on a live socket) are `CorruptData`
//! - Frames are dispatched on their own tasks; the loop waits for the ones
//!   still in flight when the peer hangs up so trailing control packets are seen

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::error::{Result, SessionError};
use crate::sync::Broadcast;

const LENGTH_PREFIX: usize = 4;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
struct Endpoints {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

/// A framed, single-use stream transport.
#[derive(Debug)]
pub struct FramedTransport {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    endpoints: Mutex<Endpoints>,
    attached: AtomicBool,
    disconnected: Broadcast,
    max_frame_size: usize,
}

impl FramedTransport {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            endpoints: Mutex::new(Endpoints::default()),
            attached: AtomicBool::new(false),
            disconnected: Broadcast::new(),
            max_frame_size,
        }
    }

    /// Take ownership of `stream`. Returns the read half for [`receive_loop`](Self::receive_loop).
    pub async fn attach(&self, stream: TcpStream) -> Result<OwnedReadHalf> {
        if self.disconnected.is_triggered() {
            return Err(SessionError::InvalidState("transport already closed"));
        }
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InvalidState("transport already attached"));
        }

        let _ = stream.set_nodelay(true);
        *self.endpoints.lock().expect("endpoints mutex poisoned") = Endpoints {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
        };

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        Ok(reader)
    }

    pub fn is_connected(&self) -> bool {
        self.attached.load(Ordering::SeqCst) && !self.disconnected.is_triggered()
    }

    /// Fires once, when the transport stops being usable.
    pub fn disconnected(&self) -> &Broadcast {
        &self.disconnected
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoints.lock().expect("endpoints mutex poisoned").local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.endpoints.lock().expect("endpoints mutex poisoned").remote
    }

    /// Write one frame. Returns the number of bytes put on the wire.
    pub async fn send_frame(&self, payload: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let length = i32::try_from(payload.len())
            .map_err(|_| SessionError::CorruptData(format!("frame of {} bytes is too large", payload.len())))?;

        let write = async {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => {
                    writer.write_all(&length.to_le_bytes()).await?;
                    writer.write_all(payload).await?;
                    Ok::<_, std::io::Error>(LENGTH_PREFIX + payload.len())
                }
                None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            }
        };

        let written = tokio::select! {
            biased;
            result = write => result,
            _ = self.disconnected.triggered() => return Err(SessionError::NotConnected),
        };

        written.map_err(|e| {
            tracing::debug!(error = %e, "Frame write failed");
            self.mark_disconnected();
            SessionError::NotConnected
        })
    }

    /// Read frames until the transport ends, handing each to `on_frame` on
    /// its own task. Returns why the loop stopped.
    pub async fn receive_loop<F, Fut>(&self, mut reader: OwnedReadHalf, on_frame: F) -> SessionError
    where
        F: Fn(Vec<u8>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inflight = JoinSet::new();

        let reason = loop {
            let frame = tokio::select! {
                biased;
                _ = self.disconnected.triggered() => break SessionError::NotConnected,
                frame = self.read_frame(&mut reader) => frame,
            };

            match frame {
                Ok(frame) => {
                    inflight.spawn(on_frame(frame));
                    while inflight.try_join_next().is_some() {}
                }
                Err(e) => break e,
            }
        };

        if self.disconnected.is_triggered() {
            inflight.detach_all();
        } else {
            while inflight.join_next().await.is_some() {}
        }

        self.mark_disconnected();
        reason
    }

    async fn read_frame(&self, reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
        let mut header = [0u8; LENGTH_PREFIX];
        let mut filled = 0;
        while filled < LENGTH_PREFIX {
            match reader.read(&mut header[filled..]).await {
                Ok(0) if filled == 0 => return Err(SessionError::NotConnected),
                Ok(0) => return Err(self.classify_short_read("frame header", filled, LENGTH_PREFIX)),
                Ok(n) => filled += n,
                Err(_) => return Err(SessionError::NotConnected),
            }
        }

        let length = i32::from_le_bytes(header);
        if length <= 0 {
            if self.socket_unusable(reader) {
                return Err(SessionError::NotConnected);
            }
            return Err(SessionError::CorruptData(format!("invalid frame length {length}")));
        }

        let length = length as usize;
        if length > self.max_frame_size {
            return Err(SessionError::CorruptData(format!(
                "frame length {length} exceeds limit {}",
                self.max_frame_size
            )));
        }

        let mut payload = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let end = (filled + READ_CHUNK).min(length);
            match reader.read(&mut payload[filled..end]).await {
                Ok(0) => return Err(self.classify_short_read("frame payload", filled, length)),
                Ok(n) => filled += n,
                Err(_) => return Err(SessionError::NotConnected),
            }
        }
        Ok(payload)
    }

    fn classify_short_read(&self, what: &str, got: usize, wanted: usize) -> SessionError {
        if self.disconnected.is_triggered() {
            SessionError::NotConnected
        } else {
            SessionError::CorruptData(format!("{what} truncated at {got} of {wanted} bytes"))
        }
    }

    fn socket_unusable(&self, reader: &OwnedReadHalf) -> bool {
        self.disconnected.is_triggered() || reader.peer_addr().is_err()
    }

    /// Returns `true` for the caller that actually flipped the state.
    pub fn mark_disconnected(&self) -> bool {
        self.disconnected.trigger()
    }

    /// Disconnect and shut the write half down.
    pub async fn close(&self) {
        self.mark_disconnected();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Disconnect without waiting; the write half is dropped if it is free,
    /// otherwise by whichever writer currently holds it.
    pub fn close_now(&self) {
        self.mark_disconnected();
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn collecting(
        transport: &Arc<FramedTransport>,
        reader: OwnedReadHalf,
    ) -> (mpsc::UnboundedReceiver<Vec<u8>>, tokio::task::JoinHandle<SessionError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::clone(transport);
        let task = tokio::spawn(async move {
            transport
                .receive_loop(reader, move |frame| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(frame);
                    }
                })
                .await
        });
        (rx, task)
    }

    #[tokio::test]
    async fn frames_cross_the_wire() {
        let (a, b) = pair().await;
        let sender = FramedTransport::new(1024);
        let _reader = sender.attach(a).await.unwrap();

        let receiver = Arc::new(FramedTransport::new(1024));
        let reader = receiver.attach(b).await.unwrap();
        let (mut frames, _task) = collecting(&receiver, reader);

        assert_eq!(sender.send_frame(b"hello").await.unwrap(), 9);
        sender.send_frame(&[7u8; 300]).await.unwrap();

        let mut got = vec![frames.recv().await.unwrap(), frames.recv().await.unwrap()];
        got.sort_by_key(|f| f.len());
        assert_eq!(got[0], b"hello");
        assert_eq!(got[1], vec![7u8; 300]);
    }

    #[tokio::test]
    async fn negative_length_is_corrupt() {
        let (mut raw, b) = pair().await;
        let receiver = Arc::new(FramedTransport::new(1024));
        let reader = receiver.attach(b).await.unwrap();
        let (_frames, task) = collecting(&receiver, reader);

        raw.write_all(&(-4i32).to_le_bytes()).await.unwrap();
        let reason = task.await.unwrap();
        assert!(matches!(reason, SessionError::CorruptData(_)), "{reason:?}");
        assert!(!receiver.is_connected());
    }

    #[tokio::test]
    async fn oversized_length_is_corrupt() {
        let (mut raw, b) = pair().await;
        let receiver = Arc::new(FramedTransport::new(16));
        let reader = receiver.attach(b).await.unwrap();
        let (_frames, task) = collecting(&receiver, reader);

        raw.write_all(&17i32.to_le_bytes()).await.unwrap();
        assert!(matches!(task.await.unwrap(), SessionError::CorruptData(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_corrupt() {
        let (mut raw, b) = pair().await;
        let receiver = Arc::new(FramedTransport::new(1024));
        let reader = receiver.attach(b).await.unwrap();
        let (_frames, task) = collecting(&receiver, reader);

        raw.write_all(&10i32.to_le_bytes()).await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        drop(raw);
        assert!(matches!(task.await.unwrap(), SessionError::CorruptData(_)));
    }

    #[tokio::test]
    async fn peer_hangup_is_disconnect() {
        let (raw, b) = pair().await;
        let receiver = Arc::new(FramedTransport::new(1024));
        let reader = receiver.attach(b).await.unwrap();
        let (_frames, task) = collecting(&receiver, reader);

        drop(raw);
        assert!(matches!(task.await.unwrap(), SessionError::NotConnected));
        assert!(receiver.disconnected().is_triggered());
    }

    #[tokio::test]
    async fn local_close_stops_loop_and_sends() {
        let (_raw, b) = pair().await;
        let transport = Arc::new(FramedTransport::new(1024));
        let reader = transport.attach(b).await.unwrap();
        let (_frames, task) = collecting(&transport, reader);

        transport.close().await;
        assert!(matches!(task.await.unwrap(), SessionError::NotConnected));
        assert!(matches!(
            transport.send_frame(b"late").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unattached_transport_refuses_sends() {
        let transport = FramedTransport::new(1024);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send_frame(b"x").await,
            Err(SessionError::NotConnected)
        ));
    }
}
