//! Transport adapter: framed envelope delivery with request/response
//! correlation.
//!
//! The engine talks to the network through the [`Transport`] trait: send one
//! envelope (optionally expecting a response), receive inbound queries,
//! shut down. Responses never surface through [`Transport::recv`] — the
//! adapter matches them against outstanding requests by envelope id and
//! resolves the corresponding [`ResponseHandle`], delivering at most one
//! response per id.
//!
//! [`TcpTransport`] is the concrete binding: an accept loop feeds
//! per-connection frame readers, and each outbound envelope travels on a
//! short-lived connection carrying exactly one length-prefixed frame. No
//! ordering is guaranteed across peers; correlation by id tolerates
//! reordering within a peer pair.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace, warn};

use crate::messages::{self, CodecError, Envelope, FRAME_HEADER_LEN, MAX_FRAME_SIZE};

/// Ceiling on waiting for any response.
pub const MSG_TIMEOUT: Duration = Duration::from_secs(2);

/// Ceiling on waiting for a liveness-probe Pong; the routing table refuses
/// to stall bucket maintenance for the full message timeout.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound queries buffered ahead of the listen loop.
const INBOUND_QUEUE: usize = 256;

/// Recently answered envelope ids kept to drop duplicate responses.
const COMPLETED_ID_CACHE: usize = 1024;

/// Failures surfaced by the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for ack")]
    AckTimeout,
    #[error("transport is shut down")]
    Down,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves to the response matching a sent request, or the timeout error.
pub struct ResponseHandle {
    rx: oneshot::Receiver<Envelope>,
}

impl ResponseHandle {
    pub(crate) fn new(rx: oneshot::Receiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Waits up to [`MSG_TIMEOUT`] for the response.
    pub async fn response(self) -> Result<Envelope, TransportError> {
        self.wait(MSG_TIMEOUT).await
    }

    /// Waits up to `limit` for the response. A dropped correlation slot
    /// (adapter shut down underneath the request) reports the same timeout
    /// failure an unresponsive peer would.
    pub async fn wait(self, limit: Duration) -> Result<Envelope, TransportError> {
        match timeout(limit, self.rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(TransportError::AckTimeout),
            Err(_) => Err(TransportError::AckTimeout),
        }
    }
}

/// The byte-channel contract the engine requires of its transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues one envelope for delivery. Envelopes that are not responses
    /// receive a freshly issued id before they leave. When
    /// `expect_response` is set, the returned handle resolves the matching
    /// response.
    async fn send(
        &self,
        envelope: Envelope,
        expect_response: bool,
    ) -> Result<Option<ResponseHandle>, TransportError>;

    /// Next inbound query. Blocks until an envelope is available; returns
    /// `None` once the adapter has been shut down.
    async fn recv(&self) -> Option<Envelope>;

    async fn shutdown(&self);
}

struct Correlation {
    waiters: HashMap<u64, oneshot::Sender<Envelope>>,
    completed: LruCache<u64, ()>,
}

/// TCP binding of the transport contract.
pub struct TcpTransport {
    local: SocketAddr,
    next_id: AtomicU64,
    correlation: Mutex<Correlation>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: Mutex<mpsc::Receiver<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Binds the listener and starts accepting inbound frames.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local = listener.local_addr()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        let transport = Arc::new(Self {
            local,
            next_id: AtomicU64::new(1),
            correlation: Mutex::new(Correlation {
                waiters: HashMap::new(),
                completed: LruCache::new(
                    NonZeroUsize::new(COMPLETED_ID_CACHE).expect("cache capacity is non-zero"),
                ),
            }),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            shutdown_tx,
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(Self::accept_loop(transport.clone(), listener));
        *transport.accept_task.lock().await = Some(accept);

        debug!(%local, "transport bound");
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = transport.read_frames(stream).await {
                            trace!(%peer, error = %err, "connection reader stopped");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn read_frames(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header = [0u8; FRAME_HEADER_LEN];
            match stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            }

            let len = u32::from_be_bytes(header) as usize;
            if len > MAX_FRAME_SIZE {
                warn!(len, "closing connection after oversized frame");
                return Ok(());
            }

            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;

            // A frame that fails to decode is dropped; the stream itself is
            // still framed correctly, so keep reading.
            match messages::decode_body(&body) {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(err) => debug!(error = %err, "dropping undecodable frame"),
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        if envelope.is_response {
            let mut correlation = self.correlation.lock().await;
            if let Some(waiter) = correlation.waiters.remove(&envelope.id) {
                correlation.completed.put(envelope.id, ());
                let _ = waiter.send(envelope);
            } else if correlation.completed.contains(&envelope.id) {
                trace!(id = envelope.id, "dropping duplicate response");
            } else {
                trace!(id = envelope.id, "dropping unmatched response");
            }
        } else if self.inbound_tx.send(envelope).await.is_err() {
            trace!("inbound queue closed, dropping envelope");
        }
    }

    async fn write_frame(target: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(target).await?;
        stream.write_all(frame).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn forget_waiter(&self, id: u64) {
        self.correlation.lock().await.waiters.remove(&id);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        mut envelope: Envelope,
        expect_response: bool,
    ) -> Result<Option<ResponseHandle>, TransportError> {
        if *self.shutdown_tx.borrow() {
            return Err(TransportError::Down);
        }

        if !envelope.is_response {
            envelope.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }

        let handle = if expect_response {
            let (tx, rx) = oneshot::channel();
            self.correlation.lock().await.waiters.insert(envelope.id, tx);
            Some(ResponseHandle::new(rx))
        } else {
            None
        };

        let id = envelope.id;
        let target = envelope.receiver.socket_addr();
        let frame = match messages::encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                if expect_response {
                    self.forget_waiter(id).await;
                }
                return Err(err.into());
            }
        };

        match timeout(MSG_TIMEOUT, Self::write_frame(target, &frame)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(err)) => {
                if expect_response {
                    self.forget_waiter(id).await;
                }
                Err(err.into())
            }
            Err(_) => {
                if expect_response {
                    self.forget_waiter(id).await;
                }
                Err(TransportError::AckTimeout)
            }
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return None;
        }
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            envelope = inbound.recv() => envelope,
            _ = shutdown_rx.changed() => None,
        }
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        // Dropping the waiters wakes every outstanding request; their
        // handles resolve to the timeout error.
        self.correlation.lock().await.waiters.clear();
        debug!("transport shut down");
    }
}
