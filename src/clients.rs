//! Live connection bookkeeping.
//!
//! Every accepted connection gets a [`ConnectionSink`] (the write half of
//! its socket) and an identifier from the [`ClientRegistry`]. Identifiers
//! start at 1 and are never reused.
//!
//! The identifier map sits behind an async reader/writer lock: `add` and
//! `remove` take it exclusively, `broadcast` holds it shared for the
//! whole fan-out, so membership cannot change mid-broadcast.

use crate::envelope;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writable endpoint of one client connection.
///
/// Clones share the same underlying writer. Each write holds the writer
/// lock for its full length, so lines from concurrent writers never
/// interleave.
#[derive(Clone)]
pub struct ConnectionSink {
    peer: SocketAddr,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl ConnectionSink {
    pub fn new<W>(peer: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write raw bytes and flush.
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Write `message` followed by a newline.
    pub async fn send_line(&self, message: &str) -> io::Result<()> {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        self.write_all(line.as_bytes()).await
    }

    /// Write a `{"status":"ok","data":...}` response.
    pub async fn send_success<T: Serialize + ?Sized>(&self, data: &T) -> io::Result<()> {
        self.write_all(envelope::encode_success(data).as_bytes())
            .await
    }

    /// Write a `{"status":"error","error":...}` response.
    pub async fn send_error(&self, message: &str) -> io::Result<()> {
        self.write_all(envelope::encode_error(message).as_bytes())
            .await
    }

    /// Standard response for a request lacking required payload fields.
    pub async fn send_missing_params(&self) -> io::Result<()> {
        self.send_error("Missing required parameters").await
    }

    /// Shut down the write direction of the socket.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl std::fmt::Debug for ConnectionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSink")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Registry of live connections keyed by identifier.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ConnectionSink>>,
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        }
    }

    /// Insert `sink` under a fresh identifier.
    pub async fn add(&self, sink: ConnectionSink) -> u64 {
        let mut clients = self.clients.write().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        clients.insert(id, sink);
        self.live.store(clients.len(), Ordering::Release);
        id
    }

    /// Remove a connection. Absent identifiers are ignored.
    pub async fn remove(&self, id: u64) -> Option<ConnectionSink> {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(&id);
        self.live.store(clients.len(), Ordering::Release);
        removed
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Write `message` plus newline to every registered connection.
    ///
    /// Failed writes are skipped. Returns the number of connections the
    /// message reached.
    pub async fn broadcast(&self, message: &str) -> usize {
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (id, sink) in clients.iter() {
            match sink.write_all(line.as_bytes()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(id, peer = %sink.peer_addr(), error = %e, "Broadcast write failed");
                }
            }
        }
        delivered
    }
}
