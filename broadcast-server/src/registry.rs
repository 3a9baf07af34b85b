//! Connection registry and broadcast fan-out.
//!
//! The registry owns the write half of every live connection. One async mutex
//! guards the whole map, and a broadcast holds it for the full iteration,
//! including the writes. Readers never see a half-applied register or
//! deregister, and a connection removed by one session is never written to by
//! another.
//!
//! A failed write evicts the target on the spot: it is removed from the map,
//! its write half is shut down, and its session is told to stop reading.

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::tcp::OwnedWriteHalf,
    sync::{Mutex, oneshot},
};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered peer: its identity, address and the write half the
/// broadcast engine delivers into.
pub struct Connection<W> {
    id: ConnectionId,
    peer: SocketAddr,
    writer: W,
    evicted: oneshot::Sender<()>,
}

/// Resolves once the registry has let go of the connection, either because a
/// broadcast evicted it or because it was deregistered.
#[derive(Debug)]
pub struct EvictionNotice(Option<oneshot::Receiver<()>>);

impl EvictionNotice {
    /// Returns immediately on every call after the first resolution.
    pub async fn recv(&mut self) {
        if let Some(notice) = self.0.as_mut() {
            let _ = notice.await;
            self.0 = None;
        }
    }
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(peer: SocketAddr, writer: W) -> (Self, EvictionNotice) {
        let (evicted, notice) = oneshot::channel();
        let connection = Self {
            id: ConnectionId::next(),
            peer,
            writer,
            evicted,
        };
        (connection, EvictionNotice(Some(notice)))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&mut self, message: &[u8]) -> io::Result<()> {
        self.writer.write_all(message).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            debug!(connection = %self.id, ?error, "failed to shut down connection writer");
        }
    }

    async fn evict(mut self) {
        self.close().await;
        let _ = self.evicted.send(());
    }
}

/// The set of live connections, keyed by [`ConnectionId`].
pub struct ConnectionRegistry<W = OwnedWriteHalf> {
    connections: Mutex<HashMap<ConnectionId, Connection<W>>>,
}

impl<W> Default for ConnectionRegistry<W> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl<W> ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the connection. Taking it by value means a connection can only
    /// ever be registered once.
    pub async fn register(&self, connection: Connection<W>) -> ConnectionId {
        let id = connection.id;
        let mut connections = self.connections.lock().await;
        connections.insert(id, connection);
        id
    }

    /// Removes the connection and shuts down its writer. Returns `false` when
    /// it was not registered, which is not an error.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().await.remove(&id);
        match removed {
            Some(mut connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Writes `message` verbatim to every registered connection except
    /// `sender`. Targets whose write fails are evicted before the lock is
    /// released. Nothing is reported back to the sender, and a sender that is
    /// no longer registered reaches nobody.
    pub async fn broadcast(&self, sender: ConnectionId, message: &[u8]) {
        let mut connections = self.connections.lock().await;
        if !connections.contains_key(&sender) {
            debug!(%sender, "dropping line from unregistered sender");
            return;
        }
        let mut failed = Vec::new();
        let mut delivered = 0usize;

        for (id, connection) in connections.iter_mut() {
            if *id == sender {
                continue;
            }
            match connection.send(message).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(connection = %id, ?error, "write to peer failed");
                    failed.push(*id);
                }
            }
        }

        for id in &failed {
            if let Some(connection) = connections.remove(id) {
                warn!(
                    connection = %id,
                    peer = %connection.peer,
                    "evicting peer after failed write"
                );
                connection.evict().await;
            }
        }

        debug!(%sender, delivered, evicted = failed.len(), "broadcast complete");
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }
}
