use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    select,
};
use tracing::{debug, info};

use crate::registry::{Connection, ConnectionId, ConnectionRegistry, EvictionNotice};

/// Why a session stopped reading.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// Reading from the peer failed.
    ReadFailed(io::Error),
    /// A broadcast failed to write to the peer and evicted it.
    Evicted,
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) -> SessionEnd {
    let (reader, writer) = stream.into_split();
    run_session(reader, writer, peer, registry).await
}

/// Registers the connection, relays every complete line it sends to the other
/// connections, and deregisters it once reading stops.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry<W>>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let (connection, mut eviction) = Connection::new(peer, writer);
    let id = registry.register(connection).await;
    info!(connection = %id, %peer, "client connected");

    let mut reader = BufReader::new(reader);
    let end = relay_lines(&registry, id, peer, &mut reader, &mut eviction).await;

    registry.deregister(id).await;
    match &end {
        SessionEnd::PeerClosed => {}
        SessionEnd::ReadFailed(error) => {
            debug!(connection = %id, ?error, "read from client failed")
        }
        SessionEnd::Evicted => debug!(connection = %id, "session ended by eviction"),
    }
    info!(connection = %id, %peer, "client disconnected");

    end
}

async fn relay_lines<R, W>(
    registry: &ConnectionRegistry<W>,
    id: ConnectionId,
    peer: SocketAddr,
    reader: &mut R,
    eviction: &mut EvictionNotice,
) -> SessionEnd
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut line = Vec::new();
    loop {
        // Eviction is checked first so an evicted peer's buffered lines are never read.
        select! {
            biased;
            _ = eviction.recv() => return SessionEnd::Evicted,
            read = read_line(reader, &mut line) => match read {
                Ok(true) => {
                    let message = String::from_utf8_lossy(&line);
                    info!(%peer, message = %message.trim_end(), "message received");
                    registry.broadcast(id, &line).await;
                }
                Ok(false) => return SessionEnd::PeerClosed,
                Err(error) => return SessionEnd::ReadFailed(error),
            },
        }
    }
}

/// Reads the next `\n`-terminated line, delimiter included, into `line`.
///
/// Returns `Ok(false)` at end of stream. Bytes left over without a trailing
/// delimiter when the stream ends are dropped.
pub async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = reader.read_until(b'\n', line).await?;
    Ok(read > 0 && line.ends_with(b"\n"))
}
