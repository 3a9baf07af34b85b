use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{info, warn};

use crate::{registry::ConnectionRegistry, session};

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind: SocketAddr,
    /// Upper bound on concurrently served connections. `None` is unbounded.
    pub max_connections: Option<NonZeroUsize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: None,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    limit: Option<Arc<Semaphore>>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.bind))?;
        Ok(Self::new(listener, config))
    }

    /// Wraps an already bound listener. `config.bind` is ignored.
    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(ConnectionRegistry::new()),
            limit: config
                .max_connections
                .map(|max| Arc::new(Semaphore::new(max.get()))),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves. Running sessions are
    /// left alone; they end with the process.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            limit,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broadcast server shutting down");
                    break;
                }
                (accept_result, permit) = accept_next(&listener, limit.as_ref()) => {
                    handle_accept_result(accept_result, permit, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Waits for a free connection slot, when capped, then accepts.
async fn accept_next(
    listener: &TcpListener,
    limit: Option<&Arc<Semaphore>>,
) -> (
    std::io::Result<(TcpStream, SocketAddr)>,
    Option<OwnedSemaphorePermit>,
) {
    let permit = match limit {
        Some(limit) => {
            if limit.available_permits() == 0 {
                warn!("connection limit reached, waiting for a session to end");
            }
            Arc::clone(limit).acquire_owned().await.ok()
        }
        None => None,
    };
    (listener.accept().await, permit)
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    permit: Option<OwnedSemaphorePermit>,
    registry: &Arc<ConnectionRegistry>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, permit, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
    registry: &Arc<ConnectionRegistry>,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let _permit = permit;
        session::handle_connection(stream, peer, registry).await;
    });
}
