//! TCP server accepting initiator connections.
//!
//! Each connection gets its own subtree under the hub root, named after the
//! initiator's IP address, plus its own session, path cache and watcher.

use crate::session::{Session, SessionConfig};
use crate::watcher::FileWatcher;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use treesync_core::peers::now_ms;
use treesync_core::{PeerRegistry, Role, SessionState, WatchedTree};

/// Port the hub listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 5000;

/// Subtree used for an initiator connecting from `addr`.
///
/// `:` is not valid in Windows file names, so IPv6 addresses have it
/// replaced with `_`.
pub fn root_for(base: &Path, addr: &SocketAddr) -> PathBuf {
    base.join(addr.ip().to_string().replace(':', "_"))
}

pub struct Hub {
    listener: TcpListener,
    root: PathBuf,
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
}

impl Hub {
    /// Bind the listener and make sure the hub root exists.
    pub async fn bind(listen_addr: &str, root: impl Into<PathBuf>, config: SessionConfig) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Cannot create hub root {}", root.display()))?;

        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Cannot listen on {}", listen_addr))?;
        info!("Hub listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            root,
            config,
            registry: Arc::new(PeerRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections forever, one task per initiator.
    pub async fn serve(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let root = root_for(&self.root, &addr);
                    let config = self.config;
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, root, config, registry).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    root: PathBuf,
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
) {
    let id = uuid::Uuid::new_v4().to_string();
    info!("New connection from {} (session: {})", addr, id);

    if let Err(e) = registry.register(id.clone(), addr.to_string(), root.clone(), now_ms()) {
        error!("Cannot register session for {}: {}", addr, e);
        return;
    }

    if let Err(e) = run_session(stream, addr, &id, root, config, &registry).await {
        error!("Session for {} failed: {:#}", addr, e);
    }

    if let Some(info) = registry.unregister(&id) {
        let seconds = now_ms().saturating_sub(info.connected_at) / 1000;
        info!("{} disconnected after {}s", addr, seconds);
    }
    info!(
        "{} session(s) remaining, {} active",
        registry.len(),
        registry.active_sessions().len()
    );
}

async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    id: &str,
    root: PathBuf,
    config: SessionConfig,
    registry: &PeerRegistry,
) -> Result<()> {
    let tree = WatchedTree::open(&root).await?;
    let session = Session::new(id.to_string(), addr.to_string(), Role::Hub, tree, config).await?;

    let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
    let watcher = match FileWatcher::spawn(session.tree().root(), session.sync_state(), event_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(
                "Cannot watch {}: {}; local changes will not be sent to {}",
                session.tree().root().display(),
                e,
                addr
            );
            None
        }
    };

    registry.set_state(id, SessionState::Active)?;
    match registry.snapshot_json() {
        Ok(snapshot) => debug!("Sessions: {}", snapshot),
        Err(e) => warn!("Cannot serialize session snapshot: {}", e),
    }

    session.run(stream, event_rx).await;
    drop(watcher);
    registry.set_state(id, SessionState::Closed)?;
    Ok(())
}
