//! Connecting side: watches a local folder and mirrors it to a hub.
//!
//! There is no reconnect. When the hub goes away the session ends and the
//! process exits.

use crate::session::{Session, SessionConfig, SessionSummary};
use crate::watcher::FileWatcher;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::info;
use treesync_core::{FsEvent, Role, WatchedTree};

/// A connected initiator, ready to run.
pub struct Initiator {
    session: Session,
    stream: TcpStream,
    events: mpsc::Receiver<FsEvent>,
    watcher: FileWatcher,
}

impl Initiator {
    /// Open (creating if needed) `folder`, start watching it and connect to `hub_addr`.
    pub async fn connect(hub_addr: &str, folder: &Path, config: SessionConfig) -> Result<Self> {
        let tree = WatchedTree::open(folder)
            .await
            .with_context(|| format!("Cannot open folder {}", folder.display()))?;

        let stream = TcpStream::connect(hub_addr)
            .await
            .with_context(|| format!("Cannot connect to {}", hub_addr))?;
        let peer = stream.peer_addr()?.to_string();
        info!("Connected to hub at {}", peer);

        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id, peer, Role::Initiator, tree, config).await?;

        let (event_tx, events) = mpsc::channel(config.event_capacity.max(1));
        let watcher = FileWatcher::spawn(session.tree().root(), session.sync_state(), event_tx)?;
        info!(
            "Session {} watching {} ({} entries)",
            session.id(),
            watcher.root().display(),
            session.cache().len()
        );

        Ok(Self {
            session,
            stream,
            events,
            watcher,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until the hub disconnects.
    pub async fn run(self) -> SessionSummary {
        let summary = self.session.run(self.stream, self.events).await;
        drop(self.watcher);
        summary
    }
}
