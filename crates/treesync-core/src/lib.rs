//! treesync-core: Shared library for mirroring a directory tree between an
//! Initiator and a Hub over a single line-oriented TCP stream.
//!
//! This crate provides:
//! - The wire command grammar and its codec (text lines + raw file payloads)
//! - The path type cache used to classify deleted and renamed paths
//! - The sync engine that turns filesystem events into outbound commands
//! - The dispatcher that applies inbound commands to the local tree
//! - The syncing guard that keeps the two ends from echoing changes forever

pub mod cache;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod guard;
pub mod peers;
pub mod tree;

pub use cache::PathTypeCache;
pub use codec::{CodecError, CommandReader, CommandWriter, Frame, PayloadReceipt};
pub use command::{Command, CommandError};
pub use config::{AccessRetry, SyncConfig};
pub use dispatch::{ApplyOutcome, DispatchError, Dispatcher};
pub use engine::{FileAccess, Outbound, Outgoing, Role, SyncEngine, UploadJob};
pub use event::{FsEvent, FsEventKind};
pub use guard::{ApplyGuard, SyncPhase, SyncState};
pub use peers::{PeerError, PeerRegistry, SessionInfo, SessionState};
pub use tree::{TreeError, WatchedTree};
