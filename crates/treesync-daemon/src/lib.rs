//! treesync-daemon library: the runtime around treesync-core.
//!
//! Exposes the watcher, session and role modules so the binary and the
//! integration tests share them.

pub mod hub;
pub mod initiator;
pub mod session;
pub mod watcher;

// Re-export key types for convenience
pub use hub::{DEFAULT_PORT, Hub, root_for};
pub use initiator::Initiator;
pub use session::{Session, SessionConfig, SessionSummary};
pub use watcher::{EventTranslator, FileWatcher};
