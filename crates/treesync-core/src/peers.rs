//! Peer registry for tracking live sessions on the hub.
//!
//! One entry per connected initiator, from accept until its session closes.
//! The registry is for lifecycle logging and diagnostics only: commands are
//! never routed through it.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Session ID cannot be empty")]
    EmptyId,
    #[error("Session already registered: {0}")]
    Duplicate(String),
    #[error("Unknown session ID: {0}")]
    UnknownSession(String),
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Socket accepted, root and cache being prepared
    Connecting,
    /// Exchanging commands
    Active,
    /// Inbound loop ended, resources released
    Closed,
}

/// Tracked state for a session in the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session identifier (UUID v4)
    pub id: String,
    /// Remote socket address
    pub address: String,
    /// Watched subtree for this session
    pub root: PathBuf,
    pub state: SessionState,
    /// When the connection was accepted (ms since epoch)
    pub connected_at: u64,
}

/// Milliseconds since the Unix epoch, for registry timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registry of live sessions.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` for shared ownership.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted connection in the `Connecting` state.
    pub fn register(
        &self,
        id: String,
        address: String,
        root: PathBuf,
        timestamp: u64,
    ) -> Result<SessionInfo, PeerError> {
        if id.is_empty() {
            return Err(PeerError::EmptyId);
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(&id) {
            return Err(PeerError::Duplicate(id));
        }

        let info = SessionInfo {
            id: id.clone(),
            address,
            root,
            state: SessionState::Connecting,
            connected_at: timestamp,
        };
        sessions.insert(id, info.clone());
        Ok(info)
    }

    /// Move a session to `state`.
    pub fn set_state(&self, id: &str, state: SessionState) -> Result<SessionInfo, PeerError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let info = sessions
            .get_mut(id)
            .ok_or_else(|| PeerError::UnknownSession(id.to_string()))?;
        info.state = state;
        Ok(info.clone())
    }

    /// Remove a session. Returns its last known state, marked `Closed`.
    pub fn unregister(&self, id: &str) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(id).map(|mut info| {
            info.state = SessionState::Closed;
            info
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions currently exchanging commands.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.state == SessionState::Active)
            .cloned()
            .collect()
    }

    /// All sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    /// [`Self::snapshot`] serialized as JSON, for diagnostics logging.
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &PeerRegistry, id: &str, timestamp: u64) -> SessionInfo {
        registry
            .register(
                id.to_string(),
                "127.0.0.1:40000".to_string(),
                PathBuf::from("/srv/hub/127.0.0.1"),
                timestamp,
            )
            .unwrap()
    }

    #[test]
    fn test_register_creates_connecting_entry() {
        let registry = PeerRegistry::new();
        let info = register(&registry, "s1", 1000);

        assert_eq!(info.state, SessionState::Connecting);
        assert_eq!(info.connected_at, 1000);
        assert_eq!(registry.len(), 1);
        assert!(registry.active_sessions().is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let registry = PeerRegistry::new();
        register(&registry, "s1", 1000);

        let info = registry.set_state("s1", SessionState::Active).unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(registry.active_sessions().len(), 1);

        let closed = registry.unregister("s1").unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_empty_and_duplicate_ids_rejected() {
        let registry = PeerRegistry::new();
        let result = registry.register(String::new(), "a".into(), PathBuf::new(), 0);
        assert!(matches!(result, Err(PeerError::EmptyId)));

        register(&registry, "s1", 1);
        let result = registry.register("s1".into(), "b".into(), PathBuf::new(), 2);
        assert!(matches!(result, Err(PeerError::Duplicate(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_session() {
        let registry = PeerRegistry::new();
        assert!(matches!(
            registry.set_state("nope", SessionState::Active),
            Err(PeerError::UnknownSession(_))
        ));
        assert!(registry.unregister("nope").is_none());
    }

    #[test]
    fn test_snapshot_is_ordered_and_serializes() {
        let registry = PeerRegistry::new();
        register(&registry, "late", 2000);
        register(&registry, "early", 1000);
        registry.set_state("early", SessionState::Active).unwrap();

        let snapshot = registry.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        let json: serde_json::Value =
            serde_json::from_str(&registry.snapshot_json().unwrap()).unwrap();
        assert_eq!(json[0]["id"], "early");
        assert_eq!(json[0]["state"], "active");
        assert_eq!(json[0]["connectedAt"], 1000);
        assert_eq!(json[1]["state"], "connecting");
    }
}
