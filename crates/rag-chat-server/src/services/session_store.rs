use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::chat::{ConnectionId, ConversationMemory, ServerFrame, SessionId};
use crate::services::conversation_log::ConversationLog;
use crate::utils::error::ChatError;

// Identifiers come from an untrusted cookie; only the exact generated
// shape (UTC minute prefix + UUID suffix) may reach the filesystem.
static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\d{4}-\d{2}-\d{2}-\d{2}-\d{2}_[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
    )
    .unwrap()
});

struct Session {
    connections: HashMap<ConnectionId, UnboundedSender<ServerFrame>>,
    processing: AtomicBool,
    memory: ConversationMemory,
}

impl Session {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            processing: AtomicBool::new(false),
            memory: ConversationMemory::default(),
        }
    }
}

/// In-memory registry of active sessions and their live connections.
/// Owns every `Session` exclusively; the conversation log only
/// persists and restores their memory.
///
/// The admission guard is a compare-and-swap flag, which is sound for
/// the parallel workers of one process. It does not generalize to
/// multiple processes; that deployment needs a distributed lease keyed
/// by session id.
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    log: Arc<ConversationLog>,
}

impl SessionStore {
    pub fn new(log: Arc<ConversationLog>) -> Self {
        Self {
            sessions: DashMap::new(),
            log,
        }
    }

    pub fn generate_session_id() -> SessionId {
        format!("{}_{}", Utc::now().format("%Y-%m-%d-%H-%M"), Uuid::new_v4())
    }

    pub fn is_valid_session_id(id: &str) -> bool {
        SESSION_ID_RE.is_match(id)
    }

    /// Resolve the session for a presented identifier. Returns the
    /// effective id and whether it was recognized; an absent or
    /// malformed identifier gets a freshly generated session.
    pub fn get_or_create(&self, presented: Option<&str>) -> (SessionId, bool) {
        match presented {
            Some(id) if Self::is_valid_session_id(id) => {
                self.sessions
                    .entry(id.to_string())
                    .or_insert_with(Session::new);
                (id.to_string(), true)
            }
            _ => {
                let id = Self::generate_session_id();
                self.sessions.insert(id.clone(), Session::new());
                debug!("Created session {}", id);
                (id, false)
            }
        }
    }

    pub fn attach(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        sender: UnboundedSender<ServerFrame>,
    ) {
        let mut session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.connections.insert(connection_id, sender);
    }

    /// Detach a connection. When the last one goes, the registry entry
    /// is evicted; the persisted log is untouched, so a later reconnect
    /// with the same identifier fully recovers.
    pub fn detach(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.connections.remove(connection_id);
        }

        self.sessions
            .remove_if(session_id, |_, session| session.connections.is_empty())
            .is_some()
    }

    /// Sole admission point for generation. Returns `false` when the
    /// slot is already taken; callers must reject, not queue.
    pub fn begin_processing(&self, session_id: &SessionId) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => session
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }

    pub fn end_processing(&self, session_id: &SessionId) {
        if let Some(session) = self.sessions.get(session_id) {
            session.processing.store(false, Ordering::SeqCst);
        }
    }

    pub fn memory(&self, session_id: &SessionId) -> Option<ConversationMemory> {
        self.sessions.get(session_id).map(|s| s.memory.clone())
    }

    pub fn update_memory(&self, session_id: &SessionId, memory: ConversationMemory) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.memory = memory;
        }
    }

    /// Write the session's current memory snapshot through to the log.
    pub async fn persist_memory(&self, session_id: &SessionId) -> Result<()> {
        let Some(memory) = self.memory(session_id) else {
            warn!("Persist requested for unknown session {}", session_id);
            return Ok(());
        };
        self.log.save_memory(session_id, &memory).await
    }

    /// Restore persisted memory into the live session, if any exists.
    pub async fn recover(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationMemory>, ChatError> {
        let memory = self.log.load_memory(session_id).await?;
        if let Some(memory) = &memory {
            self.update_memory(session_id, memory.clone());
        }
        Ok(memory)
    }

    /// Fan a frame out to the session's connections, optionally
    /// skipping one (the originating tab renders its own echo).
    pub fn send_to_session(
        &self,
        session_id: &SessionId,
        frame: ServerFrame,
        skip: Option<&ConnectionId>,
    ) {
        if let Some(session) = self.sessions.get(session_id) {
            for (connection_id, sender) in &session.connections {
                if skip == Some(connection_id) {
                    continue;
                }
                if sender.send(frame.clone()).is_err() {
                    debug!("Dropping frame for closed connection {}", connection_id);
                }
            }
        }
    }

    pub fn send_to_connection(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        frame: ServerFrame,
    ) {
        if let Some(session) = self.sessions.get(session_id) {
            if let Some(sender) = session.connections.get(connection_id) {
                if sender.send(frame).is_err() {
                    debug!("Dropping frame for closed connection {}", connection_id);
                }
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::BotStatus;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn store(dir: &std::path::Path) -> SessionStore {
        SessionStore::new(Arc::new(ConversationLog::new(dir).unwrap()))
    }

    #[tokio::test]
    async fn test_generated_id_round_trips_validation() {
        let id = SessionStore::generate_session_id();
        assert!(SessionStore::is_valid_session_id(&id));

        assert!(!SessionStore::is_valid_session_id(""));
        assert!(!SessionStore::is_valid_session_id("../../etc/passwd"));
        assert!(!SessionStore::is_valid_session_id("2026-08-06-10-00_nonsense"));
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_malformed_id() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let (id, recognized) = store.get_or_create(Some("not-a-session"));
        assert!(!recognized);
        assert_ne!(id, "not-a-session");

        let (same, recognized) = store.get_or_create(Some(&id));
        assert!(recognized);
        assert_eq!(same, id);
    }

    #[tokio::test]
    async fn test_admission_guard_rejects_second_acquire() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let (id, _) = store.get_or_create(None);

        assert!(store.begin_processing(&id));
        assert!(!store.begin_processing(&id));

        store.end_processing(&id);
        assert!(store.begin_processing(&id));
    }

    #[tokio::test]
    async fn test_last_detach_evicts_session() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let (id, _) = store.get_or_create(None);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        store.attach(&id, "conn-a".to_string(), tx_a);
        store.attach(&id, "conn-b".to_string(), tx_b);

        assert!(!store.detach(&id, &"conn-a".to_string()));
        assert_eq!(store.session_count(), 1);

        assert!(store.detach(&id, &"conn-b".to_string()));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_skips_originating_connection() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let (id, _) = store.get_or_create(None);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        store.attach(&id, "conn-a".to_string(), tx_a);
        store.attach(&id, "conn-b".to_string(), tx_b);

        store.send_to_session(
            &id,
            ServerFrame::BotStatus {
                status: BotStatus::Typing,
            },
            Some(&"conn-a".to_string()),
        );

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_memory_persist_and_recover() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let (id, _) = store.get_or_create(None);

        store.update_memory(
            &id,
            ConversationMemory {
                previous_topic: "xss".to_string(),
                summary: "covered the basics".to_string(),
            },
        );
        store.persist_memory(&id).await.unwrap();

        // Simulate full eviction and a later reconnect.
        let (tx, _rx) = mpsc::unbounded_channel();
        store.attach(&id, "conn".to_string(), tx);
        assert!(store.detach(&id, &"conn".to_string()));

        let (same_id, recognized) = store.get_or_create(Some(&id));
        assert!(recognized);
        let recovered = store.recover(&same_id).await.unwrap().unwrap();
        assert_eq!(recovered.previous_topic, "xss");
        assert_eq!(store.memory(&same_id).unwrap().summary, "covered the basics");
    }
}
