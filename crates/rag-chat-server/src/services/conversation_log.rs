use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::chat::{ConversationMemory, ConversationTurn, SessionId};
use crate::utils::error::ChatError;

/// Crash-recoverable persistence for sessions: an append-only turn log
/// and a whole-file memory snapshot per session identifier. A simple
/// recovery aid, not a database.
pub struct ConversationLog {
    conversations_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl ConversationLog {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let conversations_dir = data_dir.as_ref().join("conversations");
        let sessions_dir = data_dir.as_ref().join("sessions");

        std::fs::create_dir_all(&conversations_dir)
            .context("Failed to create conversations directory")?;
        std::fs::create_dir_all(&sessions_dir)
            .context("Failed to create sessions directory")?;

        Ok(Self {
            conversations_dir,
            sessions_dir,
        })
    }

    /// Append one turn: a single serialized record followed by the
    /// separator, written in one call.
    pub async fn append(&self, session_id: &SessionId, turn: &ConversationTurn) -> Result<()> {
        let path = self.conversations_dir.join(session_id);
        let mut record = serde_json::to_string(turn).context("Failed to serialize turn")?;
        record.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open turn log {:?}", path))?;

        file.write_all(record.as_bytes())
            .await
            .with_context(|| format!("Failed to append to turn log {:?}", path))?;

        debug!("Appended {:?} turn to {:?}", turn.sender, path);
        Ok(())
    }

    /// Load all turns for a session in append order. A trailing
    /// unterminated fragment (interrupted last append) is dropped; a
    /// complete record that fails to parse is a corruption error.
    pub async fn load_turns(&self, session_id: &SessionId) -> Result<Vec<ConversationTurn>, ChatError> {
        let path = self.conversations_dir.join(session_id);

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ChatError::Storage(format!("{:?}: {}", path, e))),
        };

        // Only records terminated by the separator are structurally
        // complete; anything after the last separator was cut short.
        let complete = match data.rfind('\n') {
            Some(end) => &data[..end],
            None => return Ok(Vec::new()),
        };

        let mut turns = Vec::new();
        for (i, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let turn: ConversationTurn = serde_json::from_str(line).map_err(|e| {
                ChatError::LogCorruption(format!("record {} of {}: {}", i + 1, session_id, e))
            })?;
            turns.push(turn);
        }

        Ok(turns)
    }

    /// Overwrite the memory snapshot. Only the latest matters, so this
    /// is a whole-file replace, not an append.
    pub async fn save_memory(
        &self,
        session_id: &SessionId,
        memory: &ConversationMemory,
    ) -> Result<()> {
        let path = self.sessions_dir.join(session_id);
        let data = serde_json::to_vec(memory).context("Failed to serialize memory")?;

        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write memory snapshot {:?}", path))?;

        debug!("Saved memory snapshot {:?}", path);
        Ok(())
    }

    pub async fn load_memory(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationMemory>, ChatError> {
        let path = self.sessions_dir.join(session_id);

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ChatError::Storage(format!("{:?}: {}", path, e))),
        };

        let memory = serde_json::from_str(&data)
            .map_err(|e| ChatError::LogCorruption(format!("memory of {}: {}", session_id, e)))?;

        Ok(Some(memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Sender;
    use tempfile::tempdir;

    fn turn(message: &str, sender: Sender) -> ConversationTurn {
        ConversationTurn::now(sender, message.to_string())
    }

    #[tokio::test]
    async fn test_round_trip_keeps_append_order() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();
        let session = "2026-08-06-10-00_test".to_string();

        for i in 0..5 {
            let sender = if i % 2 == 0 { Sender::User } else { Sender::Bot };
            log.append(&session, &turn(&format!("msg {}", i), sender))
                .await
                .unwrap();
        }

        let turns = log.load_turns(&session).await.unwrap();
        assert_eq!(turns.len(), 5);
        for (i, t) in turns.iter().enumerate() {
            assert_eq!(t.message, format!("msg {}", i));
        }
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();

        let turns = log.load_turns(&"nobody".to_string()).await.unwrap();
        assert!(turns.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_last_record_is_dropped() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();
        let session = "2026-08-06-10-00_trunc".to_string();

        log.append(&session, &turn("kept 1", Sender::User)).await.unwrap();
        log.append(&session, &turn("kept 2", Sender::Bot)).await.unwrap();

        // Simulate an append cut off mid-record.
        let path = dir.path().join("conversations").join(&session);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(b"{\"msgId\":17,\"mess");
        std::fs::write(&path, data).unwrap();

        let turns = log.load_turns(&session).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].message, "kept 2");
    }

    #[tokio::test]
    async fn test_corrupt_complete_record_is_surfaced() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();
        let session = "2026-08-06-10-00_corrupt".to_string();

        log.append(&session, &turn("fine", Sender::User)).await.unwrap();

        let path = dir.path().join("conversations").join(&session);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(b"not json at all\n");
        std::fs::write(&path, data).unwrap();

        let err = log.load_turns(&session).await.unwrap_err();
        assert!(matches!(err, ChatError::LogCorruption(_)));
    }

    #[tokio::test]
    async fn test_memory_snapshot_overwrites() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();
        let session = "2026-08-06-10-00_memory".to_string();

        assert!(log.load_memory(&session).await.unwrap().is_none());

        let first = ConversationMemory {
            previous_topic: "injection".to_string(),
            summary: "asked about SQLi".to_string(),
        };
        log.save_memory(&session, &first).await.unwrap();

        let second = ConversationMemory {
            previous_topic: "xss".to_string(),
            summary: "moved on to XSS".to_string(),
        };
        log.save_memory(&session, &second).await.unwrap();

        let loaded = log.load_memory(&session).await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn test_corrupt_memory_is_surfaced() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::new(dir.path()).unwrap();
        let session = "2026-08-06-10-00_badmem".to_string();

        let path = dir.path().join("sessions").join(&session);
        std::fs::write(&path, b"{broken").unwrap();

        let err = log.load_memory(&session).await.unwrap_err();
        assert!(matches!(err, ChatError::LogCorruption(_)));
    }
}
