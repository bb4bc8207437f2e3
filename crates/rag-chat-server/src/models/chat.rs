use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session identifier: time-ordered prefix + random UUID suffix,
/// e.g. `2026-08-06-14-03_6f1c...`. Generated by the session store.
pub type SessionId = String;

/// One websocket connection. A session multiplexes many of these
/// (one per browser tab).
pub type ConnectionId = String;

// ===== CONVERSATION DATA MODEL =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// One message in a conversation. Immutable once appended to the log;
/// log order is conversation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub msg_id: i64,
    pub answer_time: DateTime<Utc>,
    pub message: String,
    pub sender: Sender,
}

impl ConversationTurn {
    pub fn now(sender: Sender, message: String) -> Self {
        let at = Utc::now();
        Self {
            msg_id: at.timestamp_millis(),
            answer_time: at,
            message,
            sender,
        }
    }
}

/// Carried-over conversational state, replaced wholesale after each
/// successful generation and persisted per turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMemory {
    pub previous_topic: String,
    pub summary: String,
}

// ===== CLIENT FRAMES =====

/// Envelope for client->server websocket frames.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub ack_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessagePayload {
    #[serde(rename = "userMessage")]
    pub user_message: String,
}

// ===== SERVER FRAMES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Typing,
    Idle,
}

/// Acknowledgement for a client `chat_message`. `status` is the only
/// field callers branch on; `error` is human-readable text.
#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    pub status: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn accepted(ack_id: Option<u64>, sanitized: String) -> Self {
        Self {
            ack_id,
            status: 1,
            sanitize: Some(sanitized),
            error: None,
        }
    }

    pub fn rejected(ack_id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            ack_id,
            status: -1,
            sanitize: None,
            error: Some(error.into()),
        }
    }
}

/// Envelope for server->client websocket frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "chat_message")]
    ChatMessage(ConversationTurn),
    #[serde(rename = "bot_status")]
    BotStatus { status: BotStatus },
    #[serde(rename = "set-cookie")]
    SetCookie { name: String, value: String },
    #[serde(rename = "load_chat")]
    LoadChat(Vec<ConversationTurn>),
    #[serde(rename = "ack")]
    Ack(AckPayload),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_wire_shape() {
        let turn = ConversationTurn::now(Sender::Bot, "hello".to_string());
        let json = serde_json::to_value(&turn).unwrap();

        assert_eq!(json["sender"], "bot");
        assert_eq!(json["message"], "hello");
        assert!(json["msgId"].is_i64());
        assert!(json["answerTime"].is_string());
    }

    #[test]
    fn test_server_frame_envelope() {
        let frame = ServerFrame::BotStatus {
            status: BotStatus::Typing,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "bot_status");
        assert_eq!(json["data"]["status"], "typing");

        let frame = ServerFrame::SetCookie {
            name: "sessionId".to_string(),
            value: "abc".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "set-cookie");
    }

    #[test]
    fn test_client_frame_parsing() {
        let raw = r#"{"event":"chat_message","data":{"userMessage":"hi"},"ack_id":7}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.event, "chat_message");
        assert_eq!(frame.ack_id, Some(7));

        let payload: ChatMessagePayload = serde_json::from_value(frame.data).unwrap();
        assert_eq!(payload.user_message, "hi");
    }

    #[test]
    fn test_ack_omits_absent_fields() {
        let ack = AckPayload::rejected(None, "busy");
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], -1);
        assert!(json.get("sanitize").is_none());
        assert!(json.get("ack_id").is_none());
    }
}
