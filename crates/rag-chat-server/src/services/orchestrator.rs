use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ChatConfig, RetrievalConfig};
use crate::models::chat::{
    BotStatus, ConnectionId, ConversationMemory, ConversationTurn, Sender, ServerFrame, SessionId,
};
use crate::services::conversation_log::ConversationLog;
use crate::services::knowledge_index::KnowledgeIndex;
use crate::services::llm_service::GenerationProvider;
use crate::services::prompt::{parse_reply, ParsedReply, PromptBuilder};
use crate::services::session_store::SessionStore;
use crate::utils::error::{ChatError, RetrievalError};
use crate::utils::sanitize::sanitize_message;

/// Pipeline controller for one inbound chat message. Stateless between
/// invocations; all conversational state lives in the session store
/// and the log.
pub struct Orchestrator {
    sessions: Arc<SessionStore>,
    index: Arc<KnowledgeIndex>,
    generator: Arc<dyn GenerationProvider>,
    log: Arc<ConversationLog>,
    prompt_builder: PromptBuilder,
    retrieval: RetrievalConfig,
    fallback_answer: String,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        index: Arc<KnowledgeIndex>,
        generator: Arc<dyn GenerationProvider>,
        log: Arc<ConversationLog>,
        chat: ChatConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            sessions,
            index,
            generator,
            log,
            prompt_builder: PromptBuilder::new(chat.initial_topic),
            retrieval,
            fallback_answer: chat.fallback_answer,
        }
    }

    /// Run the whole pipeline for one raw inbound message. Returns the
    /// sanitized text for the sender's acknowledgement; the bot turn
    /// itself is delivered over the session's connections.
    pub async fn handle_message(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        raw_message: &str,
    ) -> Result<String, ChatError> {
        let sanitized = sanitize_message(raw_message);
        if sanitized.is_empty() {
            return Err(ChatError::InvalidMessage);
        }

        // Single admission slot per session: a concurrent message from
        // another tab is rejected as retryable, never queued.
        if !self.sessions.begin_processing(session_id) {
            return Err(ChatError::Busy);
        }

        let outcome = self.run_turn(session_id, connection_id, &sanitized).await;

        // Once admitted, every path releases the guard and closes the
        // typing bracket before the bot turn goes out.
        self.sessions.end_processing(session_id);
        self.sessions.send_to_session(
            session_id,
            ServerFrame::BotStatus {
                status: BotStatus::Idle,
            },
            None,
        );

        let bot_turn = outcome?;
        self.sessions
            .send_to_session(session_id, ServerFrame::ChatMessage(bot_turn), None);

        Ok(sanitized)
    }

    async fn run_turn(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        sanitized: &str,
    ) -> Result<ConversationTurn, ChatError> {
        self.sessions.send_to_session(
            session_id,
            ServerFrame::BotStatus {
                status: BotStatus::Typing,
            },
            None,
        );

        // The user turn is persisted and fanned out strictly before the
        // bot turn. The sender already renders its own echo.
        let user_turn = ConversationTurn::now(Sender::User, sanitized.to_string());
        self.log
            .append(session_id, &user_turn)
            .await
            .map_err(|e| ChatError::Storage(e.to_string()))?;
        self.sessions.send_to_session(
            session_id,
            ServerFrame::ChatMessage(user_turn),
            Some(connection_id),
        );

        let hits = match self
            .index
            .search(
                sanitized,
                self.retrieval.similarity_threshold,
                self.retrieval.limit,
            )
            .await
        {
            Ok(hits) => hits,
            Err(RetrievalError::Integrity(msg)) => {
                warn!(
                    session = %session_id,
                    "Index integrity failure, degrading to empty retrieval: {}", msg
                );
                Vec::new()
            }
            Err(RetrievalError::Embedding(e)) => {
                return Err(ChatError::RetrievalFailure(e.to_string()));
            }
        };

        info!(session = %session_id, hits = hits.len(), "Retrieved grounding entries");

        let memory = self.sessions.memory(session_id).unwrap_or_default();
        let prompt = self.prompt_builder.format(&memory, sanitized, &hits);
        debug!(session = %session_id, "Prompt for generation:\n{}", prompt);

        let bot_turn = match self.generate_reply(session_id, &prompt).await {
            Ok(parsed) => {
                let turn = ConversationTurn::now(Sender::Bot, parsed.answer);
                self.log
                    .append(session_id, &turn)
                    .await
                    .map_err(|e| ChatError::Storage(e.to_string()))?;

                self.sessions.update_memory(
                    session_id,
                    ConversationMemory {
                        previous_topic: parsed.topic,
                        summary: parsed.summary,
                    },
                );
                if let Err(e) = self.sessions.persist_memory(session_id).await {
                    warn!(session = %session_id, "Failed to persist memory snapshot: {}", e);
                }

                turn
            }
            Err(e) => {
                // Fixed fallback so the user still sees a bot turn; the
                // error turn is persisted but never feeds memory.
                warn!(session = %session_id, "Generation failed, using fallback answer: {}", e);
                let turn = ConversationTurn::now(Sender::Bot, self.fallback_answer.clone());
                self.log
                    .append(session_id, &turn)
                    .await
                    .map_err(|e| ChatError::Storage(e.to_string()))?;
                turn
            }
        };

        Ok(bot_turn)
    }

    async fn generate_reply(
        &self,
        session_id: &SessionId,
        prompt: &str,
    ) -> Result<ParsedReply, ChatError> {
        let raw = self
            .generator
            .generate(prompt)
            .await
            .map_err(|e| ChatError::GenerationFailure(e.to_string()))?;

        debug!(session = %session_id, "Raw model reply:\n{}", raw);

        let parsed = parse_reply(&raw);
        if parsed.answer.is_empty() {
            return Err(ChatError::GenerationFailure(
                "reply carried no extractable answer".to_string(),
            ));
        }

        Ok(parsed)
    }
}
