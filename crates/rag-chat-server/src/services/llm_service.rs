use crate::config::LlmConfig;
use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Boundary trait for the external text-generation function: one
/// assembled prompt in, the raw reply text out.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<CompletionMessage>,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    /// The client-level timeout is the safeguard for a hung upstream
    /// call: when it fires, the turn takes the generation-failure path
    /// and the per-session admission guard is released.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    async fn generate_chat(&self, prompt: &str) -> Result<String> {
        debug!("Starting chat generation, prompt {} chars", prompt.len());

        let request = ChatCompletionRequest {
            messages: vec![CompletionMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.config.max_tokens,
            temperature: 0.7,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to call LLM API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No choices returned from LLM"))
    }
}

#[async_trait::async_trait]
impl GenerationProvider for LlmService {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_chat(prompt).await
    }
}
