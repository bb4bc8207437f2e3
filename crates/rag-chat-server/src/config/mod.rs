mod settings;

pub use settings::{
    ChatConfig, EmbeddingConfig, KnowledgeConfig, LlmConfig, RetrievalConfig, ServerConfig,
    Settings, StorageConfig,
};
