use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use rag_chat_server::config::{RetrievalConfig, Settings};
use rag_chat_server::handlers;
use rag_chat_server::services::{
    ConversationLog, EmbeddingService, KnowledgeIndex, LlmService, Orchestrator, SessionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,rag_chat_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("🚀 Starting RAG Chat Server...");

    // Load configuration
    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    // Initialize persistence
    let log = Arc::new(ConversationLog::new(&settings.storage.data_dir)?);
    let sessions = Arc::new(SessionStore::new(log.clone()));
    info!("✅ Conversation log ready at {}", settings.storage.data_dir);

    // Initialize model backends
    let embedding_service = Arc::new(EmbeddingService::new(settings.embedding.clone()));
    let llm_service = Arc::new(LlmService::new(settings.llm.clone()));

    // Initialize knowledge index
    let index = Arc::new(KnowledgeIndex::new(embedding_service.clone()));

    if let Some(path) = &settings.knowledge.initial_database {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read initial database {}", path))?;
        let total = index
            .load_from_csv(&data)
            .await
            .context("Failed to load initial knowledge base")?;
        info!("✅ Knowledge index loaded: {} entries", total);
    }

    // Initialize orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        sessions.clone(),
        index.clone(),
        llm_service.clone(),
        log.clone(),
        settings.chat.clone(),
        settings.retrieval.clone(),
    ));

    // Build router
    let app = build_router(
        sessions,
        log,
        orchestrator,
        index,
        settings.retrieval.clone(),
    );

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(
    sessions: Arc<SessionStore>,
    log: Arc<ConversationLog>,
    orchestrator: Arc<Orchestrator>,
    index: Arc<KnowledgeIndex>,
    retrieval: RetrievalConfig,
) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/api/ingest", post(handlers::ingest::ingest_handler))
        .route("/api/search", post(handlers::search::search_handler))
        // Shared state
        .layer(Extension(sessions))
        .layer(Extension(log))
        .layer(Extension(orchestrator))
        .layer(Extension(index))
        .layer(Extension(retrieval))
        // CORS
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
