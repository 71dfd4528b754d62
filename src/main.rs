use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use rag_chatbot::api::create_router;
use rag_chatbot::config::{Settings, DEFAULT_LOG_FILTER};
use rag_chatbot::pipeline::{ChatService, ServiceOptions};
use rag_chatbot::rag::completion::{CompletionProvider, OpenAiChat};
use rag_chatbot::rag::embeddings::provider_from_settings;
use rag_chatbot::rag::{RagEngine, RetrievalOptions};
use rag_chatbot::session::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let settings = Settings::load()?;
    let api_key = settings.require_api_key()?;

    tracing::info!("Using OpenAI endpoint: {}", settings.openai.base_url);

    let embeddings = provider_from_settings(&settings)?;
    let completion: Arc<dyn CompletionProvider> = Arc::new(
        OpenAiChat::new(
            &settings.openai.base_url,
            &api_key,
            &settings.openai.chat_model,
            Duration::from_secs(settings.openai.request_timeout_secs),
        )?
        .with_temperature(settings.openai.temperature)
        .with_retry(settings.retry_config()),
    );

    let engine = RagEngine::new(
        embeddings,
        completion,
        RetrievalOptions {
            top_k: settings.retrieval.top_k,
            condense_question: settings.retrieval.condense_question,
            max_history_tokens: settings.retrieval.max_history_tokens,
        },
    );

    let default_index = ChatService::load_default_index(&settings.index.path, engine.model_id())
        .with_context(|| {
            format!(
                "Failed to load default index from {}",
                settings.index.path.display()
            )
        })?;
    if let Some(index) = &default_index {
        tracing::info!(
            chunks = index.len(),
            path = %settings.index.path.display(),
            "default index loaded"
        );
    }

    let sessions = Arc::new(SessionStore::new(
        settings.session_ttl(),
        settings.session.max_sessions,
    ));
    let sweeper = SessionStore::start_sweeper(
        sessions.clone(),
        Duration::from_secs(settings.session.sweep_interval_secs.max(1)),
    );

    let service = Arc::new(ChatService::new(
        engine,
        sessions,
        default_index,
        ServiceOptions {
            index_path: settings.index.path.clone(),
            upload_dir: settings.index.upload_dir.clone(),
            chunk_size: settings.chunking.chunk_size,
            chunk_overlap: settings.chunking.chunk_overlap,
        },
    ));

    let app = create_router(service, settings.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind))?;
    tracing::info!("Chatbot server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}
