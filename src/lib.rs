pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod doc_processor;
pub mod events;
pub mod llm;
pub mod retrieval;
pub mod storage;
pub mod turn;

use anyhow::{Context, Result};
use auth::{ApiKeyAuth, Authenticator, NoAuth};
use config::ServerConfig;
use db::Database;
use doc_processor::FileTextExtractor;
use llm::openai::{OpenAiConfig, OpenAiProvider};
use std::sync::Arc;
use std::time::Duration;
use storage::LocalDocumentStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turn::{ChatServices, TurnSettings};

/// Identity used for every request when authentication is disabled
const DEV_USER_ID: &str = "local-dev";

/// Wire the turn pipeline's collaborators from configuration.
pub fn build_services(config: &ServerConfig) -> Result<ChatServices> {
    let database = Database::open(&config.storage.database_path).with_context(|| {
        format!(
            "failed to open database {}",
            config.storage.database_path.display()
        )
    })?;

    let api_key = config.llm.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("no OpenAI API key configured, generation requests will be rejected");
    }
    let provider = OpenAiProvider::new(OpenAiConfig {
        api_key,
        base_url: config.llm.base_url.clone(),
    })?;

    let auth: Arc<dyn Authenticator> = if config.auth.enabled {
        Arc::new(ApiKeyAuth::new(&config.auth.api_keys))
    } else {
        tracing::warn!(user_id = DEV_USER_ID, "authentication disabled, all requests share one identity");
        Arc::new(NoAuth::new(DEV_USER_ID))
    };

    let settings = TurnSettings {
        retrieval: config.retrieval,
        grounded_model: config.llm.grounded_model.clone(),
        text_model: config.llm.text_model.clone(),
        instructions: config
            .llm
            .instructions
            .clone()
            .unwrap_or_else(|| context::DEFAULT_INSTRUCTIONS.to_string()),
        generation_timeout: Duration::from_secs(config.llm.timeout_secs),
    };

    Ok(ChatServices {
        store: Arc::new(database),
        documents: Arc::new(LocalDocumentStore::new(&config.storage.documents_dir)),
        extractor: Arc::new(FileTextExtractor),
        provider: Arc::new(provider),
        auth,
        settings,
    })
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "civic_assist_lib=info,civic_assist=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Serve the chat API. Expects [`init_tracing`] to have run.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!("Starting civic-assist");
    config.validate()?;

    let services = build_services(&config)?;
    let app = api::router(api::AppState {
        services: Arc::new(services),
    });

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
