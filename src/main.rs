mod api;
mod auth;
mod cache;
mod collapse;
mod config;
mod error;
mod extract;
mod ids;
mod models;
mod pipeline;
mod provision;
mod queue;
mod relate;
mod store;
mod writer;

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use config::Config;
use ids::RandomIds;
use models::JobRecord;
use pipeline::ImportPipeline;
use queue::QueuedTask;
use store::SqliteItemStore;
use tokio::sync::{mpsc, RwLock};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    pub queue_tx: mpsc::Sender<QueuedTask>,
    pub pipeline: Arc<ImportPipeline>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_import_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; set MODEL_IMPORT_API_KEY to pin one");
    }

    let store = SqliteItemStore::open(&config.store_path).with_context(|| {
        format!("Failed to open item store at {}", config.store_path.display())
    })?;
    let pipeline = ImportPipeline::new(
        Arc::new(store),
        Arc::new(RandomIds),
        config.pipeline_options(),
    );

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState {
        config: config.clone(),
        jobs: Arc::new(RwLock::new(HashMap::new())),
        queue_tx,
        pipeline: Arc::new(pipeline),
    };

    queue::spawn_task_worker(state.clone(), queue_rx);
    queue::spawn_cleanup_worker(state.clone());

    let app = api::router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        store = %config.store_path.display(),
        "model-import-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
