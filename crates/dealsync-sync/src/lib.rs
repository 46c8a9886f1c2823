//! Deal synchronization engine: reference resolution, the paginated fetch state machine,
//! PostgreSQL upserts and checkpoints, the single-deal path and the recurring job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealsync_adapters::BitrixClient;
use dealsync_core::SyncCounters;
use dealsync_storage::{
    CheckpointStore, EndpointSelector, FileCheckpointStore, HttpClientConfig, ReqwestTransport,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod checkpoint;
mod config;
mod engine;
mod error;
mod resolver;
mod scheduler;
mod sink;
mod updater;

pub use checkpoint::PgCheckpointStore;
pub use config::{partition_stream, CheckpointBackend, EndpointMode, SyncConfig};
pub use engine::{FetchSettings, StreamSummary, SyncEngine, SyncRunSummary};
pub use error::SyncError;
pub use resolver::ReferenceResolver;
pub use scheduler::{maybe_build_scheduler, RunGuard};
pub use sink::{DealSink, PgDealStore};
pub use updater::{DealUpdater, SingleDealOutcome};

pub const CRATE_NAME: &str = "dealsync-sync";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(config: &SyncConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("running migrations")?;
    info!("migrations applied");
    Ok(())
}

/// CRM client over every configured endpoint, with fresh run counters.
pub fn build_client(config: &SyncConfig) -> Result<BitrixClient> {
    let transport = ReqwestTransport::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let selector = EndpointSelector::new(
        config.endpoints.clone(),
        Arc::new(transport),
        config.rate_limit_policy(),
        Arc::new(SyncCounters::default()),
    );
    Ok(BitrixClient::new(selector))
}

/// The configured checkpoint backend. `pool` is required for the PostgreSQL backend.
pub fn checkpoint_store(
    config: &SyncConfig,
    pool: Option<&PgPool>,
) -> Result<Arc<dyn CheckpointStore>> {
    match config.checkpoint_backend {
        CheckpointBackend::File => Ok(Arc::new(FileCheckpointStore::new(
            config.checkpoint_dir.clone(),
        ))),
        CheckpointBackend::Postgres => {
            let pool = pool.context("postgres checkpoint backend needs a database pool")?;
            Ok(Arc::new(PgCheckpointStore::new(pool.clone())))
        }
    }
}

pub fn build_engine(config: &SyncConfig, pool: &PgPool) -> Result<SyncEngine> {
    let mapping = config.load_field_mapping()?;
    let engine = SyncEngine::new(
        build_client(config)?,
        Arc::new(PgDealStore::new(pool.clone())),
        checkpoint_store(config, Some(pool))?,
        mapping,
        config.fetch_settings(),
    )?
    .with_streams(config.endpoint_mode, config.stream.clone())
    .with_picklist_delimiter(config.picklist_delimiter.clone());
    Ok(engine)
}

pub fn build_updater(config: &SyncConfig, pool: &PgPool) -> Result<DealUpdater> {
    let updater = DealUpdater::new(
        build_client(config)?,
        Arc::new(PgDealStore::new(pool.clone())),
        config.load_field_mapping()?,
        config.picklist_delimiter.clone(),
        config.reference_ttl(),
    )?;
    Ok(updater)
}

/// Migrates the store and runs one full sync.
pub async fn run_sync_once(
    config: &SyncConfig,
    cancel: &CancellationToken,
) -> Result<SyncRunSummary> {
    config.validate()?;
    let pool = connect(config).await?;
    run_migrations(&pool).await?;
    run_sync_with_pool(config, &pool, cancel).await
}

/// One full sync over an already migrated pool.
pub async fn run_sync_with_pool(
    config: &SyncConfig,
    pool: &PgPool,
    cancel: &CancellationToken,
) -> Result<SyncRunSummary> {
    let engine = build_engine(config, pool)?;
    Ok(engine.run(cancel).await?)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    run_sync_once(&config, &CancellationToken::new()).await
}
