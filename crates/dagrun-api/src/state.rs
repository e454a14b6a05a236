//! Application state wiring the engine to concrete infrastructure.
//!
//! The engine is generic over its store; `AppState` pins the substrate and
//! hasher and is built once per backend by `main`.

use std::path::Path;
use std::sync::Arc;

use dagrun_core::allocator::UnitAllocator;
use dagrun_core::engine::Engine;
use dagrun_core::repository::DagStore;
use dagrun_infra::crypto::hash::Sha256ContentHasher;
use dagrun_infra::postgres::dag::PgDagStore;
use dagrun_infra::sqlite::dag::SqliteDagStore;
use dagrun_infra::sqlite::pool::DatabasePool;
use dagrun_infra::substrate::local::LocalProcessSubstrate;
use dagrun_types::config::EngineConfig;

/// Engine pinned to the local substrate and SHA-256 hashing.
pub type ConcreteEngine<S> = Engine<S, LocalProcessSubstrate, Sha256ContentHasher>;

/// Shared application state used by every CLI command.
pub struct AppState<S> {
    pub config: EngineConfig,
    pub store: Arc<S>,
    pub substrate: Arc<LocalProcessSubstrate>,
    pub engine: Arc<ConcreteEngine<S>>,
}

impl<S: DagStore> AppState<S> {
    pub fn new(config: EngineConfig, store: S, work_dir: &Path) -> Self {
        let store = Arc::new(store);
        let substrate = Arc::new(LocalProcessSubstrate::new(work_dir));
        let allocator = UnitAllocator::new(
            Arc::clone(&substrate),
            config.engine_id.clone(),
            config.allocation.max_name_attempts,
        );
        let engine = Arc::new(Engine::new(Arc::clone(&store), allocator, Sha256ContentHasher));

        Self {
            config,
            store,
            substrate,
            engine,
        }
    }
}

/// Open the embedded store, creating the database file if needed.
pub async fn open_sqlite(config: &EngineConfig) -> anyhow::Result<SqliteDagStore> {
    let sqlite = &config.database.sqlite;
    if let Some(parent) = Path::new(&sqlite.path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let pool = DatabasePool::from_config(sqlite).await?;
    tracing::debug!(path = %sqlite.path, "opened sqlite store");
    Ok(SqliteDagStore::new(pool))
}

pub async fn open_postgres(config: &EngineConfig) -> anyhow::Result<PgDagStore> {
    let pool = dagrun_infra::postgres::pool::connect(&config.database.postgres).await?;
    tracing::debug!("opened postgres store");
    Ok(PgDagStore::new(pool))
}
