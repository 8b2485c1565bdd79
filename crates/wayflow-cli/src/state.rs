//! Application state wiring the engine to its storage.
//!
//! AppState pins the generic services to the SQLite repositories and the
//! JEXL expression evaluator.

use std::sync::Arc;

use wayflow_core::expr::jexl::JexlParser;
use wayflow_core::function::FunctionRegistry;
use wayflow_core::id::IdGenerator;
use wayflow_core::repository::memory::MemoryRepository;
use wayflow_core::service::access::AllowAll;
use wayflow_core::service::session::SessionService;
use wayflow_core::service::workflow::WorkflowService;
use wayflow_infra::config::load_engine_config;
use wayflow_infra::sqlite::pool::{database_url, default_data_dir, DatabasePool};
use wayflow_infra::sqlite::session::SqliteSessionRepository;
use wayflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use wayflow_types::config::EngineConfig;

use crate::functions::builtin_functions;

pub type ConcreteWorkflowService =
    WorkflowService<SqliteWorkflowRepository, SqliteSessionRepository, AllowAll>;

/// Service pinned to in-memory repositories, for running a file without
/// touching the database.
pub type ScratchWorkflowService = WorkflowService<MemoryRepository, MemoryRepository, AllowAll>;

/// Shared state for the persistent commands.
pub struct AppState {
    pub service: ConcreteWorkflowService,
}

impl AppState {
    /// Open the database, compile stored workflows and restore suspended
    /// sessions.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        let ids = Arc::new(IdGenerator::new());
        let sessions = SessionService::new(
            Arc::new(SqliteSessionRepository::new(db_pool.clone())),
            Arc::new(AllowAll),
            config,
            Arc::clone(&ids),
        );
        let service = WorkflowService::new(
            Arc::new(SqliteWorkflowRepository::new(db_pool)),
            Arc::new(AllowAll),
            Arc::new(JexlParser::new()),
            Arc::new(registry()),
            ids,
            sessions,
        );

        let loaded = service.load().await?;
        let restored = service.sessions().recover(&service).await?;
        tracing::debug!(loaded, restored, data_dir = %data_dir.display(), "engine ready");

        Ok(Self { service })
    }
}

/// A throwaway engine backed by memory.
pub fn scratch(config: EngineConfig) -> ScratchWorkflowService {
    let ids = Arc::new(IdGenerator::new());
    let repo = Arc::new(MemoryRepository::new());
    let sessions = SessionService::new(
        Arc::clone(&repo),
        Arc::new(AllowAll),
        config,
        Arc::clone(&ids),
    );
    WorkflowService::new(
        repo,
        Arc::new(AllowAll),
        Arc::new(JexlParser::new()),
        Arc::new(registry()),
        ids,
        sessions,
    )
}

fn registry() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    registry.register(builtin_functions());
    registry
}
