//! Process-wide wiring: configuration, the database pool, and the orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::remote::ssh::SshExecutor;
use crate::storage::{self, Pool};

/// Everything the server and the CLI commands share.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub pool: Pool,
    pub orchestrator: Orchestrator,
}

impl AppContext {
    /// Open the metadata database and build the orchestrator.
    ///
    /// Does not touch rows left `RUNNING` by another process; only the
    /// server calls [`Orchestrator::recover`], since a CLI invocation may
    /// run next to a live server.
    pub fn init(config: AppConfig) -> Result<Self> {
        let db_path = config.datasource.resolved_path();
        info!(path = %db_path.display(), "opening metadata database");
        let pool = storage::open_pool(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;

        let executor = Arc::new(SshExecutor::new(&config.remote));
        let orchestrator = Orchestrator::new(pool.clone(), &config, executor);

        Ok(Self {
            config: Arc::new(config),
            pool,
            orchestrator,
        })
    }
}
