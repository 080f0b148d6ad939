//! Load execution and agent lifecycle orchestration.
//!
//! The [`Orchestrator`] owns the execution state machine. Every change to a
//! key's phase happens under that key's lock and is written with a
//! compare-and-swap, so concurrent start/stop/completion for the same key
//! serialize while different keys proceed independently.

mod completion;
pub mod locks;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::locks::KeyLocks;
use crate::agent::{AgentError, AgentInstallRequest, AgentService};
use crate::config::AppConfig;
use crate::load::aggregate::{
    AggregateError, MetricsFormat, MetricsOutput, ResultAggregator, ResultFormat, ResultOutput,
    SampleSource,
};
use crate::load::launcher::{CompletionEvent, LaunchError, ProcessLauncher, RunHandle, RunOutcome};
use crate::load::{
    validate_test_key, ExecutionConfig, ExecutionRequest, ExecutionState, Phase, ValidationError,
};
use crate::remote::{RemoteError, RemoteExecutor};
use crate::storage::{AgentRecord, AgentRegistry, ExecutionStore, Pool, TransitionOutcome};

/// Failure reason recorded for runs orphaned by a restart.
const RESTART_REASON: &str = "orchestrator restarted during run";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("load test '{test_key}' is {phase}")]
    Conflict { test_key: String, phase: Phase },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Aggregation(#[from] AggregateError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AgentError> for OrchestratorError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Invalid { field, reason } => {
                OrchestratorError::Validation(ValidationError::Invalid { field, reason })
            }
            AgentError::NotFound(id) => OrchestratorError::NotFound(format!("agent {}", id)),
            AgentError::Remote(e) => OrchestratorError::Remote(e),
            AgentError::Registry(e) => OrchestratorError::Storage(e),
            other @ AgentError::Script { .. } => OrchestratorError::Internal(other.to_string()),
        }
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing to stop; the key is in `phase`.
    NotRunning { phase: Phase },
    /// Nothing to stop; no test with this key exists.
    Unknown,
    /// The load tool exited and the key is `STOPPED`.
    Stopped,
    /// Termination was not confirmed; the key is `FAILED`.
    Failed { reason: String },
}

struct Inner {
    store: ExecutionStore,
    agents: AgentService,
    launcher: ProcessLauncher,
    aggregator: ResultAggregator,
    locks: KeyLocks,
    runs: Mutex<HashMap<String, RunHandle>>,
    events: mpsc::UnboundedSender<CompletionEvent>,
}

/// Cheap to clone; all clones share one state table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its completion loop. Must be called
    /// inside a Tokio runtime.
    pub fn new(pool: Pool, config: &AppConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(&config.load);
        let aggregator = ResultAggregator::new(launcher.result_dir());

        let inner = Arc::new(Inner {
            store: ExecutionStore::new(pool.clone()),
            agents: AgentService::new(AgentRegistry::new(pool), executor, &config.remote),
            launcher,
            aggregator,
            locks: KeyLocks::new(),
            runs: Mutex::new(HashMap::new()),
            events,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(completion::run_completion_loop(weak, rx));

        Self { inner }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Store (or, while still `PENDING`, replace) a test definition.
    pub async fn define_test(&self, req: ExecutionRequest) -> Result<ExecutionConfig, OrchestratorError> {
        req.validate()?;
        let key = req.test_key.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let _guard = self.inner.locks.lock(&key).await;
        self.upsert_pending(req, key)
    }

    /// Define the test if needed, launch the load tool and return the key.
    ///
    /// Returns as soon as the process is running; completion is recorded in
    /// the background.
    pub async fn start_test(&self, req: ExecutionRequest) -> Result<String, OrchestratorError> {
        req.validate()?;
        let key = req.test_key.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let _guard = self.inner.locks.lock(&key).await;
        let config = self.upsert_pending(req, key.clone())?;

        let handle = match self.inner.launcher.launch(&config, self.inner.events.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(test_key = %key, error = %e, "load tool launch failed");
                let reason = e.to_string();
                self.inner
                    .store
                    .transition(&key, Phase::Pending, Phase::Failed, Some(&reason))?;
                return Err(e.into());
            }
        };

        match self.inner.store.transition(&key, Phase::Pending, Phase::Running, None) {
            Ok(TransitionOutcome::Applied) => {
                info!(test_key = %key, pid = handle.pid, "load test running");
                self.put_run(handle);
                Ok(key)
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                warn!(test_key = %key, ?current, "state changed underneath start, stopping load tool");
                handle.stop().await;
                Err(OrchestratorError::Conflict {
                    test_key: key,
                    phase: current.unwrap_or(Phase::Failed),
                })
            }
            Err(e) => {
                error!(test_key = %key, error = %e, "could not record RUNNING, stopping load tool");
                handle.stop().await;
                Err(e.into())
            }
        }
    }

    /// Stop a running test. Stopping a key that is not running, or that was
    /// never defined, is a no-op.
    ///
    /// The stop runs on its own task: once begun it records its outcome even
    /// if the caller goes away.
    pub async fn stop_test(&self, test_key: &str) -> Result<StopOutcome, OrchestratorError> {
        validate_test_key(test_key)?;
        let this = self.clone();
        let key = test_key.to_string();
        tokio::spawn(async move { this.stop_locked(&key).await })
            .await
            .map_err(|e| OrchestratorError::Internal(format!("stop task failed: {}", e)))?
    }

    async fn stop_locked(&self, test_key: &str) -> Result<StopOutcome, OrchestratorError> {
        let _guard = self.inner.locks.lock(test_key).await;

        let Some(state) = self.inner.store.get_state(test_key)? else {
            info!(test_key, "stop requested for an unknown test");
            return Ok(StopOutcome::Unknown);
        };
        if state.phase != Phase::Running {
            info!(test_key, phase = %state.phase, "stop requested for a test that is not running");
            // another process may have settled the row under a live child
            if let Some(handle) = self.take_run(test_key) {
                let outcome = handle.stop().await;
                warn!(test_key, ?outcome, "reaped load tool of a settled test");
            }
            return Ok(StopOutcome::NotRunning { phase: state.phase });
        }

        let Some(handle) = self.take_run(test_key) else {
            let reason = "no live load tool process for this key".to_string();
            warn!(test_key, "RUNNING without a live process, marking failed");
            self.inner
                .store
                .transition(test_key, Phase::Running, Phase::Failed, Some(&reason))?;
            return Ok(StopOutcome::Failed { reason });
        };

        let outcome = handle.stop().await;
        let reason = outcome.failure_reason();
        let next = match (&outcome, &reason) {
            (RunOutcome::Stopped, _) => Phase::Stopped,
            // exited on its own just before the stop landed
            (RunOutcome::Exited { .. }, None) => Phase::Completed,
            _ => Phase::Failed,
        };

        match self
            .inner
            .store
            .transition(test_key, Phase::Running, next, reason.as_deref())?
        {
            TransitionOutcome::Applied => {
                info!(test_key, phase = %next, ?outcome, "load test stop recorded");
            }
            TransitionOutcome::Rejected { current } => {
                warn!(test_key, ?current, "state left RUNNING during stop");
            }
        }

        Ok(match next {
            Phase::Stopped => StopOutcome::Stopped,
            Phase::Failed => StopOutcome::Failed {
                reason: reason.unwrap_or_default(),
            },
            phase => StopOutcome::NotRunning { phase },
        })
    }

    /// Stop every running test; used on shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.runs().keys().cloned().collect();
        for key in keys {
            match self.stop_test(&key).await {
                Ok(outcome) => info!(test_key = %key, ?outcome, "stopped on shutdown"),
                Err(e) => error!(test_key = %key, error = %e, "failed to stop on shutdown"),
            }
        }
    }

    pub fn get_config(&self, test_key: &str) -> Result<ExecutionConfig, OrchestratorError> {
        validate_test_key(test_key)?;
        self.inner
            .store
            .get_config(test_key)?
            .ok_or_else(|| not_found(test_key))
    }

    pub fn list_configs(&self) -> Result<Vec<ExecutionConfig>, OrchestratorError> {
        Ok(self.inner.store.list_configs()?)
    }

    pub fn get_state(&self, test_key: &str) -> Result<ExecutionState, OrchestratorError> {
        validate_test_key(test_key)?;
        self.state_or_not_found(test_key)
    }

    pub fn list_states(&self) -> Result<Vec<ExecutionState>, OrchestratorError> {
        Ok(self.inner.store.list_states()?)
    }

    /// Aggregated load results. Unknown formats fall back to the default.
    pub async fn result(&self, test_key: &str, format: Option<&str>) -> Result<ResultOutput, OrchestratorError> {
        let source = self.sample_source(test_key)?;
        let format = ResultFormat::parse_lenient(format);
        let aggregator = self.inner.aggregator.clone();
        let key = test_key.to_string();

        let output = tokio::task::spawn_blocking(move || aggregator.aggregate_result(&key, format, source))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("aggregation task failed: {}", e)))??;
        Ok(output)
    }

    /// Aggregated host metrics from the monitoring agent.
    pub async fn metrics(&self, test_key: &str, format: Option<&str>) -> Result<MetricsOutput, OrchestratorError> {
        let source = self.sample_source(test_key)?;
        let format = MetricsFormat::parse_lenient(format);
        let aggregator = self.inner.aggregator.clone();
        let key = test_key.to_string();

        let output = tokio::task::spawn_blocking(move || aggregator.aggregate_metrics(&key, format, source))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("aggregation task failed: {}", e)))??;
        Ok(output)
    }

    /// Mark keys left `RUNNING` by a previous process as `FAILED`.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let keys = self.inner.store.keys_in_phase(Phase::Running)?;
        let mut recovered = 0;

        for key in keys {
            let _guard = self.inner.locks.lock(&key).await;
            if self.runs().contains_key(&key) {
                continue;
            }
            match self
                .inner
                .store
                .transition(&key, Phase::Running, Phase::Failed, Some(RESTART_REASON))?
            {
                TransitionOutcome::Applied => {
                    warn!(test_key = %key, "orphaned RUNNING test marked failed");
                    recovered += 1;
                }
                TransitionOutcome::Rejected { current } => {
                    debug!(test_key = %key, ?current, "key left RUNNING before recovery");
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered orphaned load tests");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn install_agent(&self, req: &AgentInstallRequest) -> Result<i64, OrchestratorError> {
        Ok(self.inner.agents.install(req).await?)
    }

    pub async fn uninstall_agent(&self, id: i64) -> Result<(), OrchestratorError> {
        Ok(self.inner.agents.uninstall(id).await?)
    }

    /// Drop an agent record without running the uninstall script.
    pub fn forget_agent(&self, id: i64) -> Result<(), OrchestratorError> {
        Ok(self.inner.agents.forget(id)?)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, OrchestratorError> {
        Ok(self.inner.agents.list()?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Insert a new definition, or replace one that has not started. Caller
    /// holds the key lock.
    fn upsert_pending(&self, req: ExecutionRequest, key: String) -> Result<ExecutionConfig, OrchestratorError> {
        let config = req.into_config(key, Utc::now());
        let store = &self.inner.store;

        match store.get_state(&config.test_key)? {
            None => {
                store.insert(&config)?;
                info!(test_key = %config.test_key, "load test defined");
            }
            Some(state) if state.phase == Phase::Pending => {
                if !store.replace_pending(&config)? {
                    return Err(self.conflict(&config.test_key));
                }
                info!(test_key = %config.test_key, "pending load test redefined");
            }
            Some(state) => {
                return Err(OrchestratorError::Conflict {
                    test_key: config.test_key,
                    phase: state.phase,
                });
            }
        }
        Ok(config)
    }

    fn conflict(&self, test_key: &str) -> OrchestratorError {
        let phase = self
            .inner
            .store
            .get_state(test_key)
            .ok()
            .flatten()
            .map(|s| s.phase)
            .unwrap_or(Phase::Failed);
        OrchestratorError::Conflict {
            test_key: test_key.to_string(),
            phase,
        }
    }

    fn state_or_not_found(&self, test_key: &str) -> Result<ExecutionState, OrchestratorError> {
        self.inner
            .store
            .get_state(test_key)?
            .ok_or_else(|| not_found(test_key))
    }

    fn sample_source(&self, test_key: &str) -> Result<SampleSource, OrchestratorError> {
        validate_test_key(test_key)?;
        let state = self.state_or_not_found(test_key)?;
        Ok(if state.phase.is_terminal() {
            SampleSource::Settled
        } else {
            SampleSource::Live
        })
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunHandle>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put_run(&self, handle: RunHandle) {
        self.runs().insert(handle.test_key.clone(), handle);
    }

    fn take_run(&self, test_key: &str) -> Option<RunHandle> {
        self.runs().remove(test_key)
    }
}

fn not_found(test_key: &str) -> OrchestratorError {
    OrchestratorError::NotFound(format!("load test '{}'", test_key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
