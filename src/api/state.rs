use crate::orchestrator::Orchestrator;

/// Shared handler state; cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}
