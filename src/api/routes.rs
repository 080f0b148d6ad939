//! API route definitions.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::error::ApiError;
use super::response::{gzip_json_bytes, gzip_json_response, success};
use super::state::AppState;
use crate::agent::AgentInstallRequest;
use crate::load::ExecutionRequest;

const RESULT_ERROR: &str = "sorry, internal server error while getting load test result;";
const START_ERROR: &str = "sorry, internal server error while executing load test;";
const AGENT_ERROR: &str = "sorry, internal server error while handling the agent;";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/readyz", get(readyz))
        .route("/load/start", post(start_load_test))
        .route("/load/stop", post(stop_load_test))
        .route("/load/config", get(list_configs))
        .route("/load/config/{loadTestKey}", get(get_config))
        .route("/load/state", get(list_states))
        .route("/load/state/{loadTestKey}", get(get_state))
        .route("/load/result", get(get_result))
        .route("/load/result/metrics", get(get_metrics))
        .route("/load/agent", post(install_agent).get(list_agents))
        .route("/load/agent/{agentId}", delete(uninstall_agent))
}

async fn readyz() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

async fn start_load_test(
    State(state): State<AppState>,
    body: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|e| incorrect_param(e.body_text()))?;
    let key = state
        .orchestrator
        .start_test(req)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, START_ERROR))?;
    Ok(success(key))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(rename = "loadTestKey", default)]
    load_test_key: String,
}

async fn stop_load_test(
    State(state): State<AppState>,
    body: Result<Json<StopRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|e| incorrect_param(e.body_text()))?;
    if req.load_test_key.trim().is_empty() {
        return Err(ApiError::bad_request("pass loadTestKey if you want to stop test"));
    }

    let outcome = state
        .orchestrator
        .stop_test(&req.load_test_key)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, START_ERROR))?;
    Ok(success(outcome))
}

async fn list_configs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(success(state.orchestrator.list_configs()?))
}

async fn get_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(success(state.orchestrator.get_config(&key)?))
}

async fn list_states(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(success(state.orchestrator.list_states()?))
}

async fn get_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(success(state.orchestrator.get_state(&key)?))
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    #[serde(rename = "loadTestKey", default)]
    load_test_key: String,
    #[serde(default)]
    format: Option<String>,
}

async fn get_result(
    State(state): State<AppState>,
    query: Result<Query<ResultQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| incorrect_param(e.body_text()))?;
    if query.load_test_key.trim().is_empty() {
        return Err(ApiError::bad_request(""));
    }
    let output = state
        .orchestrator
        .result(&query.load_test_key, query.format.as_deref())
        .await
        .map_err(|e| ApiError::from_orchestrator(e, RESULT_ERROR))?;
    gzip_response(&output)
}

async fn get_metrics(
    State(state): State<AppState>,
    query: Result<Query<ResultQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| incorrect_param(e.body_text()))?;
    if query.load_test_key.trim().is_empty() {
        return Err(ApiError::bad_request(""));
    }
    let output = state
        .orchestrator
        .metrics(&query.load_test_key, query.format.as_deref())
        .await
        .map_err(|e| ApiError::from_orchestrator(e, RESULT_ERROR))?;
    gzip_response(&output)
}

fn gzip_response<T: serde::Serialize>(value: &T) -> Result<Response, ApiError> {
    match gzip_json_bytes(value) {
        Ok(body) => Ok(gzip_json_response(body)),
        Err(e) => {
            error!(error = %e, "failed to encode result body");
            Err(ApiError::internal(RESULT_ERROR))
        }
    }
}

async fn install_agent(
    State(state): State<AppState>,
    body: Result<Json<AgentInstallRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|e| incorrect_param(e.body_text()))?;
    let id = state
        .orchestrator
        .install_agent(&req)
        .await
        .map_err(|e| ApiError::from_orchestrator(e, AGENT_ERROR))?;
    Ok(success(id))
}

#[derive(Debug, Default, Deserialize)]
struct UninstallQuery {
    /// Drop the record only; the uninstall script is not run.
    #[serde(rename = "recordOnly", default)]
    record_only: bool,
}

async fn uninstall_agent(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    query: Result<Query<UninstallQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(id) = id.map_err(|e| incorrect_param(e.body_text()))?;
    let Query(query) = query.map_err(|e| incorrect_param(e.body_text()))?;
    let outcome = if query.record_only {
        state.orchestrator.forget_agent(id)
    } else {
        state.orchestrator.uninstall_agent(id).await
    };
    outcome.map_err(|e| ApiError::from_orchestrator(e, AGENT_ERROR))?;
    Ok(Json(json!({ "message": "success" })))
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(success(state.orchestrator.list_agents()?))
}

fn incorrect_param(detail: String) -> ApiError {
    ApiError::bad_request(format!("request param is incorrect; {}", detail))
}
