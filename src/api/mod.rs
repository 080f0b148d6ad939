//! API layer -- axum routes, handlers, and middleware.

mod error;
mod request_log;
mod response;
mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

pub use self::error::ApiError;
use self::state::AppState;
use crate::config::ServerConfig;

/// Build the application router with all API routes.
pub fn router(state: AppState, server: &ServerConfig) -> Router {
    let base = server.base_path.trim_end_matches('/');
    let api = if base.is_empty() {
        Router::new().merge(routes::api_routes())
    } else {
        Router::new().nest(base, routes::api_routes())
    };

    api.fallback(fallback)
        .layer(middleware::from_fn(request_log::request_log))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            server.request_timeout(),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "message": "not found" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::{scripts, FakeExecutor, Scripted};
    use crate::config::{AppConfig, LoadConfig, ServerConfig};
    use crate::load::Phase;
    use crate::orchestrator::Orchestrator;
    use crate::storage::test_support::temp_pool;
    use axum::body::Body;
    use axum::http::Request;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    const BASE: &str = "/ant/api/v1";

    fn app(script: &str) -> (tempfile::TempDir, Orchestrator, Router) {
        let (dir, pool) = temp_pool();
        let config = AppConfig {
            load: LoadConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                work_dir: dir.path().to_string_lossy().into_owned(),
                result_dir: dir.path().join("result").to_string_lossy().into_owned(),
                stop_grace_secs: 1,
            },
            remote: scripts(dir.path()),
            ..AppConfig::default()
        };
        let orchestrator = Orchestrator::new(pool, &config, FakeExecutor::new(Scripted::Succeed));
        let router = router(
            AppState {
                orchestrator: orchestrator.clone(),
            },
            &config.server,
        );
        (dir, orchestrator, router)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(format!("{}{}", BASE, uri)).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("{}{}", BASE, uri))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1_000_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn start_body(key: &str) -> Value {
        json!({
            "loadTestKey": key,
            "target": { "hostname": "10.0.0.20", "port": 8080 },
            "http": { "method": "GET", "path": "/" },
            "profile": { "virtualUsers": 2, "durationSecs": 5 }
        })
    }

    async fn wait_for_phase(orch: &Orchestrator, key: &str, phase: Phase) {
        for _ in 0..200 {
            if orch.get_state(key).unwrap().phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{} never reached {}", key, phase);
    }

    #[tokio::test]
    async fn test_readyz() {
        let (_dir, _orch, app) = app("exit 0");
        let response = app.oneshot(get("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], "ok");
    }

    #[tokio::test]
    async fn test_blank_key_is_bad_request() {
        let (_dir, _orch, app) = app("exit 0");

        for uri in ["/load/result?loadTestKey=", "/load/result/metrics", "/load/result?loadTestKey=%20"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body = json_body(response).await;
            assert_eq!(body["status"], "bad request");
            assert_eq!(body["message"], "");
        }

        let response = app
            .oneshot(post_json("/load/stop", json!({ "loadTestKey": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["message"],
            "pass loadTestKey if you want to stop test"
        );
    }

    #[tokio::test]
    async fn test_malformed_start_body_is_bad_request() {
        let (_dir, _orch, app) = app("exit 0");
        let response = app
            .oneshot(post_json("/load/start", json!({ "target": 3 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["message"].as_str().unwrap().starts_with("request param is incorrect;"));
    }

    #[tokio::test]
    async fn test_start_then_fetch_gzip_result() {
        let (_dir, orch, app) = app(
            "printf 'timeStamp,elapsed,label,responseCode,success,bytes,sentBytes\\n1000,40,home,200,true,100,10\\n' > {result_file}",
        );

        let response = app
            .clone()
            .oneshot(post_json("/load/start", start_body("T1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"], "T1");
        wait_for_phase(&orch, "T1", Phase::Completed).await;

        let response = app
            .clone()
            .oneshot(get("/load/result?loadTestKey=T1&format=aggregate"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers()["content-encoding"], "gzip");

        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000).await.unwrap();
        let mut text = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut text).unwrap();
        let stats: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(stats[0]["label"], "home");
        assert_eq!(stats[0]["requestCount"], 1);

        let response = app.oneshot(get("/load/state/T1")).await.unwrap();
        assert_eq!(json_body(response).await["result"]["phase"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_settled_without_results_is_internal_error() {
        let (_dir, orch, app) = app("exit 0");
        app.clone()
            .oneshot(post_json("/load/start", start_body("T1")))
            .await
            .unwrap();
        wait_for_phase(&orch, "T1", Phase::Completed).await;

        let response = app.oneshot(get("/load/result?loadTestKey=T1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["message"],
            "sorry, internal server error while getting load test result;"
        );
    }

    #[tokio::test]
    async fn test_unknown_key_and_conflict() {
        let (_dir, orch, app) = app("sleep 30");

        let response = app.clone().oneshot(get("/load/state/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(post_json("/load/stop", json!({ "loadTestKey": "nope" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"]["outcome"], "unknown");

        let first = app
            .clone()
            .oneshot(post_json("/load/start", start_body("T1")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app
            .clone()
            .oneshot(post_json("/load/start", start_body("T1")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(post_json("/load/stop", json!({ "loadTestKey": "T1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "success");
        assert_eq!(body["result"]["outcome"], "stopped");
        assert_eq!(orch.get_state("T1").unwrap().phase, Phase::Stopped);
    }

    #[tokio::test]
    async fn test_agent_routes() {
        let (_dir, _orch, app) = app("exit 0");

        let response = app
            .clone()
            .oneshot(post_json(
                "/load/agent",
                json!({ "pemKeyPath": "/keys/a.pem", "username": "ubuntu", "publicIp": "10.0.0.30" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = json_body(response).await["result"].as_i64().unwrap();

        let response = app.clone().oneshot(get("/load/agent")).await.unwrap();
        let listed = json_body(response).await;
        assert_eq!(listed["result"][0]["publicIp"], "10.0.0.30");

        let response = app.clone().oneshot(delete(&id.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(delete(&id.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn delete(path: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(format!("{}/load/agent/{}", BASE, path))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_agent_record_only_delete_skips_remote() {
        let (dir, pool) = temp_pool();
        let fake = FakeExecutor::new(Scripted::Succeed);
        let config = AppConfig {
            load: LoadConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 0".to_string()],
                work_dir: dir.path().to_string_lossy().into_owned(),
                result_dir: dir.path().join("result").to_string_lossy().into_owned(),
                stop_grace_secs: 1,
            },
            remote: scripts(dir.path()),
            ..AppConfig::default()
        };
        let orch = Orchestrator::new(pool, &config, fake.clone());
        let app = router(AppState { orchestrator: orch.clone() }, &config.server);

        let id = orch
            .install_agent(&crate::agent::AgentInstallRequest {
                pem_key_path: "/keys/a.pem".to_string(),
                username: "ubuntu".to_string(),
                public_ip: "10.0.0.30".to_string(),
            })
            .await
            .unwrap();
        fake.set(Scripted::SessionFailure);

        let response = app.clone().oneshot(delete(&id.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(orch.list_agents().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(delete(&format!("{}?recordOnly=true", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(orch.list_agents().unwrap().is_empty());
        assert_eq!(fake.calls.lock().unwrap().len(), 2);

        let response = app
            .oneshot(delete(&format!("{}?recordOnly=true", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_params_get_json_bad_request() {
        let (_dir, _orch, app) = app("exit 0");

        for request in [delete("abc"), delete("1?recordOnly=maybe")] {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["status"], "bad request");
            assert!(body["message"]
                .as_str()
                .unwrap()
                .starts_with("request param is incorrect;"));
        }
    }

    #[tokio::test]
    async fn test_request_timeout_still_settles_stop() {
        let (dir, pool) = temp_pool();
        let config = AppConfig {
            server: ServerConfig {
                request_timeout_secs: 1,
                ..ServerConfig::default()
            },
            load: LoadConfig {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "trap 'sleep 3; exit 0' TERM; while true; do sleep 0.1; done".to_string(),
                ],
                work_dir: dir.path().to_string_lossy().into_owned(),
                result_dir: dir.path().join("result").to_string_lossy().into_owned(),
                stop_grace_secs: 5,
            },
            remote: scripts(dir.path()),
            ..AppConfig::default()
        };
        let orch = Orchestrator::new(pool, &config, FakeExecutor::new(Scripted::Succeed));
        let app = router(AppState { orchestrator: orch.clone() }, &config.server);

        let response = app.clone().oneshot(post_json("/load/start", start_body("T1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = app
            .oneshot(post_json("/load/stop", json!({ "loadTestKey": "T1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        wait_for_phase(&orch, "T1", Phase::Stopped).await;
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_dir, _orch, app) = app("exit 0");
        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
