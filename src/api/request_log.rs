//! One log line per HTTP request.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Path fragments whose requests are never logged.
const SKIP_PATTERNS: [&str; 2] = ["/swagger/", "/readyz"];

fn is_skipped(method: &Method, path: &str) -> bool {
    *method == Method::OPTIONS || SKIP_PATTERNS.iter().any(|p| path.contains(p))
}

pub async fn request_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let started = Instant::now();
    let mut response = next.run(request).await;
    let latency = started.elapsed();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if !is_skipped(&method, uri.path()) {
        let status = response.status().as_u16();
        if response.status().is_server_error() {
            error!(id = %request_id, %method, %uri, client_ip = %client_ip, status, ?latency, "request failed");
        } else {
            info!(id = %request_id, %method, %uri, client_ip = %client_ip, status, ?latency, "request");
        }
    }

    response
}
