//! Success envelopes and the gzip JSON body used for result downloads.

use std::io::Write;

use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::{json, Value};

/// `{"message": "success", "result": ...}`
pub fn success<T: Serialize>(result: T) -> Json<Value> {
    Json(json!({ "message": "success", "result": result }))
}

/// Serialize `value` to JSON and gzip it.
pub fn gzip_json_bytes<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

/// A gzip-encoded JSON response with matching headers.
pub fn gzip_json_response(body: Vec<u8>) -> Response {
    (
        [(CONTENT_TYPE, "application/json"), (CONTENT_ENCODING, "gzip")],
        body,
    )
        .into_response()
}
