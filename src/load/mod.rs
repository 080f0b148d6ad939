//! Load-test executions: definitions, lifecycle state, the external load
//! tool launcher and the result aggregator.

pub mod aggregate;
pub mod launcher;
pub mod phase;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::phase::Phase;

const MAX_TEST_KEY_LEN: usize = 128;
const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("load test key must not be blank")]
    BlankKey,

    #[error("load test key is longer than {max} characters")]
    KeyTooLong { max: usize },

    #[error("load test key may only contain letters, digits, '.', '_' and '-'")]
    KeyCharset,

    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Reject keys that are blank, too long, or unusable as a file-name stem.
pub fn validate_test_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::BlankKey);
    }
    if key.len() > MAX_TEST_KEY_LEN {
        return Err(ValidationError::KeyTooLong {
            max: MAX_TEST_KEY_LEN,
        });
    }
    if key.starts_with('.')
        || key
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '.' && c != '_' && c != '-')
    {
        return Err(ValidationError::KeyCharset);
    }
    Ok(())
}

/// Raw sample file the load tool writes for `test_key`.
pub fn result_file(result_dir: &Path, test_key: &str) -> PathBuf {
    result_dir.join(format!("{}_result.csv", test_key))
}

/// Host-metrics file the monitoring agent feeds for `test_key`.
pub fn metrics_file(result_dir: &Path, test_key: &str) -> PathBuf {
    result_dir.join(format!("{}_metrics.csv", test_key))
}

/// Endpoint under load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    80
}

/// HTTP request each virtual user issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template handed verbatim to the load tool.
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// Shape of the generated load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProfile {
    pub virtual_users: u32,
    #[serde(default)]
    pub ramp_up_secs: u32,
    #[serde(default = "default_ramp_steps")]
    pub ramp_up_steps: u32,
    pub duration_secs: u32,
}

fn default_ramp_steps() -> u32 {
    1
}

/// Caller's definition of a test. `test_key` is generated when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default, alias = "loadTestKey")]
    pub test_key: Option<String>,
    pub target: Target,
    #[serde(default = "HttpSpec::default_get")]
    pub http: HttpSpec,
    pub profile: LoadProfile,
    #[serde(default)]
    pub agent_hostname: Option<String>,
}

impl HttpSpec {
    fn default_get() -> Self {
        Self {
            method: default_method(),
            path: default_path(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

impl ExecutionRequest {
    /// Structural checks; does not touch storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(key) = &self.test_key {
            validate_test_key(key)?;
        }

        let protocol = self.target.protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(ValidationError::Invalid {
                field: "target.protocol",
                reason: format!("'{}' is not http or https", self.target.protocol),
            });
        }
        let host = self.target.hostname.trim();
        if host.is_empty() {
            return Err(ValidationError::Missing {
                field: "target.hostname",
            });
        }
        if host.starts_with('-') || host.chars().any(char::is_whitespace) {
            return Err(ValidationError::Invalid {
                field: "target.hostname",
                reason: "must be a bare host name or address".to_string(),
            });
        }
        if self.target.port == 0 {
            return Err(ValidationError::Invalid {
                field: "target.port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }

        let method = self.http.method.to_ascii_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(ValidationError::Invalid {
                field: "http.method",
                reason: format!("unsupported method '{}'", self.http.method),
            });
        }
        if !self.http.path.starts_with('/') {
            return Err(ValidationError::Invalid {
                field: "http.path",
                reason: "must start with '/'".to_string(),
            });
        }

        if self.profile.virtual_users == 0 {
            return Err(ValidationError::Invalid {
                field: "profile.virtualUsers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.profile.duration_secs == 0 {
            return Err(ValidationError::Invalid {
                field: "profile.durationSecs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Bind the request to a key and creation time.
    pub fn into_config(self, test_key: String, created_at: DateTime<Utc>) -> ExecutionConfig {
        ExecutionConfig {
            test_key,
            target: Target {
                protocol: self.target.protocol.to_ascii_lowercase(),
                hostname: self.target.hostname.trim().to_string(),
                port: self.target.port,
            },
            http: HttpSpec {
                method: self.http.method.to_ascii_uppercase(),
                ..self.http
            },
            profile: self.profile,
            agent_hostname: self.agent_hostname.filter(|h| !h.trim().is_empty()),
            created_at,
        }
    }
}

/// A stored test definition. Read-only once its key has left `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(rename = "loadTestKey")]
    pub test_key: String,
    pub target: Target,
    pub http: HttpSpec,
    pub profile: LoadProfile,
    pub agent_hostname: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Current lifecycle state of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    #[serde(rename = "loadTestKey")]
    pub test_key: String,
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn request(key: Option<&str>) -> ExecutionRequest {
        ExecutionRequest {
            test_key: key.map(str::to_string),
            target: Target {
                protocol: "http".to_string(),
                hostname: "10.0.0.20".to_string(),
                port: 8080,
            },
            http: HttpSpec {
                method: "post".to_string(),
                path: "/api/orders".to_string(),
                headers: BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]),
                body: "{\"sku\":\"A-1\"}".to_string(),
            },
            profile: LoadProfile {
                virtual_users: 10,
                ramp_up_secs: 5,
                ramp_up_steps: 2,
                duration_secs: 30,
            },
            agent_hostname: None,
        }
    }
}
