//! TOML configuration for antload.
//!
//! Layered model: compiled-in defaults, an optional TOML file (explicit path,
//! `ANT_CONFIG`, or `${ROOT}/config.toml`), and `${ROOT}` substitution in
//! path-like values. `${ROOT}` is `ANT_ROOT_PATH` or the working directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Placeholder substituted with the application root in path settings.
pub const ROOT_PLACEHOLDER: &str = "${ROOT}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error("{name} ({value}s) must be shorter than server.request_timeout_secs ({outer}s)")]
    TimeoutNotNested {
        name: &'static str,
        value: u64,
        outer: u64,
    },

    #[error("load.program must not be empty")]
    EmptyProgram,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub datasource: DatasourceConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit` (fatal if it cannot be loaded).
    /// 2. The `ANT_CONFIG` environment variable.
    /// 3. `${ROOT}/config.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("ANT_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ANT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let root_config = root_path().join("config.toml");
        if root_config.exists() {
            match Self::load(&root_config) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %root_config.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check cross-field constraints.
    ///
    /// The remote session deadlines must sit inside the HTTP request timeout,
    /// otherwise a client would see a timeout while the install still runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let outer = self.server.request_timeout_secs;
        let timeouts = [
            ("remote.install_timeout_secs", self.remote.install_timeout_secs),
            ("remote.uninstall_timeout_secs", self.remote.uninstall_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout { name });
            }
            if value >= outer {
                return Err(ConfigError::TimeoutNotNested { name, value, outer });
            }
        }
        if self.load.stop_grace_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                name: "load.stop_grace_secs",
            });
        }
        if self.load.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        Ok(())
    }
}

/// Application root: `ANT_ROOT_PATH`, else the current working directory.
pub fn root_path() -> PathBuf {
    match std::env::var("ANT_ROOT_PATH") {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Replace the first `${ROOT}` in `value` with [`root_path`].
pub fn expand_root(value: &str) -> PathBuf {
    if value.contains(ROOT_PLACEHOLDER) {
        let root = root_path();
        PathBuf::from(value.replacen(ROOT_PLACEHOLDER, &root.to_string_lossy(), 1))
    } else {
        PathBuf::from(value)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the API listener.
    pub bind: String,
    /// Outer bound on every HTTP request.
    pub request_timeout_secs: u64,
    /// Prefix all API routes are nested under.
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8880".to_string(),
            request_timeout_secs: 300,
            base_path: "/ant/api/v1".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Datasource
// ---------------------------------------------------------------------------

/// SQLite metadata database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasourceConfig {
    /// Database file; `${ROOT}` is expanded.
    pub path: String,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            path: "${ROOT}/meta/ant_meta.db".to_string(),
        }
    }
}

impl DatasourceConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_root(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote agent installation over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Path (or bare command name resolved via `$PATH`) to the OpenSSH client.
    pub ssh_path: String,
    /// TCP connect timeout handed to the SSH client.
    pub connect_timeout_secs: u64,
    /// Script piped to the remote shell on install.
    pub install_script: String,
    /// Script piped to the remote shell on uninstall.
    pub uninstall_script: String,
    pub install_timeout_secs: u64,
    pub uninstall_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            connect_timeout_secs: 5,
            install_script: "${ROOT}/script/install-server-agent.sh".to_string(),
            uninstall_script: "${ROOT}/script/remove-server-agent.sh".to_string(),
            install_timeout_secs: 10,
            uninstall_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn uninstall_timeout(&self) -> Duration {
        Duration::from_secs(self.uninstall_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Load tool
// ---------------------------------------------------------------------------

/// External load-generation tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Program to execute.
    pub program: String,
    /// Argument template; `{placeholder}` tokens are filled per execution.
    pub args: Vec<String>,
    /// Working directory of the load tool (`${ROOT}` is expanded).
    pub work_dir: String,
    /// Where raw result and metrics files are written (`${ROOT}` is expanded).
    pub result_dir: String,
    /// How long a stop request waits for the process to exit.
    pub stop_grace_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        let args = [
            "-n",
            "-t",
            "{work_dir}/test_plan/default_perf_test.jmx",
            "-l",
            "{result_file}",
            "-JthreadCount={virtual_users}",
            "-JrampTime={ramp_up_secs}",
            "-JloopCount=-1",
            "-Jduration={duration_secs}",
            "-JrampSteps={ramp_up_steps}",
            "-Jprotocol={protocol}",
            "-Jhostname={hostname}",
            "-Jport={port}",
            "-Jpath={path}",
            "-Jmethod={method}",
            "-JbodyData={body}",
            "-JagentHost={agent_hostname}",
            "-JperfmonFile={metrics_file}",
        ];
        Self {
            program: "jmeter".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            work_dir: "${ROOT}/jmeter".to_string(),
            result_dir: "${ROOT}/result".to_string(),
            stop_grace_secs: 10,
        }
    }
}

impl LoadConfig {
    pub fn resolved_work_dir(&self) -> PathBuf {
        expand_root(&self.work_dir)
    }

    pub fn resolved_result_dir(&self) -> PathBuf {
        expand_root(&self.result_dir)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
