//! Remote command execution on agent hosts.

pub mod ssh;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use self::ssh::SshExecutor;

/// Where and as whom to run a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub username: String,
    /// Private key used to authenticate.
    pub key_path: PathBuf,
}

/// Captured stdout and stderr of a remote script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    /// stdout followed by stderr, for log lines.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The session outlived its deadline and was closed. Callers decide
    /// whether that is fatal; agent install treats it as success.
    #[error("remote session exceeded its {timeout:?} deadline")]
    DeadlineExceeded {
        timeout: Duration,
        output: RemoteOutput,
    },

    #[error("private key {path} is unusable: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("could not open a session to {host}: {detail}")]
    Session { host: String, detail: String },

    #[error("remote script exited with code {code:?}")]
    ScriptFailed {
        code: Option<i32>,
        output: RemoteOutput,
    },

    #[error("failed to run the ssh client: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whatever the script printed before the failure, if anything.
    pub fn output(&self) -> Option<&RemoteOutput> {
        match self {
            RemoteError::DeadlineExceeded { output, .. } | RemoteError::ScriptFailed { output, .. } => {
                Some(output)
            }
            RemoteError::InvalidKey { .. } | RemoteError::Session { .. } | RemoteError::Io(_) => None,
        }
    }
}

/// Runs a script on a remote host within a deadline.
///
/// Implementations must close the session on every exit path.
#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, RemoteError>;
}
