//! OpenSSH client wrapper -- spawn `ssh`, pipe the script, enforce the deadline.
//!
//! The script is fed to `bash -s` on the remote side over stdin, so nothing
//! has to be copied to the host first. The child is spawned `kill_on_drop`;
//! killing it tears the session down.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RemoteError, RemoteExecutor, RemoteOutput, RemoteTarget};
use crate::config::RemoteConfig;

/// Exit status OpenSSH reserves for its own failures (connect, auth, ...).
const SSH_CLIENT_FAILURE: i32 = 255;

/// How long to wait for the output pipes to drain once the child is gone.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

pub struct SshExecutor {
    ssh_path: String,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            ssh_path: config.ssh_path.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    fn args(&self, target: &RemoteTarget) -> Vec<String> {
        vec![
            "-i".to_string(),
            target.key_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-l".to_string(),
            target.username.clone(),
            "--".to_string(),
            target.host.clone(),
            "bash".to_string(),
            "-s".to_string(),
        ]
    }
}

/// Make sure `path` holds something that looks like a private key before a
/// session is attempted.
pub async fn check_private_key(path: &Path) -> Result<(), RemoteError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| RemoteError::InvalidKey {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if !contents.contains("PRIVATE KEY-----") {
        return Err(RemoteError::InvalidKey {
            path: path.to_path_buf(),
            reason: "no PEM or OpenSSH private key block".to_string(),
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, RemoteError> {
        check_private_key(&target.key_path).await?;

        debug!(host = %target.host, user = %target.username, ssh = %self.ssh_path, "opening ssh session");

        let mut child = Command::new(&self.ssh_path)
            .args(self.args(target))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("ssh stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ssh stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("ssh stderr was not captured"))?;

        let stdout_task = spawn_reader(stdout);
        let stderr_task = spawn_reader(stderr);

        let waited = tokio::time::timeout(timeout, async {
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                // The client may exit before reading everything (e.g. auth failure).
                debug!(error = %e, "ssh closed stdin early");
            }
            drop(stdin);
            child.wait().await
        })
        .await;

        match waited {
            Err(_) => {
                warn!(host = %target.host, ?timeout, "remote session deadline exceeded, closing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill ssh client");
                }
                let output = drain(stdout_task, stderr_task).await;
                Err(RemoteError::DeadlineExceeded { timeout, output })
            }
            Ok(Err(e)) => {
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "ssh client already gone");
                }
                drain(stdout_task, stderr_task).await;
                Err(RemoteError::Io(e))
            }
            Ok(Ok(status)) => {
                let output = drain(stdout_task, stderr_task).await;
                if status.success() {
                    Ok(output)
                } else if status.code() == Some(SSH_CLIENT_FAILURE) {
                    Err(RemoteError::Session {
                        host: target.host.clone(),
                        detail: output.stderr.trim().to_string(),
                    })
                } else {
                    Err(RemoteError::ScriptFailed {
                        code: status.code(),
                        output,
                    })
                }
            }
        }
    }
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "error reading ssh output");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn drain(stdout: JoinHandle<String>, stderr: JoinHandle<String>) -> RemoteOutput {
    RemoteOutput {
        stdout: join_output(stdout).await,
        stderr: join_output(stderr).await,
    }
}

async fn join_output(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}
