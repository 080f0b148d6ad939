//! Load tool process launcher.
//!
//! Spawns the configured load tool for one execution and monitors it. The
//! tool runs in its own process group so a stop reaches the JVM behind the
//! wrapper script as well. A natural exit is reported on the completion
//! channel; a requested stop is reported to the caller of [`RunHandle::stop`].

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{metrics_file, result_file, ExecutionConfig};
use crate::config::LoadConfig;

/// Extra time [`RunHandle::stop`] allows the monitor beyond the grace period.
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// How a load tool run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own.
    Exited { code: Option<i32> },
    /// A stop was requested and the process exited within the grace period.
    Stopped,
    /// A stop was requested and the process had to be force-killed, or the
    /// monitor never confirmed the exit.
    Unconfirmed,
    /// Waiting on the process failed.
    WaitFailed(String),
}

impl RunOutcome {
    /// Failure reason to record, or `None` for a clean finish.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            RunOutcome::Exited { code: Some(0) } | RunOutcome::Stopped => None,
            RunOutcome::Exited { code: Some(code) } => Some(format!("load tool exited with code {}", code)),
            RunOutcome::Exited { code: None } => Some("load tool was killed by a signal".to_string()),
            RunOutcome::Unconfirmed => {
                Some("load tool did not exit within the stop grace period and was killed".to_string())
            }
            RunOutcome::WaitFailed(e) => Some(format!("lost track of the load tool: {}", e)),
        }
    }
}

/// Posted when a load tool exits without being asked to.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub test_key: String,
    pub outcome: RunOutcome,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to prepare result directory {path}: {source}")]
    ResultDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn load tool '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Control handle for one running load tool.
pub struct RunHandle {
    pub test_key: String,
    pub pid: Option<u32>,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<RunOutcome>,
    grace: Duration,
}

impl RunHandle {
    /// Ask the process to stop and wait for the monitor's verdict.
    ///
    /// If the process already exited on its own, that outcome is returned.
    pub async fn stop(self) -> RunOutcome {
        if self.shutdown_tx.send(()).is_err() {
            debug!(test_key = %self.test_key, "monitor already finished");
        }

        let mut join = self.join;
        match tokio::time::timeout(self.grace + STOP_MARGIN, &mut join).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(test_key = %self.test_key, error = %e, "load tool monitor panicked");
                RunOutcome::WaitFailed(e.to_string())
            }
            Err(_) => {
                warn!(test_key = %self.test_key, "load tool monitor did not report back, aborting it");
                join.abort();
                RunOutcome::Unconfirmed
            }
        }
    }
}

pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    result_dir: PathBuf,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &LoadConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            work_dir: config.resolved_work_dir(),
            result_dir: config.resolved_result_dir(),
            grace: config.stop_grace(),
        }
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    /// Fill the argument template for `config`.
    pub fn render_args(&self, config: &ExecutionConfig) -> Vec<String> {
        let vars = self.vars(config);
        self.args.iter().map(|a| render(a, &vars)).collect()
    }

    fn vars(&self, config: &ExecutionConfig) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("test_key", config.test_key.clone()),
            ("work_dir", self.work_dir.to_string_lossy().into_owned()),
            (
                "result_file",
                result_file(&self.result_dir, &config.test_key)
                    .to_string_lossy()
                    .into_owned(),
            ),
            (
                "metrics_file",
                metrics_file(&self.result_dir, &config.test_key)
                    .to_string_lossy()
                    .into_owned(),
            ),
            ("virtual_users", config.profile.virtual_users.to_string()),
            ("ramp_up_secs", config.profile.ramp_up_secs.to_string()),
            ("ramp_up_steps", config.profile.ramp_up_steps.to_string()),
            ("duration_secs", config.profile.duration_secs.to_string()),
            ("protocol", config.target.protocol.clone()),
            ("hostname", config.target.hostname.clone()),
            ("port", config.target.port.to_string()),
            ("path", config.http.path.clone()),
            ("method", config.http.method.clone()),
            ("body", config.http.body.clone()),
            ("agent_hostname", config.agent_hostname.clone().unwrap_or_default()),
        ])
    }

    /// Spawn the load tool for `config` and start monitoring it.
    ///
    /// Stale result files for the key are removed first. Tool stdout and
    /// stderr go to `<result_dir>/<key>_tool.log`.
    pub fn launch(
        &self,
        config: &ExecutionConfig,
        events: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Result<RunHandle, LaunchError> {
        let key = config.test_key.clone();
        self.prepare_result_dir(&key)
            .map_err(|source| LaunchError::ResultDir {
                path: self.result_dir.clone(),
                source,
            })?;

        let log_path = self.result_dir.join(format!("{}_tool.log", key));
        let log_err = |source: std::io::Error| LaunchError::ResultDir {
            path: log_path.clone(),
            source,
        };
        let stdout_log = File::create(&log_path).map_err(log_err)?;
        let stderr_log = stdout_log.try_clone().map_err(log_err)?;

        let args = self.render_args(config);
        debug!(test_key = %key, program = %self.program, ?args, "spawning load tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(test_key = %key, pid, "load tool started");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let grace = self.grace;
        let task_key = key.clone();

        let join = tokio::spawn(async move {
            tokio::pin!(shutdown_rx);

            let outcome = tokio::select! {
                biased;

                Ok(()) = &mut shutdown_rx => {
                    info!(test_key = %task_key, "stop requested, terminating load tool");
                    terminate_child(&mut child, grace).await
                }

                status = child.wait() => {
                    let outcome = match status {
                        Ok(exit) => RunOutcome::Exited { code: exit.code() },
                        Err(e) => RunOutcome::WaitFailed(e.to_string()),
                    };
                    info!(test_key = %task_key, ?outcome, "load tool exited");
                    if events
                        .send(CompletionEvent {
                            test_key: task_key.clone(),
                            outcome: outcome.clone(),
                        })
                        .is_err()
                    {
                        warn!(test_key = %task_key, "completion channel closed, exit not recorded");
                    }
                    outcome
                }
            };

            debug!(test_key = %task_key, pid, "load tool monitor finished");
            outcome
        });

        Ok(RunHandle {
            test_key: key,
            pid,
            shutdown_tx,
            join,
            grace,
        })
    }

    fn prepare_result_dir(&self, test_key: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.result_dir)?;
        for stale in [
            result_file(&self.result_dir, test_key),
            metrics_file(&self.result_dir, test_key),
        ] {
            match std::fs::remove_file(&stale) {
                Ok(()) => debug!(path = %stale.display(), "removed stale result file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Replace `{name}` tokens found in `vars`; anything else is kept verbatim.
fn render(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => match vars.get(&after[..close]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            },
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Terminate the tool's process group: SIGTERM, wait `grace`, then SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration) -> RunOutcome {
    signal_group(child, Signal::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "load tool exited after SIGTERM");
            RunOutcome::Stopped
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for load tool after SIGTERM");
            RunOutcome::WaitFailed(e.to_string())
        }
        Err(_) => {
            warn!(?grace, "load tool did not exit after SIGTERM, sending SIGKILL");
            signal_group(child, Signal::Kill);
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL load tool");
            }
            RunOutcome::Unconfirmed
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn signal_group(child: &mut Child, signal: Signal) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let sig = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // The child leads its own process group.
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "load tool already gone");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::test_support::request;
    use chrono::Utc;

    fn launcher(dir: &Path, script: &str, grace: Duration) -> ProcessLauncher {
        ProcessLauncher {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            work_dir: dir.to_path_buf(),
            result_dir: dir.join("result"),
            grace,
        }
    }

    fn config(key: &str) -> ExecutionConfig {
        request(Some(key)).into_config(key.to_string(), Utc::now())
    }

    #[test]
    fn test_render_args_fills_placeholders() {
        let l = ProcessLauncher::new(&LoadConfig {
            work_dir: "/opt/jmeter".to_string(),
            result_dir: "/data/result".to_string(),
            ..LoadConfig::default()
        });
        let args = l.render_args(&config("T1"));

        assert!(args.contains(&"/opt/jmeter/test_plan/default_perf_test.jmx".to_string()));
        assert!(args.contains(&"/data/result/T1_result.csv".to_string()));
        assert!(args.contains(&"-JthreadCount=10".to_string()));
        assert!(args.contains(&"-Jhostname=10.0.0.20".to_string()));
        assert!(args.contains(&"-Jmethod=POST".to_string()));
        assert!(args.contains(&"-JagentHost=".to_string()));
        assert!(args.iter().all(|a| !a.contains("{result_file}")));
    }

    #[test]
    fn test_render_keeps_unknown_and_body_braces() {
        let vars = BTreeMap::from([("hostname", "h".to_string()), ("body", "{\"a\":\"{port}\"}".to_string())]);
        assert_eq!(render("x={hostname}", &vars), "x=h");
        assert_eq!(render("{body}", &vars), "{\"a\":\"{port}\"}");
        assert_eq!(render("{nope}-{hostname}", &vars), "{nope}-h");
        assert_eq!(render("tail{", &vars), "tail{");
    }

    #[tokio::test]
    async fn test_natural_exit_posts_completion() {
        let dir = tempfile::tempdir().unwrap();
        let l = launcher(dir.path(), "echo running; exit 0", Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = l.launch(&config("T1"), tx).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.test_key, "T1");
        assert_eq!(event.outcome, RunOutcome::Exited { code: Some(0) });

        let log = std::fs::read_to_string(dir.path().join("result/T1_tool.log")).unwrap();
        assert_eq!(log.trim(), "running");
    }

    #[tokio::test]
    async fn test_failing_exit_has_reason() {
        let dir = tempfile::tempdir().unwrap();
        let l = launcher(dir.path(), "exit 2", Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = l.launch(&config("T1"), tx).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.outcome, RunOutcome::Exited { code: Some(2) });
        assert_eq!(
            event.outcome.failure_reason().as_deref(),
            Some("load tool exited with code 2")
        );
    }

    #[tokio::test]
    async fn test_stop_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let l = launcher(dir.path(), "sleep 30", Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = l.launch(&config("T1"), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.stop().await, RunOutcome::Stopped);

        // a requested stop is not a natural completion
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_ignoring_sigterm_is_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let l = launcher(dir.path(), "trap '' TERM; sleep 30", Duration::from_millis(300));
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = l.launch(&config("T1"), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        assert_eq!(handle.stop().await, RunOutcome::Unconfirmed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_after_natural_exit_returns_exit() {
        let dir = tempfile::tempdir().unwrap();
        let l = launcher(dir.path(), "exit 0", Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = l.launch(&config("T1"), tx).unwrap();
        rx.recv().await.unwrap();
        assert_eq!(handle.stop().await, RunOutcome::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_stale_results_removed_and_spawn_errors_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result_dir = dir.path().join("result");
        std::fs::create_dir_all(&result_dir).unwrap();
        std::fs::write(result_dir.join("T1_result.csv"), "old").unwrap();

        let mut l = launcher(dir.path(), "exit 0", Duration::from_secs(1));
        l.program = dir.path().join("no-such-tool").to_string_lossy().into_owned();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = l.launch(&config("T1"), tx).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(!result_dir.join("T1_result.csv").exists());
    }
}
