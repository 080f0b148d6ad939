//! Monitoring agent install / uninstall on target hosts.
//!
//! Install runs the install script over SSH and registers the agent. A
//! deadline on install is expected (the script keeps the agent running in
//! the foreground) and is logged, not failed. Uninstall is strict: any remote
//! error leaves the registry untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{expand_root, RemoteConfig};
use crate::remote::{RemoteError, RemoteExecutor, RemoteTarget};
use crate::storage::{AgentRecord, AgentRegistry, NewAgent};

/// Install request as received from callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstallRequest {
    pub pem_key_path: String,
    pub username: String,
    pub public_ip: String,
}

impl AgentInstallRequest {
    fn validate(&self) -> Result<(), AgentError> {
        let fields = [
            ("pemKeyPath", &self.pem_key_path),
            ("username", &self.username),
            ("publicIp", &self.public_ip),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(AgentError::Invalid {
                    field,
                    reason: "must not be blank".to_string(),
                });
            }
        }
        for (field, value) in [("username", &self.username), ("publicIp", &self.public_ip)] {
            if value.starts_with('-') || value.chars().any(|c| c.is_whitespace() || c == '@') {
                return Err(AgentError::Invalid {
                    field,
                    reason: "contains characters not allowed in an ssh destination".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("agent {0} not found")]
    NotFound(i64),

    #[error("failed to read script {path}: {source}")]
    Script {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("agent registry error: {0:#}")]
    Registry(anyhow::Error),
}

pub struct AgentService {
    registry: AgentRegistry,
    executor: Arc<dyn RemoteExecutor>,
    install_script: PathBuf,
    uninstall_script: PathBuf,
    install_timeout: Duration,
    uninstall_timeout: Duration,
}

impl AgentService {
    pub fn new(registry: AgentRegistry, executor: Arc<dyn RemoteExecutor>, config: &RemoteConfig) -> Self {
        Self {
            registry,
            executor,
            install_script: expand_root(&config.install_script),
            uninstall_script: expand_root(&config.uninstall_script),
            install_timeout: config.install_timeout(),
            uninstall_timeout: config.uninstall_timeout(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Install the agent on `req.public_ip` and return the new record id.
    pub async fn install(&self, req: &AgentInstallRequest) -> Result<i64, AgentError> {
        req.validate()?;

        let target = RemoteTarget {
            host: req.public_ip.trim().to_string(),
            username: req.username.trim().to_string(),
            key_path: PathBuf::from(req.pem_key_path.trim()),
        };
        let script = read_script(&self.install_script).await?;

        info!(host = %target.host, user = %target.username, "installing agent");
        match self.executor.run(&target, &script, self.install_timeout).await {
            Ok(output) => {
                info!(host = %target.host, output = %output.combined(), "agent install script finished");
            }
            Err(RemoteError::DeadlineExceeded { timeout, output }) => {
                warn!(
                    host = %target.host,
                    ?timeout,
                    output = %output.combined(),
                    "agent install session hit its deadline; treating as installed"
                );
            }
            Err(e) => {
                let output = e.output().map(|o| o.combined()).unwrap_or_default();
                error!(host = %target.host, error = %e, %output, "agent install failed");
                return Err(e.into());
            }
        }

        let existing = self
            .registry
            .count_for_host(&target.host)
            .map_err(AgentError::Registry)?;
        if existing > 0 {
            warn!(host = %target.host, existing, "host already has agent records; registering another");
        }

        let id = self
            .registry
            .save(&NewAgent {
                public_ip: target.host,
                username: target.username,
                pem_key_path: target.key_path.to_string_lossy().into_owned(),
            })
            .map_err(AgentError::Registry)?;

        info!(agent_id = id, "agent registered");
        Ok(id)
    }

    /// Run the uninstall script for agent `id`, then delete its record.
    ///
    /// If the delete fails after the remote side already ran, the record is
    /// left behind; drop it with [`AgentService::forget`].
    pub async fn uninstall(&self, id: i64) -> Result<(), AgentError> {
        let record = self
            .registry
            .get(id)
            .map_err(AgentError::Registry)?
            .ok_or(AgentError::NotFound(id))?;

        let target = RemoteTarget {
            host: record.public_ip.clone(),
            username: record.username.clone(),
            key_path: PathBuf::from(&record.pem_key_path),
        };
        let script = read_script(&self.uninstall_script).await?;

        info!(agent_id = id, host = %target.host, "uninstalling agent");
        match self.executor.run(&target, &script, self.uninstall_timeout).await {
            Ok(output) => {
                info!(agent_id = id, output = %output.combined(), "agent uninstall script finished");
            }
            Err(e) => {
                let output = e.output().map(|o| o.combined()).unwrap_or_default();
                error!(agent_id = id, error = %e, %output, "agent uninstall failed; record kept");
                return Err(e.into());
            }
        }

        self.registry.delete(id).map_err(|e| {
            error!(agent_id = id, error = %e, "remote uninstall done but record delete failed");
            AgentError::Registry(e)
        })?;
        info!(agent_id = id, "agent removed");
        Ok(())
    }

    /// Delete the record for agent `id` without contacting its host.
    pub fn forget(&self, id: i64) -> Result<(), AgentError> {
        let record = self
            .registry
            .get(id)
            .map_err(AgentError::Registry)?
            .ok_or(AgentError::NotFound(id))?;
        self.registry.delete(id).map_err(AgentError::Registry)?;
        warn!(
            agent_id = id,
            host = %record.public_ip,
            "agent record deleted without running the uninstall script"
        );
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<AgentRecord>, AgentError> {
        self.registry.list().map_err(AgentError::Registry)
    }
}

async fn read_script(path: &Path) -> Result<String, AgentError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AgentError::Script {
            path: path.to_path_buf(),
            source,
        })
}


#[cfg(test)]
mod tests {
    use super::test_support::{scripts, FakeExecutor, Scripted};
    use super::*;
    use crate::storage::test_support::temp_pool;

    fn request() -> AgentInstallRequest {
        AgentInstallRequest {
            pem_key_path: "/keys/target.pem".to_string(),
            username: "ubuntu".to_string(),
            public_ip: "10.0.0.30".to_string(),
        }
    }

    fn service(reply: Scripted) -> (tempfile::TempDir, Arc<FakeExecutor>, AgentService) {
        let (dir, pool) = temp_pool();
        let fake = FakeExecutor::new(reply);
        let config = scripts(dir.path());
        let svc = AgentService::new(AgentRegistry::new(pool), fake.clone(), &config);
        (dir, fake, svc)
    }

    #[tokio::test]
    async fn test_install_persists_record() {
        let (_dir, fake, svc) = service(Scripted::Succeed);

        let id = svc.install(&request()).await.unwrap();
        let record = svc.registry().get(id).unwrap().unwrap();
        assert_eq!(record.public_ip, "10.0.0.30");
        assert_eq!(record.pem_key_path, "/keys/target.pem");

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "#!/bin/bash\necho install\n");
        assert_eq!(calls[0].2, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_install_absorbs_deadline() {
        let (_dir, _fake, svc) = service(Scripted::Deadline);

        let id = svc.install(&request()).await.unwrap();
        assert!(svc.registry().get(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_install_other_errors_persist_nothing() {
        for reply in [Scripted::SessionFailure, Scripted::ScriptFailure] {
            let (_dir, _fake, svc) = service(reply);
            let err = svc.install(&request()).await.unwrap_err();
            assert!(matches!(err, AgentError::Remote(_)));
            assert!(svc.list().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_install_rejects_blank_and_option_like_fields() {
        let (_dir, fake, svc) = service(Scripted::Succeed);

        let mut req = request();
        req.username = "  ".to_string();
        assert!(matches!(
            svc.install(&req).await,
            Err(AgentError::Invalid { field: "username", .. })
        ));

        let mut req = request();
        req.public_ip = "-oProxyCommand=x".to_string();
        assert!(matches!(
            svc.install(&req).await,
            Err(AgentError::Invalid { field: "publicIp", .. })
        ));

        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reinstall_same_host_creates_second_record() {
        let (_dir, _fake, svc) = service(Scripted::Succeed);
        let a = svc.install(&request()).await.unwrap();
        let b = svc.install(&request()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(svc.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_uninstall_deletes_after_remote_success() {
        let (_dir, fake, svc) = service(Scripted::Succeed);
        let id = svc.install(&request()).await.unwrap();

        svc.uninstall(id).await.unwrap();
        assert!(svc.registry().get(id).unwrap().is_none());

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[1].1, "#!/bin/bash\necho remove\n");
        assert_eq!(calls[1].0.host, "10.0.0.30");
    }

    #[tokio::test]
    async fn test_uninstall_remote_error_keeps_record() {
        let (_dir, fake, svc) = service(Scripted::Succeed);
        let id = svc.install(&request()).await.unwrap();

        for reply in [Scripted::Deadline, Scripted::SessionFailure] {
            fake.set(reply);
            assert!(svc.uninstall(id).await.is_err());
            assert!(svc.registry().get(id).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_uninstall_unknown_agent() {
        let (_dir, fake, svc) = service(Scripted::Succeed);
        assert!(matches!(svc.uninstall(77).await, Err(AgentError::NotFound(77))));
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_after_uninstall_can_be_forgotten() {
        let (dir, pool) = temp_pool();
        let fake = FakeExecutor::new(Scripted::Succeed);
        let config = scripts(dir.path());
        let svc = AgentService::new(AgentRegistry::new(pool.clone()), fake.clone(), &config);
        let id = svc.install(&request()).await.unwrap();

        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_delete BEFORE DELETE ON agent_install_info
                 BEGIN SELECT RAISE(ABORT, 'locked'); END;",
            )
            .unwrap();
        assert!(matches!(svc.uninstall(id).await, Err(AgentError::Registry(_))));
        assert!(svc.registry().get(id).unwrap().is_some());
        assert_eq!(fake.calls.lock().unwrap().len(), 2);

        pool.get()
            .unwrap()
            .execute_batch("DROP TRIGGER block_delete;")
            .unwrap();
        svc.forget(id).unwrap();
        assert!(svc.registry().get(id).unwrap().is_none());
        assert_eq!(fake.calls.lock().unwrap().len(), 2);

        assert!(matches!(svc.forget(id), Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_script_is_reported() {
        let (dir, pool) = temp_pool();
        let fake = FakeExecutor::new(Scripted::Succeed);
        let config = RemoteConfig {
            install_script: dir.path().join("nope.sh").to_string_lossy().into_owned(),
            ..RemoteConfig::default()
        };
        let svc = AgentService::new(AgentRegistry::new(pool), fake.clone(), &config);

        assert!(matches!(svc.install(&request()).await, Err(AgentError::Script { .. })));
        assert!(fake.calls.lock().unwrap().is_empty());
    }
}
