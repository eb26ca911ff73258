use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use daemonize_process::{Daemon, DaemonConfig, DaemonError, DaemonStatus, LogError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Debug, Clone)]
pub struct DaemonSummary {
    pub name: String,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub status: DaemonStatus,
}

/// Named daemons managed by the agent.
#[derive(Clone, Default)]
pub struct DaemonRegistry {
    config: DaemonConfig,
    inner: Arc<Mutex<BTreeMap<String, Daemon>>>,
}

impl DaemonRegistry {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Daemon> {
        self.inner.lock().await.get(name).cloned()
    }

    pub async fn start(
        &self,
        name: &str,
        command: Vec<String>,
        workdir: &Path,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        if name.trim().is_empty() {
            bail!("daemon name must not be empty");
        }
        if !workdir.is_absolute() {
            bail!("workdir must be an absolute path: {}", workdir.display());
        }

        // Held across the spawn so two starts of one name cannot both win.
        let mut daemons = self.inner.lock().await;
        if let Some(existing) = daemons.get(name) {
            if existing.status().await? == DaemonStatus::Running {
                bail!("daemon {name} is already running");
            }
        }

        let daemon = Daemon::with_config(name, command, workdir, self.config.clone());
        daemon.start(Some(shutdown)).await?;
        daemons.insert(name.to_string(), daemon);
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> anyhow::Result<StopOutcome> {
        let Some(daemon) = self.get(name).await else {
            bail!("daemon {name} not found");
        };

        let status = daemon
            .status()
            .await
            .with_context(|| format!("failed to stop daemon {name}"))?;
        if status != DaemonStatus::Running {
            self.remove_if_same(name, &daemon).await;
            return Ok(StopOutcome::AlreadyStopped);
        }

        match daemon.stop(&CancellationToken::new()).await {
            Ok(()) => {}
            // Exited between the status check and the signal.
            Err(DaemonError::NotRunning) => {
                self.remove_if_same(name, &daemon).await;
                return Ok(StopOutcome::AlreadyStopped);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to stop daemon {name}")),
        }

        self.remove_if_same(name, &daemon).await;
        Ok(StopOutcome::Stopped)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<DaemonSummary>> {
        let daemons: Vec<Daemon> = self.inner.lock().await.values().cloned().collect();

        let mut out = Vec::with_capacity(daemons.len());
        for daemon in daemons {
            let status = daemon
                .status()
                .await
                .with_context(|| format!("failed to get status of daemon {}", daemon.name()))?;
            out.push(DaemonSummary {
                name: daemon.name().to_string(),
                command: daemon.command().to_vec(),
                workdir: daemon.workdir().to_path_buf(),
                status,
            });
        }
        Ok(out)
    }

    /// Takes the last `tail` buffered lines, numbered from 1 within what the
    /// buffer held. Taken lines are removed from the buffer.
    pub async fn logs(&self, name: &str, tail: i64) -> anyhow::Result<Vec<(i64, String)>> {
        let Some(daemon) = self.get(name).await else {
            bail!("daemon {name} not found");
        };
        if tail <= 0 {
            return Ok(Vec::new());
        }

        let logger = daemon.logger();
        let lines = logger.lines().await;
        let offset = (lines - tail.min(lines)).max(0);
        match logger.read_line(offset).await {
            Ok(taken) => Ok(taken
                .into_iter()
                .enumerate()
                .map(|(i, line)| (offset + i as i64 + 1, line))
                .collect()),
            Err(LogError::EndOfData) => Ok(Vec::new()),
        }
    }

    /// Stops every running daemon. Failures are logged, not returned.
    pub async fn shutdown_all(&self) {
        let daemons: Vec<Daemon> = {
            let mut map = self.inner.lock().await;
            std::mem::take(&mut *map).into_values().collect()
        };

        for daemon in daemons {
            match daemon.status().await {
                Ok(DaemonStatus::Stopped) => continue,
                Ok(DaemonStatus::Running) => {}
                Err(e) => {
                    tracing::warn!(name = %daemon.name(), error = %e, "status check failed during shutdown");
                }
            }
            match daemon.stop(&CancellationToken::new()).await {
                Ok(()) | Err(DaemonError::NotRunning) => {
                    tracing::info!(name = %daemon.name(), "daemon stopped on shutdown");
                }
                Err(e) => {
                    tracing::warn!(name = %daemon.name(), error = %e, "failed to stop daemon on shutdown");
                }
            }
        }
    }

    async fn remove_if_same(&self, name: &str, daemon: &Daemon) {
        let mut daemons = self.inner.lock().await;
        if daemons.get(name).is_some_and(|d| d.ptr_eq(daemon)) {
            daemons.remove(name);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> DaemonRegistry {
        DaemonRegistry::new(DaemonConfig::default().grace_period(Duration::from_secs(2)))
    }

    async fn wait_for_lines(registry: &DaemonRegistry, name: &str, n: i64) {
        let daemon = registry.get(name).await.unwrap();
        for _ in 0..200 {
            if daemon.logger().lines().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon {name} never produced {n} lines");
    }

    #[tokio::test]
    async fn start_list_stop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let shutdown = CancellationToken::new();

        registry
            .start("cat", cmd(&["cat"]), dir.path(), shutdown.clone())
            .await
            .unwrap();

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "cat");
        assert_eq!(listed[0].command, vec!["cat".to_string()]);
        assert_eq!(listed[0].status, DaemonStatus::Running);

        let err = registry
            .start("cat", cmd(&["cat"]), dir.path(), shutdown.clone())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "daemon cat is already running");

        assert_eq!(registry.stop("cat").await.unwrap(), StopOutcome::Stopped);
        assert!(registry.list().await.unwrap().is_empty());

        let err = registry.stop("cat").await.unwrap_err();
        assert_eq!(err.to_string(), "daemon cat not found");
    }

    #[tokio::test]
    async fn rejects_bad_arguments() {
        let registry = registry();
        let shutdown = CancellationToken::new();

        let err = registry
            .start("", cmd(&["true"]), Path::new("/"), shutdown.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("name"));

        let err = registry
            .start("rel", cmd(&["true"]), Path::new("relative/dir"), shutdown.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("absolute"));

        let err = registry
            .start("empty", Vec::new(), Path::new("/"), shutdown)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<DaemonError>().is_some());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exited_daemon_is_already_stopped_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let shutdown = CancellationToken::new();

        registry
            .start("once", cmd(&["true"]), dir.path(), shutdown.clone())
            .await
            .unwrap();
        let daemon = registry.get("once").await.unwrap();
        for _ in 0..200 {
            if daemon.status().await.unwrap() == DaemonStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // A stopped entry may be replaced.
        registry
            .start("once", cmd(&["true"]), dir.path(), shutdown.clone())
            .await
            .unwrap();
        assert!(!registry.get("once").await.unwrap().ptr_eq(&daemon));

        let daemon = registry.get("once").await.unwrap();
        for _ in 0..200 {
            if daemon.status().await.unwrap() == DaemonStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            registry.stop("once").await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert!(registry.get("once").await.is_none());
    }

    #[tokio::test]
    async fn logs_take_numbered_tail() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let shutdown = CancellationToken::new();

        registry
            .start(
                "echo",
                cmd(&["sh", "-c", "for i in 1 2 3 4 5; do echo line$i; done; sleep 30"]),
                dir.path(),
                shutdown,
            )
            .await
            .unwrap();
        wait_for_lines(&registry, "echo", 5).await;

        assert!(registry.logs("echo", 0).await.unwrap().is_empty());

        let tail = registry.logs("echo", 2).await.unwrap();
        assert_eq!(
            tail,
            vec![(4, "line4".to_string()), (5, "line5".to_string())]
        );

        // Asking for more than remains returns what is left.
        let rest = registry.logs("echo", 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0], (1, "line1".to_string()));

        assert!(registry.logs("echo", 10).await.unwrap().is_empty());
        assert!(registry.logs("missing", 1).await.is_err());

        registry.stop("echo").await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_all_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let shutdown = CancellationToken::new();

        for name in ["a", "b"] {
            registry
                .start(name, cmd(&["sleep", "30"]), dir.path(), shutdown.clone())
                .await
                .unwrap();
        }
        let a = registry.get("a").await.unwrap();
        let b = registry.get("b").await.unwrap();

        registry.shutdown_all().await;

        assert!(registry.list().await.unwrap().is_empty());
        assert_eq!(a.status().await.unwrap(), DaemonStatus::Stopped);
        assert_eq!(b.status().await.unwrap(), DaemonStatus::Stopped);
    }
}
