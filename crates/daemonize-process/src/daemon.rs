use std::{
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    DaemonStatus, ExitOutcome,
    config::DaemonConfig,
    error::DaemonError,
    log_buffer::LogBuffer,
    signal,
};

/// Handle on one spawned process. `exited` fires once the waiter has reaped it.
#[derive(Clone, Debug)]
struct Run {
    generation: u64,
    pid: u32,
    exited: CancellationToken,
}

#[derive(Debug, Default)]
struct State {
    run: Option<Run>,
    exit: Option<ExitOutcome>,
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    name: String,
    command: Vec<String>,
    workdir: PathBuf,
    config: DaemonConfig,
    logger: LogBuffer,
    state: Mutex<State>,
    // Held for the whole of `stop`, so concurrent stops queue up.
    stop_lock: Mutex<()>,
}

/// A named background command running in its own process group.
///
/// Clones share the same process handle and log buffer.
#[derive(Clone, Debug)]
pub struct Daemon {
    inner: Arc<Inner>,
}

fn classify(res: io::Result<ExitStatus>) -> ExitOutcome {
    match res {
        Ok(status) => {
            if let Some(sig) = status.signal() {
                ExitOutcome::Signaled(sig)
            } else if status.success() {
                ExitOutcome::Exited
            } else {
                ExitOutcome::Failed {
                    code: status.code().unwrap_or(-1),
                }
            }
        }
        Err(e) => ExitOutcome::WaitFailed(e.to_string()),
    }
}

impl Daemon {
    pub fn new(name: impl Into<String>, command: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self::with_config(name, command, workdir, DaemonConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        config: DaemonConfig,
    ) -> Self {
        let logger = LogBuffer::with_max_lines(config.log_max_lines);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                command,
                workdir: workdir.into(),
                config,
                logger,
                state: Mutex::new(State::default()),
                stop_lock: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    pub fn workdir(&self) -> &Path {
        &self.inner.workdir
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> &LogBuffer {
        &self.inner.logger
    }

    /// True when both handles refer to the same daemon.
    pub fn ptr_eq(&self, other: &Daemon) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pid of the current run, if a handle is held.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.state.lock().await.run.as_ref().map(|r| r.pid)
    }

    /// Outcome of the most recent run that has finished, if any.
    pub async fn last_exit(&self) -> Option<ExitOutcome> {
        self.inner.state.lock().await.exit.clone()
    }

    /// Spawns the command as a new process group leader.
    ///
    /// The child's lifetime is independent of `cancel`; when given, a watcher
    /// task calls [`Daemon::stop`] once the token fires (unless the process
    /// has already exited by then).
    pub async fn start(&self, cancel: Option<CancellationToken>) -> Result<(), DaemonError> {
        let inner = &self.inner;
        let Some((program, args)) = inner.command.split_first() else {
            return Err(DaemonError::EmptyCommand);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&inner.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // A failed spawn leaves the previous handle and the logs untouched.
        let mut state = inner.state.lock().await;
        let spawn_err = |source| DaemonError::Spawn {
            name: inner.name.clone(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(io::Error::other("spawned process has no pid")))?;

        if let Some(prev) = state.run.take()
            && !prev.exited.is_cancelled()
        {
            tracing::warn!(
                name = %inner.name,
                pid = prev.pid,
                "start called while a previous run is live; abandoning its handle"
            );
        }
        if inner.config.reset_logs_on_start {
            inner.logger.clear().await;
        }

        if let Some(out) = child.stdout.take() {
            self.spawn_output_pump(out);
        }
        if let Some(err) = child.stderr.take() {
            self.spawn_output_pump(err);
        }

        state.generation = state.generation.saturating_add(1);
        state.exit = None;
        let run = Run {
            generation: state.generation,
            pid,
            exited: CancellationToken::new(),
        };
        state.run = Some(run.clone());
        drop(state);

        tracing::info!(
            name = %inner.name,
            pid,
            command = ?inner.command,
            workdir = %inner.workdir.display(),
            "daemon started"
        );

        // Waiter: sole owner of the child, so the process is reaped exactly once.
        let daemon = self.clone();
        let exited = run.exited.clone();
        let generation = run.generation;
        tokio::spawn(async move {
            let outcome = classify(child.wait().await);
            let name = &daemon.inner.name;
            match &outcome {
                ExitOutcome::Exited => tracing::info!(name = %name, pid, "daemon exited successfully"),
                ExitOutcome::Signaled(sig) => {
                    tracing::debug!(name = %name, pid, signal = sig, "daemon stopped by signal")
                }
                ExitOutcome::Failed { code } => {
                    tracing::error!(name = %name, pid, code, "daemon exited with error")
                }
                ExitOutcome::WaitFailed(reason) => {
                    tracing::error!(name = %name, pid, error = %reason, "waiting for daemon failed")
                }
            }
            {
                let mut state = daemon.inner.state.lock().await;
                if state.generation == generation {
                    state.exit = Some(outcome);
                }
            }
            exited.cancel();
        });

        if let Some(cancel) = cancel {
            let daemon = self.clone();
            let exited = run.exited.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = exited.cancelled() => {
                        tracing::debug!(name = %daemon.inner.name, "daemon already stopped");
                    }
                    _ = cancel.cancelled() => daemon.stop_on_cancel(generation).await,
                }
            });
        }

        Ok(())
    }

    fn spawn_output_pump<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logger = self.inner.logger.clone();
        let max_line = self.inner.config.max_line_bytes.max(1) as u64;
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                // Longer lines are split into chunks of at most `max_line` bytes.
                let mut limited = (&mut reader).take(max_line);
                match limited.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        logger.write(&buf).await;
                    }
                }
            }
        });
    }

    async fn stop_on_cancel(&self, generation: u64) {
        let name = &self.inner.name;
        {
            let state = self.inner.state.lock().await;
            if state.run.as_ref().map(|r| r.generation) != Some(generation) {
                return;
            }
        }
        match self.status().await {
            Ok(DaemonStatus::Stopped) => {
                tracing::debug!(name = %name, "daemon already stopped");
                return;
            }
            Ok(DaemonStatus::Running) => {}
            Err(e) => tracing::error!(name = %name, error = %e, "failed to get daemon status"),
        }
        // The caller's token has already fired; give the child its full grace period.
        match self.stop(&CancellationToken::new()).await {
            Ok(()) => tracing::info!(name = %name, "daemon stopped successfully"),
            Err(e) => tracing::error!(name = %name, error = %e, "failed to stop daemon"),
        }
    }

    /// Stops the process group: graceful signal first, `SIGKILL` when `cancel`
    /// fires or the grace period runs out.
    ///
    /// On every path that escalates, the waiter is awaited (bounded by
    /// `reap_timeout`) before returning, so no zombie is left behind.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), DaemonError> {
        let inner = &self.inner;
        let _stopping = inner.stop_lock.lock().await;

        let run = {
            let mut state = inner.state.lock().await;
            let run = state.run.clone().ok_or(DaemonError::NotRunning)?;
            // Reaped already: the pid may belong to someone else by now.
            if run.exited.is_cancelled() {
                state.run = None;
                return Err(DaemonError::NotRunning);
            }
            run
        };

        let pgid = signal::process_group(run.pid).map_err(DaemonError::ProcessGroup)?;

        let graceful = inner.config.graceful_signal;
        signal::kill_group_tolerant(pgid, graceful.as_raw()).map_err(|source| {
            DaemonError::Signal {
                signal: graceful.name(),
                source,
            }
        })?;
        tracing::info!(
            name = %inner.name,
            pid = run.pid,
            pgid,
            signal = graceful.name(),
            "sent graceful signal to process group"
        );

        let grace = inner.config.grace_period;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!(name = %inner.name, pgid, "stop cancelled by caller; killing process group");
                self.kill_and_reap(pgid, &run).await.and(Err(DaemonError::Cancelled))
            }
            _ = run.exited.cancelled() => {
                let exit = inner.state.lock().await.exit.clone();
                exit.map_or(Ok(()), |outcome| outcome.into_result(&inner.name))
            }
            _ = tokio::time::sleep(grace) => {
                tracing::warn!(
                    name = %inner.name,
                    pgid,
                    grace_ms = grace.as_millis() as u64,
                    "graceful shutdown timed out; killing process group"
                );
                self.kill_and_reap(pgid, &run).await.and(Err(DaemonError::GracefulTimeout(grace)))
            }
        };

        if run.exited.is_cancelled() {
            let mut state = inner.state.lock().await;
            if state.run.as_ref().map(|r| r.generation) == Some(run.generation) {
                state.run = None;
            }
        }

        result
    }

    async fn kill_and_reap(&self, pgid: i32, run: &Run) -> Result<(), DaemonError> {
        signal::kill_group_tolerant(pgid, libc::SIGKILL).map_err(|source| DaemonError::Signal {
            signal: signal::signal_name(libc::SIGKILL),
            source,
        })?;

        let timeout = self.inner.config.reap_timeout;
        if tokio::time::timeout(timeout, run.exited.cancelled())
            .await
            .is_err()
        {
            tracing::error!(
                name = %self.inner.name,
                pid = run.pid,
                "process not reaped after SIGKILL"
            );
            return Err(DaemonError::ReapTimeout(timeout));
        }
        Ok(())
    }

    /// Checks the process group without waiting on the child.
    ///
    /// A handle whose process is gone is dropped here, so the next `stop`
    /// reports [`DaemonError::NotRunning`]. An `Err` means the state could not
    /// be confirmed and should be read as stopped.
    pub async fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let mut state = self.inner.state.lock().await;
        let Some((pid, reaped)) = state
            .run
            .as_ref()
            .map(|r| (r.pid, r.exited.is_cancelled()))
        else {
            return Ok(DaemonStatus::Stopped);
        };
        if reaped {
            state.run = None;
            return Ok(DaemonStatus::Stopped);
        }

        let pgid = match signal::process_group(pid) {
            Ok(pgid) => pgid,
            Err(e) if signal::is_no_such_process(&e) => {
                state.run = None;
                return Ok(DaemonStatus::Stopped);
            }
            Err(e) => return Err(DaemonError::ProcessGroup(e)),
        };

        match signal::kill_group(pgid, 0) {
            Ok(()) => Ok(DaemonStatus::Running),
            Err(e) if signal::is_no_such_process(&e) => {
                state.run = None;
                Ok(DaemonStatus::Stopped)
            }
            Err(source) => Err(DaemonError::Liveness {
                name: self.inner.name.clone(),
                source,
            }),
        }
    }
}
