//! Supervision of long-running background commands.
//!
//! A [`Daemon`] launches a command as the leader of its own process group,
//! pipes its stdout/stderr into a bounded [`LogBuffer`], and stops the whole
//! group with a graceful signal that escalates to `SIGKILL`.

mod config;
mod daemon;
mod error;
mod log_buffer;
mod signal;

pub use config::{DaemonConfig, GracefulSignal};
pub use daemon::Daemon;
pub use error::{DaemonError, LogError};
pub use log_buffer::{DEFAULT_MAX_LINES, LogBuffer};

use std::fmt;

/// Lifecycle state as reported by [`Daemon::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Running,
    Stopped,
}

impl DaemonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonStatus::Running => "running",
            DaemonStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one run, recorded by the waiter task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitOutcome {
    /// Exited with code 0.
    Exited,
    /// Killed by a signal. Counted as clean: it is how `stop` ends a run.
    Signaled(i32),
    Failed { code: i32 },
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Exited | ExitOutcome::Signaled(_))
    }

    pub(crate) fn into_result(self, name: &str) -> Result<(), DaemonError> {
        match self {
            ExitOutcome::Exited | ExitOutcome::Signaled(_) => Ok(()),
            ExitOutcome::Failed { code } => Err(DaemonError::AbnormalExit {
                name: name.to_string(),
                code,
            }),
            ExitOutcome::WaitFailed(reason) => Err(DaemonError::WaitFailed {
                name: name.to_string(),
                reason,
            }),
        }
    }
}
