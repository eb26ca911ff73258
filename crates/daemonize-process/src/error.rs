use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon not running")]
    NotRunning,

    #[error("command line must not be empty")]
    EmptyCommand,

    #[error("failed to start daemon {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("pgid: {0}")]
    ProcessGroup(#[source] io::Error),

    #[error("{signal}: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("daemon {name} is not running: {source}")]
    Liveness {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("daemon {name} exited with error: exit status {code}")]
    AbnormalExit { name: String, code: i32 },

    #[error("daemon {name} exited with error: {reason}")]
    WaitFailed { name: String, reason: String },

    #[error("graceful shutdown timed out after {}ms", .0.as_millis())]
    GracefulTimeout(Duration),

    #[error("stop cancelled by caller; process group killed")]
    Cancelled,

    #[error("process did not exit within {}ms after SIGKILL", .0.as_millis())]
    ReapTimeout(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("end of log data")]
    EndOfData,
}
