use std::time::Duration;

use crate::log_buffer::DEFAULT_MAX_LINES;

const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;
const DEFAULT_REAP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Signal sent to the process group before escalating to `SIGKILL`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GracefulSignal {
    /// `SIGTERM`. Also reaches background jobs of non-interactive shells,
    /// which start with `SIGINT` ignored.
    #[default]
    Terminate,
    /// `SIGINT`.
    Interrupt,
}

impl GracefulSignal {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "term" | "sigterm" | "terminate" => Some(GracefulSignal::Terminate),
            "int" | "sigint" | "interrupt" => Some(GracefulSignal::Interrupt),
            _ => None,
        }
    }

    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            GracefulSignal::Terminate => libc::SIGTERM,
            GracefulSignal::Interrupt => libc::SIGINT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GracefulSignal::Terminate => "sigterm",
            GracefulSignal::Interrupt => "sigint",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub graceful_signal: GracefulSignal,
    /// How long `stop` waits after the graceful signal before `SIGKILL`.
    pub grace_period: Duration,
    /// Upper bound on waiting for the reap after `SIGKILL`.
    pub reap_timeout: Duration,
    pub log_max_lines: usize,
    /// Output lines longer than this are split across several log lines.
    pub max_line_bytes: usize,
    /// Drop previously buffered output when a stopped daemon is started again.
    pub reset_logs_on_start: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            graceful_signal: GracefulSignal::default(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            reap_timeout: Duration::from_millis(DEFAULT_REAP_TIMEOUT_MS),
            log_max_lines: DEFAULT_MAX_LINES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            reset_logs_on_start: false,
        }
    }
}

impl DaemonConfig {
    /// Defaults overridden by `DAEMONIZE_*` environment variables.
    /// Out-of-range values are clamped, unparsable ones ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let graceful_signal = std::env::var("DAEMONIZE_GRACEFUL_SIGNAL")
            .ok()
            .and_then(|v| GracefulSignal::parse(&v))
            .unwrap_or(defaults.graceful_signal);
        let grace_period = env_u64("DAEMONIZE_GRACE_PERIOD_MS")
            .map(|v| Duration::from_millis(v.clamp(100, 10 * 60 * 1000)))
            .unwrap_or(defaults.grace_period);
        let reap_timeout = env_u64("DAEMONIZE_REAP_TIMEOUT_MS")
            .map(|v| Duration::from_millis(v.clamp(100, 10 * 60 * 1000)))
            .unwrap_or(defaults.reap_timeout);
        let log_max_lines = env_usize("DAEMONIZE_LOG_MAX_LINES")
            .map(|v| v.clamp(16, 1_000_000))
            .unwrap_or(defaults.log_max_lines);
        let max_line_bytes = env_usize("DAEMONIZE_MAX_LINE_BYTES")
            .map(|v| v.clamp(256, 16 * 1024 * 1024))
            .unwrap_or(defaults.max_line_bytes);
        let reset_logs_on_start =
            env_bool("DAEMONIZE_RESET_LOGS_ON_START").unwrap_or(defaults.reset_logs_on_start);

        Self {
            graceful_signal,
            grace_period,
            reap_timeout,
            log_max_lines,
            max_line_bytes,
            reset_logs_on_start,
        }
    }

    pub fn graceful_signal(mut self, signal: GracefulSignal) -> Self {
        self.graceful_signal = signal;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    pub fn log_max_lines(mut self, max: usize) -> Self {
        self.log_max_lines = max;
        self
    }

    pub fn max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn reset_logs_on_start(mut self, reset: bool) -> Self {
        self.reset_logs_on_start = reset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.graceful_signal, GracefulSignal::Terminate);
        assert_eq!(cfg.grace_period, Duration::from_secs(10));
        assert_eq!(cfg.log_max_lines, 1024);
        assert_eq!(cfg.max_line_bytes, 64 * 1024);
        assert!(!cfg.reset_logs_on_start);
    }

    #[test]
    fn graceful_signal_parsing() {
        assert_eq!(GracefulSignal::parse("SIGINT"), Some(GracefulSignal::Interrupt));
        assert_eq!(GracefulSignal::parse(" term "), Some(GracefulSignal::Terminate));
        assert_eq!(GracefulSignal::parse("hup"), None);
        assert_eq!(GracefulSignal::Interrupt.as_raw(), libc::SIGINT);
    }
}
