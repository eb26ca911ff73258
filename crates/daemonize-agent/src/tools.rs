//! The four `daemonize_*` MCP tools over a [`DaemonRegistry`].

use std::path::Path;

use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::registry::{DaemonRegistry, StopOutcome};

pub const SERVER_NAME: &str = "Daemonize";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StartArgs {
    /// Name of the daemon
    pub name: String,
    /// Command to run
    pub command: Vec<String>,
    /// Working directory of the daemon in absolute path
    pub workdir: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopArgs {
    /// Name of the daemon
    pub name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LogsArgs {
    /// Name of the daemon
    pub name: String,
    /// Number of lines to read from the end of the log
    pub tail: i64,
}

/// Joins an error chain with `": "`, skipping causes whose text an outer
/// layer already carries.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if let Some(last) = parts.last_mut() {
            if last.contains(s.as_str()) {
                continue;
            }
            if s.starts_with(last.as_str()) {
                *last = s;
                continue;
            }
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

fn text_result(text: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(text.into())]))
}

fn error_result(text: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::error(vec![Content::text(text.into())]))
}

#[derive(Clone)]
pub struct DaemonizeMcp {
    registry: DaemonRegistry,
    /// Fires when the agent shuts down; every started daemon watches it.
    shutdown: CancellationToken,
    tool_router: ToolRouter<DaemonizeMcp>,
}

impl DaemonizeMcp {
    pub fn new(registry: DaemonRegistry, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            shutdown,
            tool_router: Self::tool_router(),
        }
    }

    pub fn registry(&self) -> &DaemonRegistry {
        &self.registry
    }
}

#[tool_router]
impl DaemonizeMcp {
    #[tool(name = "daemonize_start", description = "Start a daemon")]
    async fn start(
        &self,
        Parameters(args): Parameters<StartArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        let StartArgs {
            name,
            command,
            workdir,
        } = args;
        match self
            .registry
            .start(&name, command, Path::new(&workdir), self.shutdown.clone())
            .await
        {
            Ok(()) => text_result("Daemon started successfully"),
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "daemonize_start failed");
                let e = e.context(format!("failed to start daemon {name}"));
                error_result(format_error_chain(&e))
            }
        }
    }

    #[tool(name = "daemonize_stop", description = "Stop a daemon")]
    async fn stop(&self, Parameters(args): Parameters<StopArgs>) -> Result<CallToolResult, ErrorData> {
        match self.registry.stop(&args.name).await {
            Ok(StopOutcome::Stopped) => text_result("Daemon stopped successfully"),
            Ok(StopOutcome::AlreadyStopped) => text_result("Daemon already stopped"),
            Err(e) => {
                tracing::warn!(name = %args.name, error = %e, "daemonize_stop failed");
                error_result(format_error_chain(&e))
            }
        }
    }

    #[tool(name = "daemonize_list", description = "List running daemons")]
    async fn list(&self) -> Result<CallToolResult, ErrorData> {
        let daemons = match self.registry.list().await {
            Ok(v) => v,
            Err(e) => return error_result(format_error_chain(&e)),
        };
        if daemons.is_empty() {
            return text_result("No daemons running");
        }

        let mut out = String::from("Running daemons:\n");
        for d in daemons {
            out.push_str(&format!(
                "  - {}[{}]:[{}]: {}\n",
                d.name,
                d.command.join(" "),
                d.workdir.display(),
                d.status
            ));
        }
        text_result(out)
    }

    #[tool(name = "daemonize_logs", description = "Get logs of a daemon")]
    async fn logs(&self, Parameters(args): Parameters<LogsArgs>) -> Result<CallToolResult, ErrorData> {
        if args.tail < 0 {
            return error_result("tail parameter must be non-negative");
        }

        let lines = match self.registry.logs(&args.name, args.tail).await {
            Ok(v) => v,
            Err(e) => return error_result(format_error_chain(&e)),
        };
        if lines.is_empty() {
            return text_result("No logs available");
        }

        let mut out = String::from("Daemon logs:\n");
        for (n, line) in lines {
            out.push_str(&format!("  {n}: {line}\n"));
        }
        text_result(out)
    }
}

#[tool_handler]
impl ServerHandler for DaemonizeMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
