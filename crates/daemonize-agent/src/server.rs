//! Runs the MCP service over a byte stream until the peer hangs up or the
//! shutdown token fires.

use anyhow::Context;
use rmcp::ServiceExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::tools::DaemonizeMcp;

pub async fn serve<R, W>(
    reader: R,
    writer: W,
    handler: DaemonizeMcp,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let running = tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested before the client initialized");
            return Ok(());
        }
        running = handler.serve((reader, writer)) => {
            running.map_err(|e| anyhow::anyhow!("mcp initialize failed: {e}"))?
        }
    };
    tracing::info!("mcp session initialized");

    let session = running.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.cancelled().await;
        tracing::info!("shutdown requested; closing mcp session");
        session.cancel();
    });

    let quit = running.waiting().await;
    watcher.abort();
    let reason = quit.context("mcp service task failed")?;
    tracing::info!(reason = ?reason, "mcp session ended");
    Ok(())
}
