use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::protocol::{codes, JsonRpcRequest, JsonRpcResponse, McpServer};
use crate::services::ConnectionManager;
use crate::tools::ToolRegistry;

/// Speak the protocol over stdin/stdout, one JSON message per line.
///
/// Requests are dispatched concurrently; a writer task serializes the
/// responses back onto stdout. Diagnostics go to stderr only.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let manager = Arc::new(ConnectionManager::new(&config));
    let registry = Arc::new(ToolRegistry::new(manager.clone()));
    let server = Arc::new(McpServer::new(registry));

    let shutdown = CancellationToken::new();
    super::spawn_init_retry(manager.clone(), shutdown.clone());

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = response_rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &response).await {
                log::error!("failed to write response: {e}");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    log::info!("stdio transport ready");

    let shutdown_fut = super::shutdown_signal();
    tokio::pin!(shutdown_fut);
    loop {
        tokio::select! {
            _ = &mut shutdown_fut => {
                log::info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcRequest>(line) {
                            Ok(request) => {
                                let server = server.clone();
                                let response_tx = response_tx.clone();
                                tokio::spawn(async move {
                                    if let Some(response) = server.handle(request).await {
                                        let _ = response_tx.send(response);
                                    }
                                });
                            }
                            Err(e) => {
                                let _ = response_tx.send(JsonRpcResponse::error(
                                    Value::Null,
                                    codes::PARSE_ERROR,
                                    format!("Parse error: {e}"),
                                ));
                            }
                        }
                    }
                    Ok(None) => {
                        log::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        log::error!("failed to read stdin: {e}");
                        break;
                    }
                }
            }
        }
    }

    shutdown.cancel();
    drop(response_tx);
    let _ = writer.await;
    manager.close().await;
    Ok(())
}

async fn write_line(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    stdout.write_all(&payload).await?;
    stdout.flush().await
}
