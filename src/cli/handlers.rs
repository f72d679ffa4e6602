use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cli::commands::{GenerateCommand, ServeCommand};
use crate::config::Settings;
use crate::engine::{InferenceBackend, ScriptedBackend};
use crate::error::{codes, RequestError};
use crate::manager::SessionManager;
use crate::rpc::{NativeBridge, Rejection, RpcCall, RpcReply};

fn default_backend() -> Arc<dyn InferenceBackend> {
    Arc::new(ScriptedBackend::new())
}

/// Stream each prompt's response to stdout.
pub async fn handle_generate(settings: Settings, cmd: GenerateCommand) -> Result<()> {
    let manager = SessionManager::new(default_backend(), settings);
    let ack = manager
        .create_default_model()
        .await
        .context("Failed to create model")?;
    info!("{}", ack);

    let mut stdout = tokio::io::stdout();
    for (turn, prompt) in cmd.prompts.iter().enumerate() {
        if cmd.fresh && turn > 0 {
            manager.reset_session().await.context("Failed to reset session")?;
        }

        let mut handle = manager.generate_response(prompt.as_str())?;
        while let Some(delta) = handle.next_partial().await {
            if !cmd.json {
                stdout.write_all(delta.as_bytes()).await?;
                stdout.flush().await?;
            }
        }

        let response = handle.finish().await?;
        if cmd.json {
            stdout
                .write_all(serde_json::to_string(&response)?.as_bytes())
                .await?;
        }
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    let stats = manager.stats();
    debug!(
        "Generated {} responses ({} errored)",
        stats.completed, stats.errored
    );
    manager.close_engine().await.context("Failed to close engine")?;
    Ok(())
}

/// JSON-lines bridge: one [`RpcCall`] per stdin line; replies and events are
/// written to stdout as they occur.
pub async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    let manager = Arc::new(SessionManager::new(default_backend(), settings));
    let bridge = NativeBridge::new(Arc::clone(&manager));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &line).await {
                error!("Failed to write to stdout: {}", e);
                break;
            }
        }
    });

    let mut events = bridge.events();
    let events_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if events_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        }
    });

    if cmd.preload {
        let ack = manager
            .create_default_model()
            .await
            .context("Failed to preload model")?;
        info!("{}", ack);
    }

    info!("Serving bridge on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut calls = JoinSet::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcCall>(&line) {
                    Ok(call) => {
                        let bridge = bridge.clone();
                        let reply_tx = out_tx.clone();
                        calls.spawn(async move {
                            let reply = bridge.handle_call(call).await;
                            send_reply(&reply_tx, &reply);
                        });
                    }
                    Err(e) => {
                        let reply = RpcReply {
                            id: 0,
                            result: None,
                            error: Some(Rejection::new(codes::INVALID_ARGUMENT, e.to_string())),
                        };
                        send_reply(&out_tx, &reply);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
        }
    }

    drain_calls(&manager, &mut calls, interrupted).await;
    if let Err(e) = manager.close_engine().await {
        warn!("Engine close failed during shutdown: {}", e);
    }

    forwarder.abort();
    let _ = forwarder.await;
    drop(out_tx);
    writer.await.context("stdout writer task failed")?;
    Ok(())
}

/// Wait for outstanding calls. An interrupt fails in-flight generations first.
async fn drain_calls(manager: &SessionManager, calls: &mut JoinSet<()>, interrupted: bool) {
    if interrupted {
        manager.router().abort_all(RequestError::Closed).await;
    }
    while let Some(joined) = calls.join_next().await {
        if let Err(e) = joined {
            warn!("RPC task failed: {}", e);
        }
    }
}

fn send_reply(tx: &mpsc::UnboundedSender<String>, reply: &RpcReply) {
    match serde_json::to_string(reply) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => error!("Failed to encode reply {}: {}", reply.id, e),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
