//! Single-threaded cooperative event loop (spec.md §4.5).
//!
//! Runs on a current-thread tokio runtime so accepting connections,
//! dispatching requests, and running handler completions are true
//! cooperative tasks on one OS thread — session state needs no locks because
//! nothing outside its own task ever touches it. On SIGINT/SIGTERM it stops
//! accepting, broadcasts shutdown to every session over a `watch` channel,
//! and awaits each session task so every handler's `close()` runs before the
//! reactor itself returns.

use std::sync::Arc;

use nbd_backend::Registry;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub async fn run(address: &str, port: u16, registry: Arc<Registry>, max_errors: u32) -> anyhow::Result<()> {
    let listener = TcpListener::bind((address, port)).await?;
    info!("nbd-server listening on {address}:{port}");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("accepted connection from {peer}");
                        let registry = Arc::clone(&registry);
                        let shutdown_rx = shutdown_rx.clone();
                        sessions.push(tokio::spawn(async move {
                            crate::session::run(stream, peer, registry, max_errors, shutdown_rx).await;
                        }));
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping reactor");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, stopping reactor");
                break;
            }
        }
    }

    drop(listener);
    let _ = shutdown_tx.send(());
    for session in sessions {
        let _ = session.await;
    }
    Ok(())
}
