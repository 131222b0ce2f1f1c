//! Transport adapter: serves the pipeline over newline-delimited JSON
//! on stdin/stdout. Logs go to stderr so stdout stays a clean protocol
//! channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use fleetscout::pipeline::{Pipeline, Request};
use fleetscout::scout::Scout;
use fleetscout::{Config, ScoutError, SshPool, StaticInventory};

#[derive(Parser)]
#[command(name = "fleetscout", about = "SSH fleet inspection service")]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted, except
    /// known_hosts_path, which must always be configured.
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON host inventory (array of host records).
    #[arg(long)]
    hosts: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cfg = Arc::new(match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    });
    let inventory = Arc::new(StaticInventory::from_file(&cli.hosts).await?);
    info!(hosts = inventory.len(), "inventory loaded");

    let pool = SshPool::new(&cfg)?;
    let scout = Scout::with_pool(Arc::clone(&cfg), inventory, Arc::clone(&pool));
    let pipeline = Arc::new(Pipeline::new(cfg, scout));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                cancel.cancel();
            }
        });
    }
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    if term.recv().await.is_some() {
                        info!("termination signal received");
                        cancel.cancel();
                    }
                }
                Err(e) => warn!(err = %e, "cannot install SIGTERM handler"),
            }
        });
    }

    serve(pipeline, cancel).await?;
    pool.shutdown().await;
    Ok(())
}

/// One JSON request per line in, one JSON response per line out.
/// Requests run concurrently; responses are serialized by a writer
/// task.
async fn serve(pipeline: Arc<Pipeline>, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                warn!("stdout closed, dropping responses");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let pipeline = Arc::clone(&pipeline);
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let response = respond(&pipeline, &line, &cancel).await;
                    let _ = tx.send(response.to_string()).await;
                });
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn respond(
    pipeline: &Pipeline,
    line: &str,
    cancel: &CancellationToken,
) -> serde_json::Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return Pipeline::error_envelope(&ScoutError::validation(format!(
                "invalid request: {e}"
            )))
        }
    };
    let id = req.id.clone();
    let mut envelope = match pipeline.handle(&req, cancel).await {
        Ok(result) => json!({ "result": result }),
        Err(e) => Pipeline::error_envelope(&e),
    };
    if let Some(id) = id {
        envelope["id"] = id;
    }
    envelope
}
