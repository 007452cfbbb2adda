//! Command-line interface for launchkit.
//!
//! `serve` speaks JSON lines over stdin/stdout: one request per line, one
//! response per line, requests handled concurrently and matched by `id`.
//! The other commands are one-shot tooling around the same services.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::Api;
use crate::config::{self, ResolvedConfig};
use crate::core::{JsonKeyFile, JsonLaunchStore, KeyPool, LaunchCoordinator};

/// launchkit - vanity key pool and launch worker coordinator
#[derive(Parser, Debug)]
#[command(name = "launchkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve JSON-line requests on stdin, answering on stdout
    Serve,

    /// Handle a single JSON request and print the response
    Call {
        /// Request document, e.g. '{"action":"pool_stats"}'
        request: String,
    },

    /// Show key pool counts for the configured snapshot
    Keys,

    /// List dependent wallets stored for a launch
    Snipers {
        /// Mint identifier
        mint_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve => serve().await,
            Commands::Call { request } => call(&request).await,
            Commands::Keys => show_keys(),
            Commands::Snipers { mint_id } => list_snipers(&mint_id).await,
            Commands::Config => show_config(),
        }
    }
}

/// Wire the pool, store and coordinator from configuration
pub fn build_api(cfg: &ResolvedConfig) -> Result<Api> {
    let pool = KeyPool::from_source(&JsonKeyFile::new(&cfg.keys))
        .with_context(|| format!("Failed to load vanity keys from {}", cfg.keys.display()))?;
    let store = Arc::new(JsonLaunchStore::new(&cfg.store));
    let coordinator = LaunchCoordinator::new(store, cfg.coordinator.clone())?;

    Ok(Api::new(Arc::new(pool), coordinator))
}

/// JSON-lines request loop
async fn serve() -> Result<()> {
    let api = Arc::new(build_api(config::config()?)?);
    info!(stats = ?api.pool().stats(), "Serving requests on stdin");

    serve_stream(api, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

/// Answer each request line of `input` on `output` until EOF.
///
/// Before returning, waits for in-flight requests and for every funding
/// worker they started, then closes the pool.
pub async fn serve_stream<R, W>(api: Arc<Api>, input: R, output: W) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    // Single writer keeps response lines whole
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(response) = rx.recv().await {
            let mut line = response.to_string();
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(output)
    });

    let mut lines = BufReader::new(input).split(b'\n');
    let mut in_flight = JoinSet::new();

    while let Some(line) = lines.next_segment().await.context("Failed to read request")? {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        let api = Arc::clone(&api);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = api.handle_bytes(&line).await;
            if tx.send(response).is_err() {
                warn!("Response writer is gone");
            }
        });

        // Reap finished requests as we go
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    api.drain().await;
    drop(tx);

    let output = writer
        .await
        .context("Response writer panicked")?
        .context("Failed to write response")?;

    api.pool().shutdown();
    Ok(output)
}

/// One request, printed as pretty JSON
async fn call(request: &str) -> Result<()> {
    let api = build_api(config::config()?)?;
    let response = api.handle_line(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    // A funding worker outlives its answer; keep the runtime up until its
    // batch is stored
    api.drain().await;
    Ok(())
}

fn show_keys() -> Result<()> {
    let source = JsonKeyFile::new(&config::config()?.keys);
    let stats = KeyPool::from_source(&source)?.stats();

    println!("Snapshot: {}", source.path().display());
    println!("  Total:     {}", stats.total);
    println!("  Available: {}", stats.available);
    println!("  Pending:   {}", stats.pending);
    println!("  Used:      {}", stats.used);
    Ok(())
}

async fn list_snipers(mint_id: &str) -> Result<()> {
    let api = build_api(config::config()?)?;
    let dependents = api.coordinator().dependents_for(mint_id).await?;

    if dependents.is_empty() {
        println!("No dependent wallets stored for {}", mint_id);
        return Ok(());
    }

    println!("{} dependent wallet(s) for {}:", dependents.len(), mint_id);
    for (idx, wallet) in dependents.iter().enumerate() {
        println!("  {:>3}. {}", idx + 1, wallet.public_key);
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("launchkit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Keys:  {}", cfg.keys.display());
    println!("  Store: {}", cfg.store.display());
    println!();
    println!("Workers:");
    let workers = [
        ("Launch", &cfg.coordinator.launch_worker),
        ("Wallet", &cfg.coordinator.wallet_worker),
    ];
    for (name, worker) in workers {
        if worker.args.is_empty() {
            println!("  {}: {}", name, worker.program);
        } else {
            println!("  {}: {} {}", name, worker.program, worker.args.join(" "));
        }
    }
    println!();
    println!("Status pattern: {}", cfg.coordinator.status_pattern);
    println!("Explorer:       {}", cfg.coordinator.explorer_tx_url);

    Ok(())
}
