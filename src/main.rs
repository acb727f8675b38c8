use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use docsync::{SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(
    about = "Real-time synchronization server for structured document workspaces",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch document roots and serve change notifications over WebSocket
    Serve {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "docsync.json")]
        config: PathBuf,

        /// Override the server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Document root(s) to watch, overriding the config file
        #[arg(long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            port,
            roots,
        } => serve(config, port, roots).await,
    }
}

async fn serve(config_path: PathBuf, port: Option<u16>, roots: Vec<PathBuf>) -> Result<()> {
    let mut config = SyncConfig::load_or_default(&config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    if !roots.is_empty() {
        config.roots = roots;
    }

    let engine = SyncEngine::start(config)?;
    let port = engine.config().port;

    for root in engine.registry().roots() {
        let marker = if root.watched {
            "👁".green()
        } else {
            "⚠".yellow()
        };
        println!("{} {}", marker, root.path.display().to_string().bright_white());
    }

    // Shutdown fires on ctrl-c or POST /shutdown.
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        }
    });

    docsync::server::serve(port, engine.hub(), shutdown_rx, shutdown_tx).await?;

    println!("{}", "Shutting down...".bright_cyan());
    if let Err(err) = engine.shutdown().await {
        eprintln!("{} {}", "⚠".yellow(), err);
    }
    println!("{} Goodbye", "✓".green());
    Ok(())
}
