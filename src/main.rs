//! nt-relay daemon and maintenance commands.
//!
//! See the `nt_relay` library for the core functionality.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use nt_relay::{server, AccumulationBuffer, Bridge, Config, NetworkTable};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "nt-relay")]
#[command(version)]
#[command(about = "Relay NetworkTables telemetry into a durable, drainable buffer")]
struct Cli {
    /// JSON config file (defaults plus NT_RELAY_* env when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the peer and serve the HTTP API until Ctrl-C/SIGTERM
    Run,
    /// Read-and-clear one buffered topic and print it
    Take {
        /// Buffer topic
        topic: String,
    },
    /// Delete every buffered topic
    Clear,
    /// Print the effective configuration
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("NT_RELAY_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Take { topic } => {
            let buffer = open_buffer(&config.database_path)?;
            match buffer.read_and_clear(&topic)? {
                Some(value) => {
                    println!("{value}");
                    Ok(())
                }
                None => {
                    eprintln!("No buffered data for '{topic}'");
                    std::process::exit(1);
                }
            }
        }
        Commands::Clear => {
            let cleared = open_buffer(&config.database_path)?.clear_all()?;
            println!("Cleared {cleared} topic(s)");
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn open_buffer(path: &Path) -> Result<AccumulationBuffer> {
    AccumulationBuffer::open(path).with_context(|| format!("Failed to open buffer {}", path.display()))
}

async fn run(config: &Config) -> Result<()> {
    let bridge = Bridge::start(config)?;
    if !NetworkTable::install_default(Arc::clone(bridge.table())) {
        log::warn!("Default table already installed");
    }

    let server = server::build_server(
        Arc::clone(bridge.table()),
        Arc::clone(bridge.buffer()),
        &config.listen_host,
        config.listen_port,
    )?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => log::error!("HTTP server failed: {}", e),
                Err(e) => log::error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        () = shutdown_signal() => {
            log::info!("Shutdown signal received, stopping");
            server_handle.stop(true).await;
        }
    }

    bridge.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
