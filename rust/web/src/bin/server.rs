//! Standalone game server binary
//!
//! Usage: cargo run -p gametable-web --bin gametable-server

use clap::Parser;
use std::path::PathBuf;

use gametable_web::{ServerConfig, ServerSettings, StorageBackendKind, WebServer};

/// Gametable server - hosts board game sessions over HTTP and WebSocket
#[derive(Parser, Debug)]
#[command(name = "gametable-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Storage backend: memory or durable
    #[arg(long)]
    storage: Option<String>,

    /// Database path for the durable backend
    #[arg(long)]
    storage_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gametable_web::init_logging();

    let args = Args::parse();

    let mut settings = ServerSettings::from_env()?;
    if let Some(storage) = &args.storage {
        settings.storage_backend = match storage.as_str() {
            "memory" => StorageBackendKind::Memory,
            "durable" => StorageBackendKind::Durable,
            other => {
                eprintln!("Error: --storage must be `memory` or `durable`, got `{other}`");
                std::process::exit(1);
            }
        };
    }
    if let Some(path) = args.storage_path {
        settings.storage_path = Some(path);
    }
    settings.validate()?;

    let config = ServerConfig::new(args.host, args.port);
    tracing::info!(
        host = config.host(),
        port = config.port(),
        backend = ?settings.storage_backend,
        "starting gametable server"
    );

    let server = WebServer::new(config, settings)?;
    let handle = server.start().await?;
    println!("Server running at http://{}", handle.address());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    handle.shutdown().await?;
    println!("Server stopped cleanly");

    Ok(())
}
