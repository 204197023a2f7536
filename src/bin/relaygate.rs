//! relaygate CLI - runs the gateway described by a YAML configuration file

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use relaygate::{CodecRegistry, Gateway, GatewayConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(version, about = "Bounded HTTP/WebSocket gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Path to the gateway configuration (overrides RELAYGATE_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address host (overrides the config file and RELAYGATE_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides the config file and RELAYGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate a configuration without starting anything
    Validate {
        /// Path to the gateway configuration (overrides RELAYGATE_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config, host, port } => serve(config, host, port),
        Commands::Validate { config } => validate(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn config_path(config: Option<PathBuf>) -> PathBuf {
    config
        .or_else(|| std::env::var("RELAYGATE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/gateway.yaml"))
}

fn load(config: Option<PathBuf>) -> Result<GatewayConfig, String> {
    let path = config_path(config);
    GatewayConfig::load_from_file(&path).map_err(|e| format!("{}", e))
}

fn validate(config: Option<PathBuf>) -> Result<(), String> {
    let path = config_path(config.clone());
    println!("Validating {}...", path.display());

    let config = load(config)?;
    config
        .validate(&CodecRegistry::default())
        .map_err(|e| format!("Invalid configuration: {}", e))?;

    println!("  {} HTTP sources", config.http_sources.len());
    println!("  {} WebSocket sources", config.websocket_sources.len());
    println!("  {} HTTP sinks", config.http_sinks.len());
    println!("  {} WebSocket sinks", config.websocket_sinks.len());
    println!("Configuration is valid");
    Ok(())
}

fn serve(config: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<(), String> {
    let mut config = load(config)?;

    if let Some(host) = host.or_else(|| std::env::var("RELAYGATE_HOST").ok()) {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    } else if let Ok(port) = std::env::var("RELAYGATE_PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| format!("Invalid RELAYGATE_PORT: {}", port))?;
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| format!("Invalid listen address: {}", e))?;

    let gateway = Gateway::from_config(&config, &CodecRegistry::default()).map_err(|e| e.to_string())?;
    for source in config.http_sources.iter().map(|s| &s.channel).chain(config.websocket_sources.iter().map(|s| &s.channel)) {
        let consumed = config.http_sinks.iter().any(|sink| &sink.channel == source)
            || config.websocket_sinks.iter().any(|sink| &sink.channel == source);
        if !consumed {
            tracing::warn!("Channel '{}' has no sink, its sources will reject every message", source);
        }
    }

    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start runtime: {}", e))?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
        gateway
            .serve(listener, shutdown_signal())
            .await
            .map_err(|e| e.to_string())
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
