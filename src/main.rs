use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden::config::Config;
use warden::config_validator::ConfigValidator;
use warden::server::Server;

/// User management API with in-process request governance
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Address to bind, overrides BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// SQLite database file, overrides DATABASE_PATH
    #[arg(long)]
    database: Option<String>,

    /// Log level, overrides LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // Load configuration from environment
    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    ConfigValidator::validate(&config)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("warden={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting warden service");
    tracing::info!(
        "Configuration: bind_addr={}, database_path={}, max_connections={}, slot_policy={:?}",
        config.bind_addr,
        config.database_path,
        config.max_connections,
        config.slot_policy
    );

    // Create and run the server
    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
