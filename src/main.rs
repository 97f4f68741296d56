use std::sync::Arc;
use tracing::{error, info, warn, Level};
use transporter::config::Config;
use transporter::rest_server::run_rest_server;
use transporter::transport::Transport;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        return;
    }
    info!("Transporter is shutting down...");
}

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return;
        }
    };

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
    if level.to_string() != config.log_level.to_uppercase() {
        warn!("Unknown log level '{}', using {}", config.log_level, level);
    }

    let transport = match Transport::open(&config).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Failed to open transport configuration: {}", e);
            return;
        }
    };

    if let Err(e) = run_rest_server(transport.clone(), &config.rest_bind, shutdown_signal()).await
    {
        error!("REST API failed: {}", e);
    }

    transport.shutdown().await;
    info!("All services shut down successfully.");
}
