//! XAPI Fleet Control - Pool Connection Manager
//!
//! This is the main entry point for the pool manager service.
//! It connects registered pools, reconciles their objects, and serves the
//! admin API.
//!
//! # Environment
//!
//! - `LISTEN_ADDR` - admin API address (default `0.0.0.0:8080`)
//! - `DATA_DIR` - `RocksDB` directory for registrations (default `/data/xapi-fleet`)
//! - `CONFIG_FILE` - optional JSON file with a `ControlConfig`

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xapi_fleet_control::{
    create_router, ControlConfig, Connector, MemoryObjectStore, PoolManager, XapiConnector,
};
use xapi_fleet_session::{HttpTransportFactory, TransportFactory};
use xapi_fleet_store::RocksStore;

fn load_config() -> Result<ControlConfig, Box<dyn std::error::Error>> {
    match std::env::var("CONFIG_FILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let config = serde_json::from_str(&raw)?;
            tracing::info!(path = %path, "Loaded configuration file");
            Ok(config)
        }
        Err(_) => Ok(ControlConfig::default()),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xapi_fleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting XAPI Fleet Control");

    // Load configuration from environment
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "/data/xapi-fleet".to_string());
    let config = load_config()?;

    tracing::info!(
        listen_addr = %listen_addr,
        data_dir = %data_dir,
        event_classes = ?config.event_classes,
        connect_on_start = config.connect_on_start,
        "Configuration loaded"
    );

    // Initialize store
    let store = Arc::new(RocksStore::open(&data_dir)?);
    tracing::info!(data_dir = %data_dir, "Initialized RocksDB store");

    // Initialize pool manager
    let factory: Arc<dyn TransportFactory> = Arc::new(HttpTransportFactory::new(&config.session)?);
    let connector: Arc<dyn Connector> = Arc::new(XapiConnector::new(
        factory,
        config.session.clone(),
        config.event_classes.clone(),
    ));
    let manager = Arc::new(PoolManager::new(
        store,
        connector,
        Arc::new(MemoryObjectStore::new()),
        config,
    ));
    manager.start().await?;

    // Start server
    let app = create_router(Arc::clone(&manager));
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    tracing::info!("Stopped");

    Ok(())
}
