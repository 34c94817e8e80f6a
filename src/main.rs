//! Ground Station Telemetry Backend
//!
//! Real-time telemetry pipeline for a rocket ground station: reads
//! framed records from serial ports, decodes and unit-normalizes them,
//! enriches inertial records with a sensor-fusion orientation estimate,
//! and fans the results out to WebSocket subscribers.

use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod error;
mod fusion;
mod hub;
mod models;
mod parser;
mod pipeline;
mod serial;
mod websocket;

use fusion::FusionConfig;
use hub::BroadcastHub;
use parser::ParserRegistry;
use pipeline::Dispatcher;
use serial::SerialManager;
use websocket::{AppState, WebSocketServer};

/// Application configuration
#[derive(Debug, Clone)]
struct Config {
    /// WebSocket server port
    ws_port: u16,
    /// Baudrate for ports opened without an explicit one
    default_baudrate: u32,
    /// Blocking read timeout for serial reader threads
    serial_timeout: Duration,
    /// Frames buffered per subscriber before it counts as backlogged
    subscriber_queue: usize,
    /// Sensor fusion defaults, reconfigurable at runtime
    fusion: FusionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            default_baudrate: 9600,
            serial_timeout: Duration::from_secs(1),
            subscriber_queue: 256,
            fusion: FusionConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groundstation_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("🚀 Starting Ground Station Telemetry Backend");

    let config = Config::default();
    info!("📋 Configuration: {:?}", config);

    // Pipeline singletons, constructed once and passed by handle
    let registry = Arc::new(RwLock::new(ParserRegistry::default()));
    registry.write().unwrap().add_callback(|record| {
        tracing::debug!(fields = record.len(), "record parsed");
    });
    let hub = Arc::new(BroadcastHub::new(config.subscriber_queue));
    let dispatcher = Arc::new(Dispatcher::new(hub.clone(), registry.clone(), config.fusion));

    let state = Arc::new(AppState {
        serial: SerialManager::new(),
        registry,
        hub: hub.clone(),
        dispatcher,
        default_baudrate: config.default_baudrate,
        serial_timeout: config.serial_timeout,
    });

    let server = WebSocketServer::new(config.ws_port, state.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("❌ WebSocket server error: {}", e);
        }
    });

    info!("✅ All systems operational");
    info!("🌐 WebSocket server listening on ws://127.0.0.1:{}", config.ws_port);

    // Run until the server dies or we get a shutdown signal
    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
    }

    // Stop readers first so nothing publishes into a closing hub
    if let Err(e) = state.serial.close_all_ports() {
        error!("Error closing serial ports: {}", e);
    }
    hub.close();

    info!("🛑 Shutting down gracefully");
    Ok(())
}
