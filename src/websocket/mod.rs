//! WebSocket Server Module
//!
//! Bidirectional client transport: unsolicited console/telemetry events
//! flow out through the broadcast hub, typed commands flow in and are
//! dispatched to the serial manager, parser registry, and fusion pool.

pub mod commands;
pub mod server;

// Re-export commonly used types
pub use server::WebSocketServer;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::hub::BroadcastHub;
use crate::parser::ParserRegistry;
use crate::pipeline::Dispatcher;
use crate::serial::SerialManager;

/// Shared handles every connection task needs to service commands.
///
/// All singletons are constructed once at boot and passed by handle; no
/// hidden globals.
pub struct AppState {
    pub serial: SerialManager,
    pub registry: Arc<RwLock<ParserRegistry>>,
    pub hub: Arc<BroadcastHub>,
    pub dispatcher: Arc<Dispatcher>,

    /// Baudrate used when `open_port` does not specify one.
    pub default_baudrate: u32,

    /// Blocking read timeout for serial reader threads.
    pub serial_timeout: Duration,
}
