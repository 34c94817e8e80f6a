//! Error taxonomy for the telemetry pipeline
//!
//! Per-line and per-field failures recover locally, command failures
//! surface in the response envelope, transport failures detach the
//! affected subscriber. None of these may take down the event loop.

use thiserror::Error;

/// Errors raised by the sensor fusion engine.
///
/// A fusion failure never suppresses the telemetry record; the record is
/// published without orientation fields instead.
#[derive(Debug, Error)]
pub enum FusionError {
    /// A sensor sample contained NaN or infinite components.
    #[error("non-finite sensor input")]
    NonFiniteInput,

    /// The orientation state diverged; the quaternion has been reset.
    #[error("orientation state diverged")]
    Diverged,
}

/// Errors raised by serial port operations.
#[derive(Debug, Error)]
pub enum SerialError {
    /// The requested port has no open connection.
    #[error("port {0} is not open")]
    PortNotOpen(String),

    /// The underlying serial driver reported a failure.
    #[error(transparent)]
    Driver(#[from] serialport::Error),

    /// A read or write on the port failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invalid command arguments surfaced back to the requesting client.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named parser is not registered.
    #[error("parser not found: {0}")]
    UnknownParser(String),
}
