//! Error types for adsburn.

use std::io;
use thiserror::Error;

/// Result type for adsburn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for adsburn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Bluetooth stack error.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Invalid audio image file.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol error (malformed response, exhausted retries).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No usable dongle attached to the host.
    #[error("No dongle found")]
    NoDongle,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
