use std::io;
use thiserror::Error;

use crate::role::DeviceRole;

/// The primary error type for the `railprobe-lib` library.
#[derive(Error, Debug)]
pub enum RailError {
    #[error("No usable serial port: {0}")]
    PortUnavailable(String),

    #[error("No identity reply from the fixture: {0}")]
    HandshakeTimeout(String),

    #[error("Port {port} is running the {found} firmware")]
    WrongDevice { port: String, found: DeviceRole },

    #[error("Serial link lost: {0}")]
    LinkLost(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RailError>;
