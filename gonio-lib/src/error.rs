use std::io;
use thiserror::Error;

use crate::session::SessionState;

/// The primary error type for the `gonio-lib` crate.
#[derive(Error, Debug)]
pub enum GonioError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SessionState),

    #[error("Trajectory needs {expected} coefficients per axis, got x={x} y={y}")]
    InvalidArity { expected: usize, x: usize, y: usize },

    #[error("Telemetry frame #{frame} looks malformed: {message}")]
    FrameDecodeAnomaly { frame: u64, message: String },

    #[error("Unknown command opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Invalid frame length for {opcode}: expected {expected} bytes, got {actual}")]
    InvalidFrameLength {
        opcode: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid jog direction code {0}")]
    InvalidDirection(i32),

    #[error("Unknown jog direction '{0}' (expected up, down, left or right)")]
    InvalidDirectionName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout during socket operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}
