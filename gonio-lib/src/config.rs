use crate::error::GonioError;
use crate::telemetry::DecodeMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2137;

/// Connection settings for a [`Session`](crate::Session).
///
/// Missing JSON fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// How long `stop` waits for the receive task before aborting it.
    pub stop_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub decode_mode: DecodeMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 3000,
            write_timeout_ms: 2000,
            stop_timeout_ms: 1000,
            read_chunk_size: 1024,
            decode_mode: DecodeMode::Permissive,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GonioError> {
        let txt = fs::read_to_string(path)?;
        Self::from_json(&txt)
    }

    pub fn from_json(txt: &str) -> Result<Self, GonioError> {
        let mut cfg: SessionConfig = serde_json::from_str(txt)?;
        if cfg.read_chunk_size == 0 {
            cfg.read_chunk_size = Self::default().read_chunk_size;
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
