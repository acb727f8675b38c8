//! Server configuration: JSON file with full defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Configuration for the sync engine and its server.
///
/// Every field has a default, so an empty `{}` config file (or none at
/// all) yields a working setup once at least one root is supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Document roots to watch.
    pub roots: Vec<PathBuf>,

    /// Extensions of managed document files (without the dot).
    pub include_extensions: Vec<String>,

    /// Quiet window for coalescing rapid edits, in milliseconds.
    pub quiet_window_ms: u64,

    /// Port for the WebSocket/control server.
    pub port: u16,

    /// Fixed interval between client reconnect attempts, in milliseconds.
    pub reconnect_interval_ms: u64,

    /// Consecutive reconnect failures tolerated before the client
    /// gives up and reports offline.
    pub max_reconnect_attempts: u32,

    /// Upper bound on waiting for sessions to close at shutdown, in
    /// milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Outbound frames buffered per session before the session is
    /// considered stalled.
    pub session_queue_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_extensions: vec!["md".to_string()],
            quiet_window_ms: 1000,
            port: 7700,
            reconnect_interval_ms: 2000,
            max_reconnect_attempts: 5,
            shutdown_timeout_ms: 3000,
            session_queue_depth: 64,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file does
    /// not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Startup validation. Having zero usable roots is the one
    /// subsystem-fatal condition.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.roots.is_empty() {
            return Err(SyncError::Config("no watch roots configured".into()));
        }
        if !self.roots.iter().any(|r| r.is_dir()) {
            return Err(SyncError::Config(
                "none of the configured watch roots is an existing directory".into(),
            ));
        }
        if self.quiet_window_ms == 0 {
            return Err(SyncError::Config("quiet_window_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
