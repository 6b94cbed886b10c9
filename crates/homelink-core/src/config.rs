//! Configuration types for Homelink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the Homelink coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Path to the SQLite database (default location if None)
    pub db_path: Option<PathBuf>,
    /// Pairing PIN validity in seconds
    pub pin_ttl_secs: i64,
    /// Interval between pairing-session sweeps in seconds
    pub sweep_interval_secs: u64,
    /// Interval between realtime heartbeat pings in seconds
    pub heartbeat_interval_secs: u64,
    /// Bearer token required for client-management endpoints
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8130,
            db_path: None,
            pin_ttl_secs: 300,
            sweep_interval_secs: 60,
            heartbeat_interval_secs: 30,
            admin_token: None,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set database path
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Builder pattern: set PIN validity
    pub fn with_pin_ttl_secs(mut self, secs: i64) -> Self {
        self.pin_ttl_secs = secs;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Builder pattern: set heartbeat interval
    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Builder pattern: set admin token
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = Config::new()
            .with_port(9000)
            .with_pin_ttl_secs(120)
            .with_heartbeat_interval_secs(10);
        assert_eq!(config.port, 9000);
        assert_eq!(config.pin_ttl_secs, 120);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.sweep_interval_secs, 60);
    }
}
