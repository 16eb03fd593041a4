//! Server configuration.

use crate::error::ServerError;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a server run.
///
/// Every field has a default, so a config file only needs the values it
/// changes. Command-line flags override the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP front end listens on
    pub listen: SocketAddr,

    /// Directory of the sled database holding World snapshots
    pub db_path: PathBuf,

    /// Target tick period in milliseconds
    pub tick_ms: u64,

    /// Seconds between persistence syncs
    pub sync_secs: u64,

    /// World names; the World at index `i` has id `i`
    pub worlds: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4000)),
            db_path: PathBuf::from("hacknet.db"),
            tick_ms: 10,
            sync_secs: 10,
            worlds: vec!["localhost".to_string()],
        }
    }
}

impl ServerConfig {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the driver cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_ms == 0 {
            return Err(ServerError::Config("tick_ms must be at least 1".to_string()));
        }
        if self.worlds.is_empty() {
            return Err(ServerError::Config("at least one world is required".to_string()));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_period(), Duration::from_millis(10));
        assert_eq!(config.sync_interval(), Duration::from_secs(10));
        assert_eq!(config.listen.port(), 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("hacknet-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"tick_ms": 25, "worlds": ["alpha", "beta"]}"#).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.tick_ms, 25);
        assert_eq!(config.worlds, vec!["alpha", "beta"]);
        assert_eq!(config.sync_secs, 10);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = ServerConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }
}
