use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::worker_config::WorkersConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub file_watcher: FileWatcherSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub log_file: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            port: 8080,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
            idle_timeout_seconds: 60,
            log_file: "logs/server-{date}.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileWatcherSection {
    pub debounce_ms: u64,
}

impl Default for FileWatcherSection {
    fn default() -> Self {
        FileWatcherSection { debounce_ms: 50 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server: ServerSection::default(),
            workers: WorkersConfig::default(),
            file_watcher: FileWatcherSection::default(),
        }
    }
}

impl ServerConfig {
    /// Returns a fully-populated, runnable example configuration rather than an empty shell.
    pub fn get_default() -> Self {
        ServerConfig::default()
    }

    pub fn sanitize(&mut self) {
        self.server.log_file = self.server.log_file.trim().to_string();
        self.workers.sanitize();
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be nonzero".to_string());
        }
        if self.server.read_timeout_seconds == 0 {
            errors.push("server.read_timeout_seconds must be at least 1".to_string());
        }
        if self.server.write_timeout_seconds == 0 {
            errors.push("server.write_timeout_seconds must be at least 1".to_string());
        }

        if let Err(worker_errors) = self.workers.validate() {
            errors.extend(worker_errors.into_iter().map(|e| format!("workers: {}", e)));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.sanitize();
        config.validate().map_err(|errors| ConfigError::InvalidValue {
            field: "server.yaml".to_string(),
            reason: errors.join("; "),
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ServerConfig::get_default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = ServerConfig::get_default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
