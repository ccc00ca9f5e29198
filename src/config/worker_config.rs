use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub directory: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub startup_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub shutdown_grace_period_ms: u64,
    pub default: WorkerOverrides,
    pub paths: HashMap<String, WorkerOverrides>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        WorkersConfig {
            directory: "workspace".to_string(),
            port_range_start: 9000,
            port_range_end: 9100,
            startup_delay_ms: 0,
            restart_delay_ms: 250,
            shutdown_grace_period_ms: 5000,
            default: WorkerOverrides::default(),
            paths: HashMap::new(),
        }
    }
}

impl WorkersConfig {
    pub fn sanitize(&mut self) {
        self.directory = self.directory.trim().to_string();
        for overrides in self.paths.values_mut() {
            overrides.sanitize();
        }
        self.default.sanitize();
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.directory.is_empty() {
            errors.push("directory must not be empty".to_string());
        }
        if self.port_range_start > self.port_range_end {
            errors.push("port_range_start must be <= port_range_end".to_string());
        }
        for (route, overrides) in &self.paths {
            if !route.starts_with('/') {
                errors.push(format!("paths[{}] must start with '/'", route));
            }
            if let Err(sub_errors) = overrides.validate() {
                errors.extend(sub_errors.into_iter().map(|e| format!("paths[{}]: {}", route, e)));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Exact match in `paths`, else longest prefix match in `paths`, else `default`.
    pub fn resolve(&self, route: &str) -> WorkerOverrides {
        if let Some(exact) = self.paths.get(route) {
            return exact.clone();
        }

        self.paths
            .iter()
            .filter(|(prefix, _)| route.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, overrides)| overrides.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOverrides {
    pub max_requests: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub log_file: String,
}

impl Default for WorkerOverrides {
    fn default() -> Self {
        WorkerOverrides {
            max_requests: 0,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
            idle_timeout_seconds: 60,
            log_file: "logs/{path}-{date}.log".to_string(),
        }
    }
}

impl WorkerOverrides {
    pub fn sanitize(&mut self) {
        self.log_file = self.log_file.trim().to_string();
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.read_timeout_seconds == 0 {
            errors.push("read_timeout_seconds must be at least 1".to_string());
        }
        if self.write_timeout_seconds == 0 {
            errors.push("write_timeout_seconds must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerFileOverrides {
    pub max_requests: Option<u64>,
    pub read_timeout_seconds: Option<u64>,
    pub write_timeout_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub log_file: Option<String>,
}

impl WorkerFileOverrides {
    pub fn apply_over(&self, base: WorkerOverrides) -> WorkerOverrides {
        WorkerOverrides {
            max_requests: self.max_requests.unwrap_or(base.max_requests),
            read_timeout_seconds: self.read_timeout_seconds.unwrap_or(base.read_timeout_seconds),
            write_timeout_seconds: self.write_timeout_seconds.unwrap_or(base.write_timeout_seconds),
            idle_timeout_seconds: self.idle_timeout_seconds.unwrap_or(base.idle_timeout_seconds),
            log_file: self.log_file.clone().unwrap_or(base.log_file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_paths() -> WorkersConfig {
        let mut config = WorkersConfig::default();
        config.paths.insert("/blog".to_string(), WorkerOverrides { max_requests: 100, ..WorkerOverrides::default() });
        config.paths.insert("/blog/admin".to_string(), WorkerOverrides { max_requests: 5, ..WorkerOverrides::default() });
        config
    }

    #[test]
    fn exact_match_wins() {
        let config = config_with_paths();
        assert_eq!(config.resolve("/blog/admin").max_requests, 5);
    }

    #[test]
    fn longest_prefix_wins_without_exact_match() {
        let config = config_with_paths();
        assert_eq!(config.resolve("/blog/admin/users").max_requests, 5);
        assert_eq!(config.resolve("/blog/post/1").max_requests, 100);
    }

    #[test]
    fn falls_back_to_default() {
        let config = config_with_paths();
        assert_eq!(config.resolve("/unrelated").max_requests, config.default.max_requests);
    }
}
