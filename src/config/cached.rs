use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use log::{error, trace};
use tokio::sync::RwLock;

use crate::config::server_config::ServerConfig;
use crate::core::triggers::get_triggers;

pub struct CachedConfig {
    config_path: PathBuf,
    inner: Arc<RwLock<ServerConfig>>,
}

impl CachedConfig {
    fn new(config_path: PathBuf) -> Self {
        let config = ServerConfig::load_from_file(&config_path).unwrap_or_else(|e| {
            error!("failed to load {}: {} - falling back to defaults", config_path.display(), e);
            ServerConfig::get_default()
        });
        CachedConfig {
            config_path,
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn current(&self) -> tokio::sync::RwLockReadGuard<'_, ServerConfig> {
        self.inner.read().await
    }

    async fn watch_for_reload(&self) {
        let triggers = get_triggers();
        let mut token = match triggers.get_token("config_changed").await {
            Some(t) => t,
            None => return,
        };

        loop {
            token.cancelled().await;
            trace!("config_changed trigger fired, reloading {}", self.config_path.display());

            match ServerConfig::load_from_file(&self.config_path) {
                Ok(new_config) => {
                    let mut guard = self.inner.write().await;
                    *guard = new_config;
                    trace!("configuration reloaded successfully");
                }
                Err(e) => {
                    error!("failed to reload {}: {} - keeping previous configuration", self.config_path.display(), e);
                }
            }

            token = match triggers.get_token("config_changed").await {
                Some(t) => t,
                None => return,
            };
        }
    }
}

static CACHED_CONFIG_SINGLETON: OnceLock<Arc<CachedConfig>> = OnceLock::new();

pub fn get_cached_config() -> Arc<CachedConfig> {
    CACHED_CONFIG_SINGLETON
        .get_or_init(|| {
            let config_path = crate::cli::get_cli_args().config.clone();
            let cached = Arc::new(CachedConfig::new(config_path));
            let watcher = cached.clone();
            tokio::spawn(async move { watcher.watch_for_reload().await });
            cached
        })
        .clone()
}
