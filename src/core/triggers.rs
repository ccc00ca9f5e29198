use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::{trace, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct Triggers {
    triggers: HashMap<String, Arc<RwLock<CancellationToken>>>,
}

impl Triggers {
    fn new() -> Self {
        let known = ["config_changed", "shutdown", "reload_signal"];
        let triggers = known
            .iter()
            .map(|name| (name.to_string(), Arc::new(RwLock::new(CancellationToken::new()))))
            .collect();
        Triggers { triggers }
    }

    pub async fn get_token(&self, name: &str) -> Option<CancellationToken> {
        let lock = self.triggers.get(name)?;
        Some(lock.read().await.clone())
    }

    pub fn get_trigger(&self, name: &str) -> Option<Arc<RwLock<CancellationToken>>> {
        self.triggers.get(name).cloned()
    }

    pub async fn run_trigger(&self, name: &str) {
        match self.triggers.get(name) {
            Some(lock) => {
                trace!("running trigger: {}", name);
                lock.read().await.cancel();
            }
            None => {
                warn!("attempted to run a non-existent trigger: {}", name);
                return;
            }
        }
        self.renew_trigger(name).await;
    }

    async fn renew_trigger(&self, name: &str) {
        if let Some(lock) = self.triggers.get(name) {
            let mut token = lock.write().await;
            *token = CancellationToken::new();
        }
    }
}

static TRIGGERS_SINGLETON: OnceLock<Triggers> = OnceLock::new();

pub fn get_triggers() -> &'static Triggers {
    TRIGGERS_SINGLETON.get_or_init(Triggers::new)
}
