use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

pub struct ShutdownManager {
    should_terminate: AtomicBool,
    cancellation_token: CancellationToken,
}

impl ShutdownManager {
    fn new() -> Self {
        ShutdownManager {
            should_terminate: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::SeqCst)
    }

    pub fn initiate_shutdown(&self) {
        if self.should_terminate() {
            return;
        }
        self.should_terminate.store(true, Ordering::SeqCst);
        self.cancellation_token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

static SHUTDOWN_MANAGER_SINGLETON: OnceLock<ShutdownManager> = OnceLock::new();

pub fn get_shutdown_manager() -> &'static ShutdownManager {
    SHUTDOWN_MANAGER_SINGLETON.get_or_init(ShutdownManager::new)
}
