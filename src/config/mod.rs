pub mod cached;
pub mod server_config;
pub mod worker_config;

pub use cached::{get_cached_config, CachedConfig};
pub use server_config::ServerConfig;
pub use worker_config::{WorkerFileOverrides, WorkerOverrides, WorkersConfig};
