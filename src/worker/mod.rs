pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::process::Child;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    CompiledNative,
    ManagedInterpreterViaLocalProcess,
    ExternalFcgiBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Initial,
    SourceChange,
    BinaryChange,
    ConfigChange,
    MaxRequests,
    Crash,
    Manual,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestartReason::Initial => "initial",
            RestartReason::SourceChange => "source-change",
            RestartReason::BinaryChange => "binary-change",
            RestartReason::ConfigChange => "config-change",
            RestartReason::MaxRequests => "max-requests",
            RestartReason::Crash => "crash",
            RestartReason::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct RestartRequest {
    pub worker_name: String,
    pub reason: RestartReason,
}

/// `Failed` is terminal until the next change event retries the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Building,
    Launching,
    Warming,
    Serving,
    Draining,
    Failed,
}

pub struct ProcessHandle {
    pub child: Child,
    pub port: u16,
    pub pid: u32,
}

pub struct Worker {
    pub name: String,
    pub route_prefix: String,
    pub runtime: Runtime,
    pub source_dir: std::path::PathBuf,
    pub artifact_path: std::path::PathBuf,

    pub process: Option<ProcessHandle>,
    pub current_port: u16,
    pub started_at: Option<SystemTime>,
    pub request_count: Arc<AtomicU64>,
    pub healthy: bool,
    pub recorded_binary_mtime: Option<SystemTime>,
    pub last_restart_reason: RestartReason,
    pub state: RestartState,
    /// Set while a restart is in flight; a second request observed during this
    /// window sets the "pending again" bit instead of starting a second restart.
    pub restart_in_flight: bool,
    pub restart_pending_again: Option<RestartReason>,
}

impl Worker {
    pub fn new(name: String, route_prefix: String, runtime: Runtime, source_dir: std::path::PathBuf, artifact_path: std::path::PathBuf) -> Self {
        Worker {
            name,
            route_prefix,
            runtime,
            source_dir,
            artifact_path,
            process: None,
            current_port: 0,
            started_at: None,
            request_count: Arc::new(AtomicU64::new(0)),
            healthy: false,
            recorded_binary_mtime: None,
            last_restart_reason: RestartReason::Initial,
            state: RestartState::Idle,
            restart_in_flight: false,
            restart_pending_again: None,
        }
    }

    /// A cheap, read-only snapshot for the Proxy's hot path. Deliberately excludes
    /// the process handle; `request_count` shares the same atomic as the live
    /// `Worker` so the Proxy can bump it without the per-worker lock.
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.name.clone(),
            route_prefix: self.route_prefix.clone(),
            current_port: self.current_port,
            healthy: self.healthy,
            runtime: self.runtime,
            request_count: self.request_count.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub name: String,
    pub route_prefix: String,
    pub current_port: u16,
    pub healthy: bool,
    pub runtime: Runtime,
    pub request_count: Arc<AtomicU64>,
}

impl WorkerSnapshot {
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}
