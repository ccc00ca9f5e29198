use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{error, trace, warn};
use tokio::sync::{mpsc, Mutex};

use crate::builder;
use crate::cli::OperationMode;
use crate::config::{get_cached_config, WorkerFileOverrides, WorkerOverrides};
use crate::core::triggers::get_triggers;
use crate::health;
use crate::port_pool::PortPool;
use crate::router::Router;
use crate::worker::registry::Registry;
use crate::worker::{ProcessHandle, RestartReason, RestartRequest, RestartState, Worker};

const WARM_TIMEOUT: Duration = Duration::from_secs(5);
const WARM_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CRASH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_REQUEST_SCAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct Supervisor {
    registry: Arc<Registry>,
    router: Arc<Router>,
    port_pool: Arc<PortPool>,
    restart_tx: mpsc::Sender<RestartRequest>,
    restart_rx: Mutex<Option<mpsc::Receiver<RestartRequest>>>,
    restart_delay: Duration,
    shutdown_grace_period: Duration,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, router: Arc<Router>, port_pool: Arc<PortPool>, restart_delay: Duration, shutdown_grace_period: Duration) -> Arc<Self> {
        let (restart_tx, restart_rx) = mpsc::channel(256);
        Arc::new(Supervisor {
            registry,
            router,
            port_pool,
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
            restart_delay,
            shutdown_grace_period,
        })
    }

    /// Idempotent: a restart already in flight for this worker just sets the
    /// "pending again" bit instead of starting a second one.
    pub async fn restart_worker(&self, worker_name: String, reason: RestartReason) {
        let _ = self.restart_tx.send(RestartRequest { worker_name, reason }).await;
    }

    pub fn restart_sender(&self) -> mpsc::Sender<RestartRequest> {
        self.restart_tx.clone()
    }

    pub async fn start(self: &Arc<Self>, mode: OperationMode) {
        for name in self.registry.names().await {
            self.restart_worker(name, RestartReason::Initial).await;
        }

        let mut rx = self.restart_rx.lock().await.take().expect("Supervisor::start called more than once");
        let consumer = self.clone();
        tokio::spawn(async move { consumer.run_restart_queue(&mut rx, mode).await });

        let monitor = self.clone();
        tokio::spawn(async move { monitor.run_max_request_monitor().await });

        let watcher = self.clone();
        tokio::spawn(async move { watcher.run_config_reload_watcher().await });
    }

    /// Graceful shutdown: interrupt every live worker process, wait the configured
    /// grace period, force-kill stragglers, release every port.
    pub async fn stop_all(&self) {
        for name in self.registry.names().await {
            let Some(handle) = self.registry.get(&name).await else { continue };
            let process = {
                let mut worker = handle.lock().await;
                worker.process.take()
            };
            let Some(mut process) = process else { continue };

            send_interrupt(process.pid);
            match tokio::time::timeout(self.shutdown_grace_period, process.child.wait()).await {
                Ok(_) => trace!("worker {} exited cleanly during shutdown", name),
                Err(_) => {
                    warn!("worker {} did not exit within grace period, force-killing", name);
                    let _ = process.child.kill().await;
                }
            }
            self.port_pool.release(process.port).await;
        }
    }

    async fn run_restart_queue(self: Arc<Self>, rx: &mut mpsc::Receiver<RestartRequest>, mode: OperationMode) {
        while let Some(request) = rx.recv().await {
            let Some(handle) = self.registry.get(&request.worker_name).await else {
                trace!("restart request for unknown worker {}, dropping", request.worker_name);
                continue;
            };

            let already_in_flight = {
                let mut worker = handle.lock().await;
                if worker.restart_in_flight {
                    worker.restart_pending_again = Some(request.reason);
                    true
                } else {
                    worker.restart_in_flight = true;
                    false
                }
            };
            if already_in_flight {
                continue;
            }

            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.run_state_machine(request, mode).await });
        }
    }

    async fn run_state_machine(self: Arc<Self>, request: RestartRequest, mode: OperationMode) {
        let Some(handle) = self.registry.get(&request.worker_name).await else { return };

        {
            let mut worker = handle.lock().await;
            worker.state = RestartState::Building;
        }
        let build_result = {
            let worker = handle.lock().await;
            builder::build(&worker).await
        };
        if let Err(e) = build_result {
            error!("build failed for worker {}: {}", request.worker_name, e);
            let mut worker = handle.lock().await;
            worker.state = RestartState::Failed;
            drop(worker);
            self.finish_restart(&request.worker_name).await;
            return;
        }

        let runtime = handle.lock().await.runtime;
        if runtime == crate::worker::Runtime::ExternalFcgiBackend {
            // The shared backend process is launched once, centrally, at startup; an
            // individual worker of this runtime has nothing to (re)launch, so a
            // "restart" just re-affirms it as servable.
            let mut worker = handle.lock().await;
            worker.state = RestartState::Serving;
            worker.healthy = true;
            worker.last_restart_reason = request.reason;
            drop(worker);
            self.router.rebuild(&self.registry).await;
            self.finish_restart(&request.worker_name).await;
            return;
        }

        {
            let mut worker = handle.lock().await;
            worker.state = RestartState::Launching;
        }
        let overrides = self.resolve_overrides(&handle).await;
        let launched = {
            let worker = handle.lock().await;
            builder::launch(&worker, &self.port_pool, mode, &overrides).await
        };
        let new_process = match launched {
            Ok(p) => p,
            Err(e) => {
                error!("launch failed for worker {}: {}", request.worker_name, e);
                let mut worker = handle.lock().await;
                worker.state = RestartState::Idle;
                drop(worker);
                self.finish_restart(&request.worker_name).await;
                return;
            }
        };

        {
            let mut worker = handle.lock().await;
            worker.state = RestartState::Warming;
        }
        let new_port = new_process.port;
        let warmed = tokio::time::timeout(WARM_TIMEOUT, wait_until_healthy(new_port)).await.unwrap_or(false);

        if !warmed {
            warn!("worker {} failed to warm up on port {}, keeping previous instance", request.worker_name, new_port);
            let mut new_process = new_process;
            let _ = new_process.child.kill().await;
            self.port_pool.release(new_process.port).await;
            let mut worker = handle.lock().await;
            worker.state = RestartState::Idle;
            drop(worker);
            self.finish_restart(&request.worker_name).await;
            return;
        }

        let (previous_process, previous_port) = {
            let mut worker = handle.lock().await;
            let previous_process = worker.process.take();
            let previous_port = worker.current_port;
            worker.process = Some(new_process);
            worker.current_port = new_port;
            worker.started_at = Some(SystemTime::now());
            worker.request_count.store(0, Ordering::Relaxed);
            worker.healthy = true;
            worker.last_restart_reason = request.reason;
            worker.state = RestartState::Serving;
            (previous_process, previous_port)
        };

        self.router.rebuild(&self.registry).await;

        let watcher = self.clone();
        let worker_name = request.worker_name.clone();
        tokio::spawn(async move { watcher.watch_for_crash(worker_name, new_port).await });

        if let Some(previous_process) = previous_process {
            {
                let mut worker = handle.lock().await;
                worker.state = RestartState::Draining;
            }
            let drainer = self.clone();
            let worker_name = request.worker_name.clone();
            tokio::spawn(async move { drainer.drain_previous(worker_name, previous_process, previous_port).await });
        }

        self.finish_restart(&request.worker_name).await;
    }

    async fn drain_previous(&self, worker_name: String, mut process: ProcessHandle, port: u16) {
        tokio::time::sleep(self.restart_delay).await;
        trace!("draining previous instance of worker {} on port {}", worker_name, port);

        send_interrupt(process.pid);
        match tokio::time::timeout(self.shutdown_grace_period, process.child.wait()).await {
            Ok(_) => trace!("previous instance of worker {} exited cleanly", worker_name),
            Err(_) => {
                warn!("previous instance of worker {} did not exit within grace period, force-killing", worker_name);
                let _ = process.child.kill().await;
            }
        }
        self.port_pool.release(port).await;

        if let Some(handle) = self.registry.get(&worker_name).await {
            let mut worker = handle.lock().await;
            if worker.state == RestartState::Draining {
                worker.state = RestartState::Idle;
            }
        }
    }

    // A port mismatch means a later restart already swapped this worker onto a
    // different instance, so this instance's own exit is an expected drain, not a crash.
    async fn watch_for_crash(self: Arc<Self>, worker_name: String, watched_port: u16) {
        loop {
            tokio::time::sleep(CRASH_POLL_INTERVAL).await;
            let Some(handle) = self.registry.get(&worker_name).await else { return };
            let mut worker = handle.lock().await;
            if worker.current_port != watched_port {
                return;
            }

            let exited = match worker.process.as_mut() {
                Some(process) => matches!(process.child.try_wait(), Ok(Some(_))),
                None => true,
            };
            if !exited {
                continue;
            }

            let was_serving = worker.state == RestartState::Serving;
            worker.healthy = false;
            drop(worker);
            self.router.rebuild(&self.registry).await;

            if was_serving {
                warn!("worker {} process on port {} exited unexpectedly", worker_name, watched_port);
                self.restart_worker(worker_name, RestartReason::Crash).await;
            }
            return;
        }
    }

    async fn run_max_request_monitor(self: Arc<Self>) {
        let triggers = get_triggers();
        let mut shutdown_token = match triggers.get_token("shutdown").await {
            Some(t) => t,
            None => return,
        };

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(MAX_REQUEST_SCAN_INTERVAL) => {}
            }

            for name in self.registry.names().await {
                let Some(handle) = self.registry.get(&name).await else { continue };
                let overrides = self.resolve_overrides(&handle).await;
                if overrides.max_requests == 0 {
                    continue;
                }
                let exceeded = handle.lock().await.request_count.load(Ordering::Relaxed) >= overrides.max_requests;
                if exceeded {
                    trace!("worker {} reached max_requests={}, enqueuing restart", name, overrides.max_requests);
                    self.restart_worker(name, RestartReason::MaxRequests).await;
                }
            }

            shutdown_token = match triggers.get_token("shutdown").await {
                Some(t) => t,
                None => return,
            };
        }
    }

    async fn run_config_reload_watcher(self: Arc<Self>) {
        let triggers = get_triggers();
        let mut token = match triggers.get_token("config_changed").await {
            Some(t) => t,
            None => return,
        };

        let mut last_seen: std::collections::HashMap<String, WorkerOverrides> = std::collections::HashMap::new();
        for name in self.registry.names().await {
            if let Some(handle) = self.registry.get(&name).await {
                last_seen.insert(name, self.resolve_overrides(&handle).await);
            }
        }

        loop {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            trace!("config_changed fired, checking per-worker effective settings");

            for name in self.registry.names().await {
                let Some(handle) = self.registry.get(&name).await else { continue };
                let current = self.resolve_overrides(&handle).await;
                let changed = last_seen.get(&name).map(|prev| !overrides_equal(prev, &current)).unwrap_or(true);
                if changed {
                    self.restart_worker(name.clone(), RestartReason::ConfigChange).await;
                }
                last_seen.insert(name, current);
            }

            token = match triggers.get_token("config_changed").await {
                Some(t) => t,
                None => return,
            };
        }
    }

    // Clears the in-flight bit and, if a further restart came in while this one ran,
    // re-enqueues it.
    async fn finish_restart(&self, worker_name: &str) {
        let Some(handle) = self.registry.get(worker_name).await else { return };
        let pending = {
            let mut worker = handle.lock().await;
            worker.restart_in_flight = false;
            worker.restart_pending_again.take()
        };
        if let Some(reason) = pending {
            self.restart_worker(worker_name.to_string(), reason).await;
        }
    }

    async fn resolve_overrides(&self, handle: &Arc<Mutex<Worker>>) -> WorkerOverrides {
        let (route_prefix, source_dir) = {
            let worker = handle.lock().await;
            (worker.route_prefix.clone(), worker.source_dir.clone())
        };

        let base = get_cached_config().current().await.workers.resolve(&route_prefix);

        let manifest_path = source_dir.parent().unwrap_or(&source_dir).join("config").join("worker.yaml");
        match std::fs::read_to_string(&manifest_path) {
            Ok(contents) => serde_yaml::from_str::<WorkerFileOverrides>(&contents).map(|file_overrides| file_overrides.apply_over(base.clone())).unwrap_or(base),
            Err(_) => base,
        }
    }
}

fn overrides_equal(a: &WorkerOverrides, b: &WorkerOverrides) -> bool {
    a.max_requests == b.max_requests && a.read_timeout_seconds == b.read_timeout_seconds && a.write_timeout_seconds == b.write_timeout_seconds && a.idle_timeout_seconds == b.idle_timeout_seconds
}

async fn wait_until_healthy(port: u16) -> bool {
    loop {
        if health::probe_once(port).await {
            return true;
        }
        tokio::time::sleep(WARM_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) {
    // No portable graceful-interrupt primitive without a process handle; the
    // shutdown-grace-period force-kill path below covers this platform instead.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerOverrides;

    #[test]
    fn overrides_equal_detects_timeout_change() {
        let a = WorkerOverrides::default();
        let mut b = WorkerOverrides::default();
        assert!(overrides_equal(&a, &b));
        b.read_timeout_seconds += 1;
        assert!(!overrides_equal(&a, &b));
    }
}
