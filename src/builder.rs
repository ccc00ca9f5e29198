use std::path::Path;
use std::process::Stdio;

use log::{error, trace};
use tokio::process::{Child, Command};

use crate::cli::OperationMode;
use crate::config::{get_cached_config, WorkerOverrides};
use crate::error::{BuildError, LaunchError};
use crate::port_pool::PortPool;
use crate::worker::{ProcessHandle, Runtime, Worker};

pub async fn build(worker: &Worker) -> Result<(), BuildError> {
    match worker.runtime {
        Runtime::CompiledNative => {
            if !worker.artifact_path.exists() {
                return Err(BuildError::Failed {
                    worker: worker.name.clone(),
                    reason: format!("artifact {} does not exist", worker.artifact_path.display()),
                });
            }
            Ok(())
        }
        Runtime::ManagedInterpreterViaLocalProcess | Runtime::ExternalFcgiBackend => Ok(()),
    }
}

pub async fn launch(worker: &Worker, port_pool: &PortPool, mode: OperationMode, overrides: &WorkerOverrides) -> Result<ProcessHandle, LaunchError> {
    let port = port_pool
        .acquire(&worker.name)
        .await
        .map_err(|e| LaunchError::Spawn {
            worker: worker.name.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;

    let startup_delay_ms = get_cached_config().current().await.workers.startup_delay_ms;
    if startup_delay_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(startup_delay_ms)).await;
    }

    let command = build_command(worker, port, mode, overrides);

    match command {
        Ok(mut cmd) => match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                trace!("worker {} launched on port {} (pid {})", worker.name, port, pid);
                Ok(ProcessHandle { child, port, pid })
            }
            Err(source) => {
                error!("failed to spawn worker {}: {}", worker.name, source);
                port_pool.release(port).await;
                Err(LaunchError::Spawn { worker: worker.name.clone(), source })
            }
        },
        Err(source) => {
            port_pool.release(port).await;
            Err(LaunchError::Spawn { worker: worker.name.clone(), source })
        }
    }
}

fn apply_worker_env(cmd: &mut Command, worker: &Worker, port: u16, mode: OperationMode, overrides: &WorkerOverrides) {
    cmd.env("WORKER_PORT", port.to_string());
    cmd.env("WORKER_ROUTE", &worker.route_prefix);
    cmd.env("WORKER_MODE", mode.to_string());
    cmd.env("WORKER_READ_TIMEOUT_SECONDS", overrides.read_timeout_seconds.to_string());
    cmd.env("WORKER_WRITE_TIMEOUT_SECONDS", overrides.write_timeout_seconds.to_string());
    cmd.env("WORKER_IDLE_TIMEOUT_SECONDS", overrides.idle_timeout_seconds.to_string());
}

fn build_command(worker: &Worker, port: u16, mode: OperationMode, overrides: &WorkerOverrides) -> Result<Command, std::io::Error> {
    match worker.runtime {
        Runtime::CompiledNative => {
            let mut cmd = Command::new(&worker.artifact_path);
            cmd.kill_on_drop(true);
            apply_worker_env(&mut cmd, worker, port, mode, overrides);
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
            Ok(cmd)
        }
        Runtime::ManagedInterpreterViaLocalProcess => {
            let entrypoint = locate_entrypoint(&worker.source_dir)?;
            let interpreter = interpreter_for(&entrypoint)?;
            let mut cmd = Command::new(interpreter);
            cmd.arg(entrypoint);
            cmd.kill_on_drop(true);
            apply_worker_env(&mut cmd, worker, port, mode, overrides);
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
            Ok(cmd)
        }
        Runtime::ExternalFcgiBackend => {
            // The backend itself (e.g. php-fpm) is launched once, centrally, by the
            // Supervisor at startup, not per-worker. Individual workers of
            // this runtime never reach `build_command` with a process to spawn.
            Err(std::io::Error::other(format!(
                "worker {} uses a shared FastCGI backend and has no per-worker process",
                worker.name
            )))
        }
    }
}

fn interpreter_for(entrypoint: &Path) -> Result<&'static str, std::io::Error> {
    match entrypoint.extension().and_then(|e| e.to_str()) {
        Some("js") => Ok("node"),
        Some("py") => Ok("python3"),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("no known interpreter for entrypoint {}", entrypoint.display()),
        )),
    }
}

fn locate_entrypoint(source_dir: &Path) -> Result<std::path::PathBuf, std::io::Error> {
    for candidate in ["main.js", "index.js", "app.py", "main.py"] {
        let path = source_dir.join(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no recognized entrypoint found under {}", source_dir.display()),
    ))
}

pub async fn wait_for_exit(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    child.wait().await
}
