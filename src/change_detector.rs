use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use log::{error, trace, warn};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::cli::{get_cli_args, OperationMode};
use crate::config::get_cached_config;
use crate::core::triggers::get_triggers;
use crate::worker::registry::Registry;
use crate::worker::{RestartReason, RestartRequest};

// `Config` carries no worker name; it applies to every worker's effective settings via
// the `config_changed` trigger rather than a direct restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Source,
    Asset,
    Config,
}

const SOURCE_EXTENSIONS: &[&str] = &["rs", "js", "ts", "py", "go", "rb", "java", "c", "cpp", "h"];

pub fn start(mode: OperationMode, registry: std::sync::Arc<Registry>, restart_tx: mpsc::Sender<RestartRequest>) {
    match mode {
        OperationMode::Dev => {
            tokio::spawn(run_dev_watcher(registry, restart_tx));
        }
        OperationMode::Prod => {
            tokio::spawn(run_prod_mtime_check(registry, restart_tx));
        }
    }
}

enum WatchedRoot {
    Worker { root: PathBuf, name: String },
    Config { path: PathBuf },
}

async fn run_dev_watcher(registry: std::sync::Arc<Registry>, restart_tx: mpsc::Sender<RestartRequest>) {
    let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<notify::Event>>();

    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create filesystem watcher: {}", e);
            return;
        }
    };

    let mut watched: Vec<WatchedRoot> = Vec::new();
    for name in registry.names().await {
        let Some(handle) = registry.get(&name).await else { continue };
        let source_dir = handle.lock().await.source_dir.clone();
        let worker_root = source_dir.parent().unwrap_or(&source_dir).to_path_buf();
        if let Err(e) = watcher.watch(&worker_root, RecursiveMode::Recursive) {
            warn!("could not watch {} for worker {}: {}", worker_root.display(), name, e);
            continue;
        }
        watched.push(WatchedRoot::Worker { root: worker_root, name });
    }

    let config_path = get_cli_args().config.clone();
    if let Some(config_dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        match watcher.watch(config_dir, RecursiveMode::NonRecursive) {
            Ok(()) => watched.push(WatchedRoot::Config { path: config_path.clone() }),
            Err(e) => warn!("could not watch config directory {}: {}", config_dir.display(), e),
        }
    }

    // notify's callback runs on its own thread; bridge events onto a bounded tokio
    // channel so the debounce loop below stays entirely async.
    let (bridge_tx, mut bridge_rx) = mpsc::channel::<notify::Event>(256);
    std::thread::spawn(move || {
        while let Ok(Ok(event)) = raw_rx.recv() {
            if bridge_tx.blocking_send(event).is_err() {
                break;
            }
        }
    });

    // Per-absolute-path debouncing: each changed path gets its own window, so a
    // burst of events on the same path collapses to one classification, while distinct
    // paths changed within the same overall window still each contribute their event.
    let mut pending: HashMap<PathBuf, (ChangeKind, Option<String>)> = HashMap::new();

    loop {
        let first = match bridge_rx.recv().await {
            Some(event) => event,
            None => return,
        };
        record_pending(&mut pending, &watched, &first);

        let debounce_ms = get_cached_config().current().await.file_watcher.debounce_ms;
        let deadline = tokio::time::sleep(Duration::from_millis(debounce_ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                maybe_event = bridge_rx.recv() => {
                    match maybe_event {
                        Some(event) => record_pending(&mut pending, &watched, &event),
                        None => return,
                    }
                }
            }
        }

        let mut worker_restarts: HashMap<String, RestartReason> = HashMap::new();
        let mut config_changed = false;
        for (kind, worker_name) in pending.drain().map(|(_, v)| v) {
            match (kind, worker_name) {
                (ChangeKind::Config, _) => config_changed = true,
                (ChangeKind::Source, Some(name)) => {
                    worker_restarts.insert(name, RestartReason::SourceChange);
                }
                (ChangeKind::Asset, Some(name)) => {
                    worker_restarts.entry(name).or_insert(RestartReason::SourceChange);
                }
                _ => {}
            }
        }

        if config_changed {
            trace!("detected configuration file change");
            get_triggers().run_trigger("config_changed").await;
        }
        for (worker_name, reason) in worker_restarts {
            trace!("detected {} for worker {}", reason, worker_name);
            let _ = restart_tx.send(RestartRequest { worker_name, reason }).await;
        }
    }
}

fn is_ignored(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with('~')) {
        return true;
    }
    path.components().any(|c| c.as_os_str().to_str().is_some_and(|s| s.starts_with('.') && s != "." && s != ".."))
}

fn record_pending(pending: &mut HashMap<PathBuf, (ChangeKind, Option<String>)>, watched: &[WatchedRoot], event: &notify::Event) {
    if !matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_)) {
        return;
    }

    for path in &event.paths {
        if is_ignored(path) {
            continue;
        }

        for root in watched {
            match root {
                WatchedRoot::Config { path: config_path } if path == config_path => {
                    pending.insert(path.clone(), (ChangeKind::Config, None));
                }
                WatchedRoot::Worker { root, name } if path.starts_with(root) => {
                    if let Some(kind) = classify_under_worker_root(root, path) {
                        pending.insert(path.clone(), (kind, Some(name.clone())));
                    }
                }
                _ => continue,
            }
        }
    }
}

fn classify_under_worker_root(root: &Path, path: &Path) -> Option<ChangeKind> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let top = components.next()?.as_os_str().to_str()?;

    match top {
        "src" => {
            let extension = path.extension().and_then(|e| e.to_str())?;
            SOURCE_EXTENSIONS.contains(&extension).then_some(ChangeKind::Source)
        }
        "public" | "private" => Some(ChangeKind::Asset),
        _ => None,
    }
}

// The supervisor's own binary is deliberately not compared here; self-binary changes
// don't trigger a restart.
async fn run_prod_mtime_check(registry: std::sync::Arc<Registry>, restart_tx: mpsc::Sender<RestartRequest>) {
    let triggers = get_triggers();
    let mut token = match triggers.get_token("reload_signal").await {
        Some(t) => t,
        None => return,
    };
    let config_path = get_cli_args().config.clone();
    let mut recorded_config_mtime = std::fs::metadata(&config_path).and_then(|m| m.modified()).ok();

    loop {
        token.cancelled().await;
        trace!("reload_signal fired, checking worker artifact and config mtimes");

        if let Ok(mtime) = std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            let changed = recorded_config_mtime.map(|recorded| mtime > recorded).unwrap_or(true);
            if changed {
                recorded_config_mtime = Some(mtime);
                trace!("detected configuration file change at {}", config_path.display());
                triggers.run_trigger("config_changed").await;
            }
        }

        for name in registry.names().await {
            let Some(handle) = registry.get(&name).await else { continue };
            let mut worker = handle.lock().await;
            let mtime = match std::fs::metadata(&worker.artifact_path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("could not stat artifact for worker {}: {}", worker.name, e);
                    continue;
                }
            };

            let changed = worker.recorded_binary_mtime.map(|recorded| mtime > recorded).unwrap_or(true);
            if changed {
                worker.recorded_binary_mtime = Some(mtime);
                let worker_name = worker.name.clone();
                drop(worker);
                let _ = restart_tx.send(RestartRequest { worker_name, reason: RestartReason::BinaryChange }).await;
            }
        }

        token = match triggers.get_token("reload_signal").await {
            Some(t) => t,
            None => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_under_src_with_known_extension_is_classified_source() {
        let root = Path::new("/workspace/blog");
        let path = Path::new("/workspace/blog/src/main.rs");
        assert_eq!(classify_under_worker_root(root, path), Some(ChangeKind::Source));
    }

    #[test]
    fn unrecognized_extension_under_src_is_ignored() {
        let root = Path::new("/workspace/blog");
        let path = Path::new("/workspace/blog/src/notes.txt");
        assert_eq!(classify_under_worker_root(root, path), None);
    }

    #[test]
    fn public_and_private_paths_are_classified_asset() {
        let root = Path::new("/workspace/blog");
        assert_eq!(classify_under_worker_root(root, Path::new("/workspace/blog/public/style.css")), Some(ChangeKind::Asset));
        assert_eq!(classify_under_worker_root(root, Path::new("/workspace/blog/private/secret.json")), Some(ChangeKind::Asset));
    }

    #[test]
    fn sibling_directories_outside_src_public_private_are_ignored() {
        let root = Path::new("/workspace/blog");
        assert_eq!(classify_under_worker_root(root, Path::new("/workspace/blog/bin/blog")), None);
    }

    #[test]
    fn hidden_directories_and_tilde_files_are_ignored() {
        assert!(is_ignored(Path::new("/workspace/blog/src/.swp")));
        assert!(is_ignored(Path::new("/workspace/blog/.git/HEAD")));
        assert!(is_ignored(Path::new("/workspace/blog/src/main.rs~")));
        assert!(!is_ignored(Path::new("/workspace/blog/src/main.rs")));
    }
}
