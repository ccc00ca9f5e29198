use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;
use crate::fastcgi::{FastCgiPoolConfig, Transport};
use crate::worker::{Runtime, Worker};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct WorkerManifest {
    route: Option<String>,
    runtime: Option<String>,
    backend: Option<BackendManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackendManifest {
    listen: String,
    #[serde(default = "default_transport")]
    transport: String,
    #[serde(default)]
    pool_size: usize,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn parse_runtime(tag: &str) -> Option<Runtime> {
    match tag {
        "compiled-native" => Some(Runtime::CompiledNative),
        "managed-interpreter-via-local-process" => Some(Runtime::ManagedInterpreterViaLocalProcess),
        "external-fcgi-backend" => Some(Runtime::ExternalFcgiBackend),
        _ => None,
    }
}

fn infer_runtime(name: &str, worker_dir: &Path) -> Runtime {
    if worker_dir.join("bin").join(name).exists() {
        return Runtime::CompiledNative;
    }
    let src_dir = worker_dir.join("src");
    for candidate in ["main.js", "index.js", "app.py", "main.py"] {
        if src_dir.join(candidate).exists() {
            return Runtime::ManagedInterpreterViaLocalProcess;
        }
    }
    Runtime::CompiledNative
}

pub fn discover_workers(workspace_dir: &Path) -> Result<Vec<Worker>, DiscoveryError> {
    let entries = std::fs::read_dir(workspace_dir).map_err(|e| DiscoveryError::WorkspaceUnreadable(workspace_dir.display().to_string(), e))?;

    let mut workers = Vec::new();
    let mut seen_prefixes = std::collections::HashSet::new();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.path().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let worker_dir = entry.path();
        let manifest = load_manifest(&worker_dir);

        let route_prefix = manifest.route.clone().unwrap_or_else(|| format!("/{}", name));
        if !seen_prefixes.insert(route_prefix.clone()) {
            return Err(DiscoveryError::DuplicateRoutePrefix(route_prefix));
        }

        let runtime = manifest.runtime.as_deref().and_then(parse_runtime).unwrap_or_else(|| infer_runtime(&name, &worker_dir));

        let source_dir = worker_dir.join("src");
        let artifact_path = worker_dir.join("bin").join(&name);

        workers.push(Worker::new(name, route_prefix, runtime, source_dir, artifact_path));
    }

    Ok(workers)
}

fn load_manifest(worker_dir: &Path) -> WorkerManifest {
    let manifest_path: PathBuf = worker_dir.join("config").join("worker.yaml");
    let Ok(contents) = std::fs::read_to_string(&manifest_path) else {
        return WorkerManifest::default();
    };
    serde_yaml::from_str(&contents).unwrap_or_default()
}

pub fn load_backend_config(worker_dir: &Path) -> Option<FastCgiPoolConfig> {
    let manifest = load_manifest(worker_dir);
    let backend = manifest.backend?;
    let transport = match backend.transport.as_str() {
        "unix" => Transport::Unix,
        _ => Transport::Tcp,
    };
    let mut config = FastCgiPoolConfig::new(backend.listen, transport);
    config.pool_size = backend.pool_size;
    Some(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovers_one_worker_per_subdirectory() {
        let tmp = std::env::temp_dir().join(format!("runway-discovery-test-{}", std::process::id()));
        let blog_src = tmp.join("blog").join("src");
        fs::create_dir_all(&blog_src).unwrap();
        fs::write(blog_src.join("main.js"), "").unwrap();

        let workers = discover_workers(&tmp).unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "blog");
        assert_eq!(workers[0].route_prefix, "/blog");
        assert_eq!(workers[0].runtime, Runtime::ManagedInterpreterViaLocalProcess);

        fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn duplicate_route_prefix_is_rejected() {
        let tmp = std::env::temp_dir().join(format!("runway-discovery-dup-{}", std::process::id()));
        for name in ["a", "b"] {
            let dir = tmp.join(name).join("config");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("worker.yaml"), "route: /shared\n").unwrap();
        }

        let result = discover_workers(&tmp);
        assert!(matches!(result, Err(DiscoveryError::DuplicateRoutePrefix(_))));

        fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn unreadable_workspace_is_reported() {
        let result = discover_workers(Path::new("/nonexistent/workspace/path"));
        assert!(matches!(result, Err(DiscoveryError::WorkspaceUnreadable(_, _))));
    }

    #[test]
    fn backend_config_is_read_when_present() {
        let tmp = std::env::temp_dir().join(format!("runway-discovery-backend-{}", std::process::id()));
        let config_dir = tmp.join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("worker.yaml"), "runtime: external-fcgi-backend\nbackend:\n  listen: 127.0.0.1:9001\n  pool_size: 4\n").unwrap();

        let config = load_backend_config(&tmp).expect("backend section should parse");
        assert_eq!(config.listen, "127.0.0.1:9001");
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.transport, crate::fastcgi::Transport::Tcp);

        fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn backend_config_absent_returns_none() {
        let tmp = std::env::temp_dir().join(format!("runway-discovery-no-backend-{}", std::process::id()));
        fs::create_dir_all(&tmp).unwrap();
        assert!(load_backend_config(&tmp).is_none());
        fs::remove_dir_all(&tmp).unwrap();
    }
}
