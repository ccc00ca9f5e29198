use std::sync::Arc;

use tokio::sync::RwLock;

use crate::worker::registry::Registry;
use crate::worker::WorkerSnapshot;

pub struct Router {
    routes: RwLock<Vec<WorkerSnapshot>>,
}

impl Router {
    pub fn new() -> Self {
        Router { routes: RwLock::new(Vec::new()) }
    }

    pub async fn rebuild(&self, registry: &Registry) {
        let snapshots = registry.snapshot_all().await;
        *self.routes.write().await = snapshots;
    }

    // Ties are excluded by construction (duplicate route prefixes are rejected at
    // discovery time), so at most one candidate can hold the longest length.
    pub async fn match_path(&self, path: &str) -> Option<WorkerSnapshot> {
        let routes = self.routes.read().await;
        routes
            .iter()
            .filter(|worker| prefix_matches(&worker.route_prefix, path))
            .max_by_key(|worker| worker.route_prefix.len())
            .cloned()
    }
}

// `/blog` matches `/blog/post` but not `/blogging`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Runtime;
    use std::path::PathBuf;

    async fn registry_with(pairs: &[(&str, &str)]) -> Registry {
        let registry = Registry::new();
        for (name, prefix) in pairs {
            let worker = crate::worker::Worker::new(
                name.to_string(),
                prefix.to_string(),
                Runtime::CompiledNative,
                PathBuf::from("workspace/x/src"),
                PathBuf::from("workspace/x/bin/x"),
            );
            registry.insert(worker).await;
        }
        registry
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let registry = registry_with(&[("blog", "/blog"), ("blog-admin", "/blog/admin")]).await;
        let router = Router::new();
        router.rebuild(&registry).await;

        assert_eq!(router.match_path("/blog/admin/users").await.unwrap().name, "blog-admin");
        assert_eq!(router.match_path("/blog/post/1").await.unwrap().name, "blog");
    }

    #[tokio::test]
    async fn prefix_does_not_match_past_a_path_segment_boundary() {
        let registry = registry_with(&[("blog", "/blog")]).await;
        let router = Router::new();
        router.rebuild(&registry).await;

        assert!(router.match_path("/blogging").await.is_none());
        assert!(router.match_path("/blog").await.is_some());
        assert!(router.match_path("/blog/post").await.is_some());
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let registry = registry_with(&[("blog", "/blog")]).await;
        let router = Router::new();
        router.rebuild(&registry).await;

        assert!(router.match_path("/unrelated").await.is_none());
    }

    #[tokio::test]
    async fn rebuild_reflects_registry_changes() {
        let registry = registry_with(&[("blog", "/blog")]).await;
        let router = Router::new();
        router.rebuild(&registry).await;
        assert!(router.match_path("/blog").await.is_some());

        registry.remove("blog").await;
        router.rebuild(&registry).await;
        assert!(router.match_path("/blog").await.is_none());
    }
}
