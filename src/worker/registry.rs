use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::worker::{Worker, WorkerSnapshot};

pub struct Registry {
    workers: RwLock<HashMap<String, Arc<Mutex<Worker>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { workers: RwLock::new(HashMap::new()) }
    }

    pub async fn insert(&self, worker: Worker) {
        let name = worker.name.clone();
        self.workers.write().await.insert(name, Arc::new(Mutex::new(worker)));
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<Mutex<Worker>>> {
        self.workers.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Mutex<Worker>>> {
        self.workers.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }

    pub async fn snapshot_all(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers.values() {
            snapshots.push(worker.lock().await.snapshot());
        }
        snapshots
    }

    pub async fn snapshot_one(&self, name: &str) -> Option<WorkerSnapshot> {
        let worker = self.get(name).await?;
        Some(worker.lock().await.snapshot())
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Runtime;
    use std::path::PathBuf;

    fn sample_worker(name: &str, prefix: &str) -> Worker {
        Worker::new(name.to_string(), prefix.to_string(), Runtime::CompiledNative, PathBuf::from("workspace/x/src"), PathBuf::from("workspace/x/bin/x"))
    }

    #[tokio::test]
    async fn insert_and_get_roundtrips() {
        let registry = Registry::new();
        registry.insert(sample_worker("hello", "/")).await;
        assert!(registry.get("hello").await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_all_reflects_health() {
        let registry = Registry::new();
        registry.insert(sample_worker("hello", "/")).await;
        let handle = registry.get("hello").await.unwrap();
        handle.lock().await.healthy = true;

        let snapshots = registry.snapshot_all().await;
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].healthy);
    }

    #[tokio::test]
    async fn remove_drops_worker() {
        let registry = Registry::new();
        registry.insert(sample_worker("hello", "/")).await;
        assert!(registry.remove("hello").await.is_some());
        assert!(registry.get("hello").await.is_none());
    }
}
