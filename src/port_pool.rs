use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::error::PortExhaustionError;

pub struct PortPool {
    inner: Arc<Mutex<PortPoolInner>>,
}

struct PortPoolInner {
    range_start: u16,
    range_end: u16,
    assigned: HashMap<u16, String>,
}

impl PortPool {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        PortPool {
            inner: Arc::new(Mutex::new(PortPoolInner {
                range_start,
                range_end,
                assigned: HashMap::new(),
            })),
        }
    }

    /// Probes each unassigned port in range for a real bind rather than trusting a
    /// monotonic counter; the first successful bind is recorded as assigned to `owner`.
    pub async fn acquire(&self, owner: &str) -> Result<u16, PortExhaustionError> {
        let mut inner = self.inner.lock().await;
        let (start, end) = (inner.range_start, inner.range_end);

        for candidate in start..=end {
            if inner.assigned.contains_key(&candidate) {
                continue;
            }
            if Self::probe_bind(candidate).await {
                inner.assigned.insert(candidate, owner.to_string());
                return Ok(candidate);
            }
        }

        Err(PortExhaustionError::RangeExhausted { start, end })
    }

    async fn probe_bind(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }

    pub async fn release(&self, port: u16) {
        self.inner.lock().await.assigned.remove(&port);
    }

    pub async fn release_all_for_owner(&self, owner: &str) {
        let mut inner = self.inner.lock().await;
        inner.assigned.retain(|_, o| o != owner);
    }

    pub async fn assigned_count(&self) -> usize {
        self.inner.lock().await.assigned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_port_in_range() {
        let pool = PortPool::new(19000, 19010);
        let port = pool.acquire("worker-a").await.expect("should find a free port");
        assert!((19000..=19010).contains(&port));
        pool.release(port).await;
    }

    #[tokio::test]
    async fn exhausted_range_errors_without_disturbing_existing_assignment() {
        let pool = PortPool::new(19100, 19100);
        let first = pool.acquire("worker-a").await.expect("first port should succeed");
        let result = pool.acquire("worker-b").await;
        assert!(result.is_err());
        // Scenario E / Invariant 6: exhaustion must not disturb the existing assignment.
        assert_eq!(pool.assigned_count().await, 1);
        pool.release(first).await;
    }

    #[tokio::test]
    async fn release_all_for_owner_frees_only_that_owners_ports() {
        let pool = PortPool::new(19200, 19210);
        let a = pool.acquire("worker-a").await.unwrap();
        let _b = pool.acquire("worker-b").await.unwrap();
        pool.release_all_for_owner("worker-a").await;
        assert_eq!(pool.assigned_count().await, 1);
        let _ = a;
    }
}
