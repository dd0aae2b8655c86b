//! Bounded pool for CPU-bound query work.
//!
//! Encoding, vector search and reranking are dispatched through
//! [`WorkerPool`], which admits at most `max_workers` of them at a time.
//! A burst of queries queues on the semaphore instead of occupying every
//! runtime thread, so the accept loop and the lifecycle task keep running.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::QueryError;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run a blocking closure on the blocking thread pool while holding a
    /// permit.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, QueryError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueryError::Internal("worker pool closed".into()))?;
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| QueryError::Internal(format!("worker task failed: {}", e)))?;
        Ok(result)
    }

    /// Await `fut` while holding a permit. For work that already offloads
    /// itself (e.g. an encoder that uses `spawn_blocking` internally).
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, QueryError>
    where
        F: Future,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| QueryError::Internal("worker pool closed".into()))?;
        Ok(fut.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_size() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_is_treated_as_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.run(async { 7 }).await.unwrap(), 7);
    }
}
