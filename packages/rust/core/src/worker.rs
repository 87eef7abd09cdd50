//! Bounded pool for pipeline jobs.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs blocking jobs on tokio's blocking pool, at most `max_workers` at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Queue `job`. It starts once a slot is free and runs to completion on a
    /// blocking thread. Dropping the handle does not stop the job.
    ///
    /// The handle resolves to `Err(reason)` when the job panicked or never
    /// started.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<Result<(), String>>
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("worker pool closed, job dropped");
                return Err("worker pool closed".to_string());
            };
            debug!("worker slot acquired");
            match tokio::task::spawn_blocking(job).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_panic() => Err(panic_reason(e.into_panic())),
                Err(e) => Err(e.to_string()),
            }
        })
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_job_reports_reason_and_frees_slot() {
        let pool = WorkerPool::new(1);
        let failed = pool.spawn(|| panic!("bad record"));
        assert_eq!(failed.await.unwrap(), Err("bad record".to_string()));

        let formatted = pool.spawn(|| panic!("node {} failed", 7));
        assert_eq!(formatted.await.unwrap(), Err("node 7 failed".to_string()));

        assert_eq!(pool.spawn(|| {}).await.unwrap(), Ok(()));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn zero_workers_means_one() {
        assert_eq!(WorkerPool::new(0).max_workers(), 1);
    }
}
