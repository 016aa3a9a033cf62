//! Bounded pool for background tasks (cursor prefetch).
//!
//! Submission never queues without limit and never drops work: when every
//! permit is taken the future is handed back and the caller runs it inline.

use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Result of [`WorkerPool::try_spawn`].
pub enum Submission<F> {
    Spawned(JoinHandle<()>),
    Saturated(F),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub capacity: usize,
    pub busy: usize,
    pub spawned: u64,
    pub inline: u64,
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    spawned: Arc<AtomicU64>,
    inline: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            spawned: Arc::new(AtomicU64::new(0)),
            inline: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns `task` if a permit is free, otherwise returns it unchanged.
    pub fn try_spawn<F>(&self, task: F) -> Submission<F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                self.spawned.fetch_add(1, Ordering::Relaxed);
                Submission::Spawned(tokio::spawn(async move {
                    task.await;
                    drop(permit);
                }))
            }
            Err(_) => Submission::Saturated(task),
        }
    }

    /// Spawns `task`, or runs it to completion on the caller when saturated.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Submission::Saturated(task) = self.try_spawn(task) {
            debug!("Worker pool saturated ({} busy), running task inline", self.capacity);
            self.inline.fetch_add(1, Ordering::Relaxed);
            task.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            capacity: self.capacity,
            busy: self.capacity - self.permits.available_permits(),
            spawned: self.spawned.load(Ordering::Relaxed),
            inline: self.inline.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_saturated_pool_hands_task_back() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = pool.try_spawn(async move {
            let _ = release_rx.await;
        });
        assert!(matches!(first, Submission::Spawned(_)));
        assert_eq!(pool.stats().busy, 1);

        let second = pool.try_spawn(async {});
        assert!(matches!(second, Submission::Saturated(_)));

        release_tx.send(()).unwrap();
        if let Submission::Spawned(handle) = first {
            handle.await.unwrap();
        }
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_submit_runs_inline_when_saturated() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let _blocker = pool.try_spawn(async move {
            let _ = release_rx.await;
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.submit(async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().inline, 1);
        release_tx.send(()).unwrap();
    }
}
