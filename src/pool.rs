//! Bounded pool for sandbox lifecycle jobs.
//!
//! Provisioning and teardown take seconds against the engine. Jobs run on
//! their own tasks so connection handlers keep servicing messages, and a
//! semaphore caps how many talk to the engine at once.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::PoolError;

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

    /// Run `job` on the pool and wait for its result.
    ///
    /// The job keeps running to completion even if the caller stops waiting.
    pub async fn dispatch<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| PoolError::Closed)?;
            Ok(job.await)
        });
        handle.await?
    }
}
