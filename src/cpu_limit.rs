//! Tools for limiting the number of concurrent CPU-bound engine processes.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Limits how many CPU-hungry external processes run at once.
///
/// GPU work is gated by the admission queue. This is the CPU-side
/// counterpart, shared by the engines that shell out to CPU-bound tools.
#[derive(Clone, Debug)]
pub struct CpuLimiter {
    semaphore: Arc<Semaphore>,
}

impl CpuLimiter {
    /// Allow `permits` concurrent processes.
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// Allow one process per CPU.
    pub fn per_cpu() -> Self {
        Self::new(num_cpus::get())
    }

    /// Call an async function while holding a permit.
    ///
    /// If the caller is cancelled while waiting, nothing is held. If it is
    /// cancelled while running, the permit is dropped with the future.
    #[instrument(level = "trace", skip_all)]
    pub async fn run<Func, Fut, R>(&self, f: Func) -> Result<R>
    where
        Func: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("Could not acquire CPU permit")?;
        Ok(f().await)
    }

    /// How many permits are free right now?
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for CpuLimiter {
    fn default() -> Self {
        Self::per_cpu()
    }
}
