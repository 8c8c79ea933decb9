//! Weighted admission control for build stages.
//!
//! Cache checks are cheap and numerous; local executions are heavy. Both
//! draw weighted permits from one shared semaphore so a flood of rules
//! cannot oversubscribe the machine, while light stages still flow freely
//! around heavy ones.

use anvil_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use std::sync::Arc;

/// Held for the duration of one stage; capacity returns on drop.
pub struct StagePermit {
    _permit: OwnedSemaphorePermit,
}

pub struct StageScheduler {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    cache_check_weight: u32,
    execution_weight: u32,
}

impl StageScheduler {
    #[must_use]
    pub fn new(capacity: u32, cache_check_weight: u32, execution_weight: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            cache_check_weight: cache_check_weight.max(1),
            execution_weight: execution_weight.max(1),
        }
    }

    /// Admission for a cache-check stage.
    pub async fn cache_check(&self) -> Result<StagePermit> {
        self.acquire(self.cache_check_weight).await
    }

    /// Admission for a local-execution stage; `weight_override` lets an
    /// unusually heavy or light rule adjust its share.
    pub async fn execution(&self, weight_override: Option<u32>) -> Result<StagePermit> {
        self.acquire(weight_override.unwrap_or(self.execution_weight))
            .await
    }

    async fn acquire(&self, weight: u32) -> Result<StagePermit> {
        // A weight above capacity still has to be admissible.
        let weight = weight.clamp(1, self.capacity);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|_| Error::interrupted("stage scheduler shut down"))?;
        Ok(StagePermit { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heavy_stages_block_until_capacity_returns() {
        let scheduler = StageScheduler::new(8, 1, 8);

        let execution = scheduler.execution(None).await.unwrap();
        // The whole capacity is held; a cache check cannot start.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            scheduler.cache_check(),
        )
        .await;
        assert!(blocked.is_err());

        drop(execution);
        scheduler.cache_check().await.unwrap();
    }

    #[tokio::test]
    async fn light_stages_run_concurrently() {
        let scheduler = StageScheduler::new(8, 1, 8);
        let a = scheduler.cache_check().await.unwrap();
        let b = scheduler.cache_check().await.unwrap();
        drop((a, b));
    }

    #[tokio::test]
    async fn overweight_override_is_clamped_to_capacity() {
        let scheduler = StageScheduler::new(4, 1, 2);
        let permit = scheduler.execution(Some(1000)).await.unwrap();
        drop(permit);
    }
}
