//! The batch reconciliation worker.
//!
//! Single consumer of the usage queue: drains batches into one SQL
//! transaction each, then corrects the Redis pending counters by
//! `actual - estimated`. Every enqueued record eventually produces
//! exactly one durable row (modulo dead-letter), and `current_spend` is
//! only ever written from here.

use pllm_storage::PgStore;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cache::BudgetCache;
use crate::queue::{QueuedUsage, UsageQueue};

/// Worker configuration and handles.
pub struct ReconciliationWorker {
    queue: UsageQueue,
    store: PgStore,
    cache: BudgetCache,
    batch_size: usize,
    max_retries: u32,
    poll_interval: Duration,
}

impl ReconciliationWorker {
    pub fn new(queue: UsageQueue, store: PgStore, cache: BudgetCache) -> Self {
        Self {
            queue,
            store,
            cache,
            batch_size: 10,
            max_retries: 5,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run forever. Spawn on the runtime next to the servers.
    pub async fn run(self) {
        info!(batch_size = self.batch_size, "reconciliation worker started");
        loop {
            match self.tick().await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(_) => {} // drained work; go straight back for more
                Err(e) => {
                    error!(error = %e, "reconciliation tick failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// One drain cycle. Returns how many records were handled.
    pub async fn tick(&self) -> Result<usize, pllm_core::error::BudgetError> {
        self.queue.promote_due_retries().await?;

        let batch = self.queue.pop_batch(self.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let records: Vec<_> = batch.iter().map(|entry| entry.record.clone()).collect();
        match self.store.insert_usage_batch(&records).await {
            Ok(()) => {
                self.apply_corrections(&batch).await;
                debug!(count, "usage batch reconciled");
            }
            Err(e) => {
                error!(count, error = %e, "usage batch failed, parking for retry");
                for entry in batch {
                    if let Err(park_err) = self.queue.park(entry, self.max_retries).await {
                        error!(error = %park_err, "failed to park usage entry");
                    }
                }
            }
        }
        Ok(count)
    }

    /// Correct the cached pending counters now that the actual cost is
    /// authoritative. Cache trouble is non-fatal — the next refresh
    /// rebuilds from SQL anyway.
    async fn apply_corrections(&self, batch: &[QueuedUsage]) {
        for entry in batch {
            let record = &entry.record;
            let delta = record.cost - record.estimated_cost;
            if delta == 0.0 {
                continue;
            }
            let mut entities: Vec<(&str, &str)> = Vec::new();
            if let Some(key_id) = &record.key_id {
                entities.push(("key", key_id));
            }
            if let Some(team_id) = &record.team_id {
                entities.push(("team", team_id));
            }
            if let Some(user_id) = &record.user_id {
                entities.push(("user", user_id));
            }
            for (entity_type, entity_id) in entities {
                if let Err(e) = self.cache.correct_spent(entity_type, entity_id, delta).await {
                    debug!(entity_type, entity_id, error = %e, "spend correction skipped");
                }
            }
        }
    }
}
