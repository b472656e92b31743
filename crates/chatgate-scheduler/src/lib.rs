//! Provider pool scheduling: weighted selection over healthy providers,
//! load accounting, failure-driven cooldown, and retry with provider
//! substitution.
//!
//! The persistent store owns all provider state; this crate only decides
//! which row to take and feeds outcomes back. Load counters stay balanced
//! because every acquire is paired with exactly one release on every path
//! through [`ProviderScheduler::with_retry`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use chatgate_storage::{ProviderRecord, Storage, StorageError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum health score a candidate must have.
    pub health_threshold: i32,
    /// Consecutive failures before a provider starts cooling.
    pub failure_threshold: i32,
    pub cooldown: Duration,
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_threshold: 50,
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no available provider")]
    NoAvailableProvider,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome classification for one attempt inside [`ProviderScheduler::with_retry`].
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Provider failure; substitute and try the next candidate.
    Retry(E),
    /// Terminal for the request; the provider still gets a failure mark.
    Fatal(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("no available provider")]
    NoAvailableProvider,
    #[error(transparent)]
    Storage(StorageError),
    #[error("operation failed")]
    Op(E),
}

pub struct ProviderScheduler {
    storage: Arc<dyn Storage>,
    config: SchedulerConfig,
}

impl ProviderScheduler {
    pub fn new(storage: Arc<dyn Storage>, config: SchedulerConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Select a provider and take one load slot. The returned record is a
    /// snapshot from before the increment.
    pub async fn acquire(
        &self,
        group: Option<&str>,
        exclude: &[i64],
    ) -> Result<ProviderRecord, SchedulerError> {
        // A raced-away slot re-runs the selection; a few passes are enough
        // because every miss means somebody else made progress.
        for _ in 0..4 {
            let mut candidates = self
                .storage
                .provider_candidates(self.config.health_threshold, group, exclude)
                .await?;
            if candidates.is_empty() {
                return Err(SchedulerError::NoAvailableProvider);
            }
            let index = weighted_index(&candidates, &mut rand::rng());
            if self.storage.try_acquire_provider(candidates[index].id).await? {
                let picked = candidates.swap_remove(index);
                debug!(
                    provider_id = picked.id,
                    health = picked.health_score,
                    load = picked.current_load,
                    "provider acquired"
                );
                return Ok(picked);
            }
        }
        Err(SchedulerError::NoAvailableProvider)
    }

    pub async fn release(&self, provider_id: i64) {
        if let Err(err) = self.storage.release_provider(provider_id).await {
            warn!(provider_id, error = %err, "provider release failed");
        }
    }

    pub async fn record_success(&self, provider_id: i64) {
        if let Err(err) = self.storage.record_provider_success(provider_id).await {
            warn!(provider_id, error = %err, "success accounting failed");
        }
    }

    pub async fn record_failure(&self, provider_id: i64) {
        if let Err(err) = self
            .storage
            .record_provider_failure(
                provider_id,
                self.config.failure_threshold,
                self.config.cooldown,
            )
            .await
        {
            warn!(provider_id, error = %err, "failure accounting failed");
        }
    }

    /// cooling -> active transition for providers whose cooldown elapsed.
    /// Driven by the maintenance loop once a minute.
    pub async fn run_recovery(&self) -> Result<u64, SchedulerError> {
        let recovered = self.storage.recover_cooled_providers().await?;
        if recovered > 0 {
            debug!(recovered, "providers recovered from cooldown");
        }
        Ok(recovered)
    }

    /// Run `op` with up to `max_retries` providers. Each failing provider
    /// is excluded from re-selection; release always pairs the acquire.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        group: Option<&str>,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: Fn(ProviderRecord, u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        let mut exclude: Vec<i64> = Vec::new();
        let mut last_error: Option<E> = None;

        for attempt in 1..=self.config.max_retries.max(1) {
            let provider = match self.acquire(group, &exclude).await {
                Ok(provider) => provider,
                Err(SchedulerError::NoAvailableProvider) => break,
                Err(SchedulerError::Storage(err)) => return Err(RetryError::Storage(err)),
            };
            let provider_id = provider.id;

            let result = op(provider, attempt).await;
            self.release(provider_id).await;

            match result {
                Ok(value) => {
                    self.record_success(provider_id).await;
                    return Ok(value);
                }
                Err(AttemptError::Retry(err)) => {
                    self.record_failure(provider_id).await;
                    warn!(provider_id, attempt, "attempt failed, substituting provider");
                    exclude.push(provider_id);
                    last_error = Some(err);
                }
                Err(AttemptError::Fatal(err)) => {
                    self.record_failure(provider_id).await;
                    return Err(RetryError::Op(err));
                }
            }
        }

        match last_error {
            Some(err) => Err(RetryError::Op(err)),
            None => Err(RetryError::NoAvailableProvider),
        }
    }
}

/// Sample proportionally to `health · (1 − load/max)`. Zero total weight
/// falls back to the first (highest ranked) candidate.
fn weighted_index<R: Rng>(candidates: &[ProviderRecord], rng: &mut R) -> usize {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|provider| {
            let capacity = provider.max_concurrent.max(1) as f64;
            let ratio = provider.current_load as f64 / capacity;
            provider.health_score as f64 * (1.0 - ratio)
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0;
    }

    let mut target = rng.random_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if target < *weight {
            return index;
        }
        target -= weight;
    }
    candidates.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_storage::ProviderStatus;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(id: i64, health: i32, load: i32, max: i32) -> ProviderRecord {
        ProviderRecord {
            id,
            name: format!("p{id}"),
            group_id: None,
            csesidx: String::new(),
            cookies: String::new(),
            max_concurrent: max,
            status: ProviderStatus::Active,
            health_score: health,
            current_load: load,
            consecutive_failures: 0,
            total_requests: 0,
            failed_requests: 0,
            last_success_at: None,
            last_failure_at: None,
            cooldown_until: None,
        }
    }

    #[test]
    fn zero_weight_falls_back_to_first() {
        let candidates = vec![record(1, 0, 0, 10), record(2, 50, 10, 10)];
        let mut rng = StdRng::seed_from_u64(7);
        // First has health 0, second is fully loaded: both weigh nothing.
        assert_eq!(weighted_index(&candidates, &mut rng), 0);
    }

    #[test]
    fn loaded_provider_weighs_less() {
        let candidates = vec![record(1, 100, 9, 10), record(2, 100, 0, 10)];
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits = [0u32; 2];
        for _ in 0..2000 {
            hits[weighted_index(&candidates, &mut rng)] += 1;
        }
        // Weights are 10 vs 100; the idle provider must dominate.
        assert!(hits[1] > hits[0] * 5, "hits: {hits:?}");
        assert!(hits[0] > 0);
    }

    #[test]
    fn single_candidate_always_picked() {
        let candidates = vec![record(3, 80, 2, 10)];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(weighted_index(&candidates, &mut rng), 0);
        }
    }
}
