use std::sync::Arc;
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use chatgate_common::GatewayConfig;
use chatgate_scheduler::ProviderScheduler;
use chatgate_storage::Storage;

/// Hour (local time) at which old request logs are pruned.
const LOG_PRUNE_HOUR: u8 = 3;

/// Process-wide periodic tasks: session expiry sweep, provider cooldown
/// recovery, request-log pruning, and the daily API-key counter reset.
///
/// Constructed at boot and spawned once; every task is idempotent and a
/// failing task logs and continues.
pub struct Maintenance {
    storage: Arc<dyn Storage>,
    scheduler: Arc<ProviderScheduler>,
    config: Arc<GatewayConfig>,
}

impl Maintenance {
    pub fn new(
        storage: Arc<dyn Storage>,
        scheduler: Arc<ProviderScheduler>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            storage,
            scheduler,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Wall-clock tasks are checked once a minute with a date guard,
            // so a missed tick cannot double-run them.
            let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut last_sweep = Instant::now();
            let mut last_prune_date = None;
            let mut last_reset_date = None;

            loop {
                tick.tick().await;

                if let Err(err) = self.scheduler.run_recovery().await {
                    warn!(error = %err, "provider recovery tick failed");
                }

                if last_sweep.elapsed() >= self.config.session_cleanup_interval {
                    last_sweep = Instant::now();
                    match self.storage.sweep_sessions().await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "expired sessions swept");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "session sweep failed"),
                    }
                }

                let now_local = OffsetDateTime::now_utc().to_offset(local_offset);
                let today = now_local.date();

                if now_local.hour() == LOG_PRUNE_HOUR && last_prune_date != Some(today) {
                    last_prune_date = Some(today);
                    let horizon = OffsetDateTime::now_utc()
                        - Duration::from_secs(60 * 60 * 24 * self.config.log_retention_days.max(0) as u64);
                    match self.storage.prune_request_logs(horizon).await {
                        Ok(removed) => info!(removed, "old request logs pruned"),
                        Err(err) => warn!(error = %err, "request log prune failed"),
                    }
                }

                if now_local.hour() == 0 && last_reset_date != Some(today) {
                    last_reset_date = Some(today);
                    match self.storage.reset_daily_usage().await {
                        Ok(touched) => info!(touched, "daily api-key counters reset"),
                        Err(err) => warn!(error = %err, "daily counter reset failed"),
                    }
                }
            }
        })
    }
}
