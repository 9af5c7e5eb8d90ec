use std::sync::Arc;

use sync_core::{GovernorController, GovernorSettings, PoolState};
use sync_logging::{sync_debug, sync_warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::ConcurrencyLimit;
use crate::sampler::LoadSource;

/// Periodic task that feeds load readings to a `GovernorController` and
/// pushes its decisions into a pool's `ConcurrencyLimit`.
pub struct PoolGovernor {
    stop: CancellationToken,
    task: JoinHandle<(PoolState, u64)>,
}

impl PoolGovernor {
    /// Start ticking. Must be called from within a tokio runtime.
    pub fn spawn(
        settings: GovernorSettings,
        load: Arc<dyn LoadSource>,
        limit: Arc<ConcurrencyLimit>,
        mut state: PoolState,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let mut controller = GovernorController::new(settings);
            let mut ticker = tokio::time::interval(settings.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reading = load.sample();
                if let Some(adjustment) = controller.observe(reading, &mut state) {
                    limit.set_max(adjustment.to);
                    sync_debug!(
                        "load {:.1}%: concurrency {} -> {}",
                        adjustment.load,
                        adjustment.from,
                        adjustment.to
                    );
                }
            }
            (state, controller.adjustments())
        });
        Self { stop, task }
    }

    /// Stop ticking; returns the final pool state and how many adjustments were made.
    pub async fn stop(self, fallback: PoolState) -> (PoolState, u64) {
        self.stop.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                sync_warn!("governor task ended abnormally: {}", err);
                (fallback, 0)
            }
        }
    }
}
