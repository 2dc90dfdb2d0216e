use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::engine::Engine;

/// How often the compactor checks the WAL growth.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Expire overdue holds every `every`. Runs until the task is dropped.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        engine.sweep_expired_holds().await;
    }
}

/// Compact the WAL once `threshold` appends have piled up since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// One compactor check. `Ok(true)` when a compaction ran.
pub async fn compact_if_due(
    engine: &Engine,
    threshold: u64,
) -> Result<bool, crate::engine::EngineError> {
    if threshold == 0 || engine.wal_appends_since_compact().await < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}
