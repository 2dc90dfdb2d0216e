use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{HOLDS_FINISHED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

use super::{Engine, EngineError};

impl Engine {
    /// ACTIVE holds whose expiry is strictly before `now`.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, DayKey)> {
        let mut expired: Vec<(Ulid, DayKey)> = self
            .holds
            .iter()
            .filter(|h| h.status == HoldStatus::Active && h.is_expired(now))
            .map(|h| (h.id, h.value().key()))
            .collect();
        expired.sort_by_key(|(id, _)| *id);
        expired
    }

    /// Move one hold to EXPIRED if it is still ACTIVE and still past its
    /// expiry when the row lock is taken. `Ok(false)` means someone else got
    /// there first (confirmed, released, extended, already expired).
    pub async fn expire_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.hold_key(id)?;
        let mut day = self.lock_day(key).await;
        let hold = self.get_hold(id)?;
        if !matches!(hold.status.step(HoldTransition::Expire), Step::To(_))
            || !hold.is_expired(self.now_ms())
        {
            return Ok(false);
        }
        let event = Event::HoldExpired {
            id,
            resource_id: key.resource_id,
            date: key.date,
        };
        self.commit_day(&mut day, event).await?;
        metrics::counter!(HOLDS_FINISHED_TOTAL, "outcome" => "expired").increment(1);
        debug!(hold = %id, available = day.available_capacity, "hold expired");
        Ok(true)
    }

    /// One pass of the expiry sweep. Failures are logged and left for the
    /// next pass; they never abort the sweep.
    pub async fn sweep_expired_holds(&self) -> SweepReport {
        let started = Instant::now();
        let candidates = self.collect_expired_holds(self.now_ms());
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for (id, key) in candidates {
            match self.expire_hold(id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!(SWEEP_FAILURES_TOTAL).increment(1);
                    warn!(hold = %id, resource = %key.resource_id, date = %key.date, "expiry failed: {e}");
                }
            }
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report.expired > 0 || report.failed > 0 {
            info!(
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "expiry sweep"
            );
        }
        report
    }
}
