use ulid::Ulid;

use crate::model::*;

use super::validate::{validate_quantity, validate_range};
use super::{Engine, EngineError};

// ── Per-day verdict ───────────────────────────────────────────────

/// Combine a ledger snapshot with the blackout and resource flags.
///
/// A date is bookable for `quantity` when the resource is active, the date
/// is not blacked out, and enough units are free right now. Holds that are
/// past their expiry but not yet swept still count as held.
pub fn day_availability(
    ledger: &DayLedger,
    is_blackout: bool,
    resource_active: bool,
    quantity: u32,
) -> DayAvailability {
    DayAvailability {
        date: ledger.date,
        max_capacity: ledger.max_capacity,
        available_capacity: ledger.available_capacity,
        held: ledger.held,
        allocated: ledger.allocated,
        is_blackout,
        bookable: resource_active && !is_blackout && ledger.available_capacity >= quantity,
    }
}

impl Engine {
    /// Advisory per-date view of `[start, end]`. Reads only; the
    /// authoritative check happens inside `create_hold`.
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        start: Day,
        end: Day,
        quantity: u32,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        validate_quantity(quantity)?;
        let range = validate_range(start, end)?;
        let resource = self.get_resource(resource_id)?;
        let blackouts = self.blackouts.covering(resource_id, range);

        let mut out = Vec::with_capacity(range.len_days() as usize);
        for date in range.days() {
            let ledger = self
                .capacity
                .ledger(DayKey::new(resource_id, date), resource.max_capacity)
                .await;
            let is_blackout = blackouts.iter().any(|b| b.contains(date));
            out.push(day_availability(&ledger, is_blackout, resource.active, quantity));
        }
        Ok(out)
    }

    /// Dates in `[start, end]` where at least `min_capacity` units could be
    /// held right now.
    pub async fn available_dates(
        &self,
        resource_id: Ulid,
        start: Day,
        end: Day,
        min_capacity: u32,
    ) -> Result<Vec<Day>, EngineError> {
        let days = self
            .check_availability(resource_id, start, end, min_capacity.max(1))
            .await?;
        Ok(days.into_iter().filter(|d| d.bookable).map(|d| d.date).collect())
    }

    /// Ledger numbers for one (resource, date).
    pub async fn day_ledger(&self, resource_id: Ulid, date: Day) -> Result<DayLedger, EngineError> {
        let resource = self.get_resource(resource_id)?;
        Ok(self
            .capacity
            .ledger(DayKey::new(resource_id, date), resource.max_capacity)
            .await)
    }
}
