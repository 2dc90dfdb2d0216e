use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability::HOLDS_FINISHED_TOTAL;

use super::validate::validate_ref;
use super::{Engine, EngineError};

impl Engine {
    /// Turn an ACTIVE, unexpired hold into a permanent allocation.
    ///
    /// Expiry is judged against the clock here, not against whether the
    /// sweeper has run. Capacity doesn't move: the units leave `held` and
    /// join `allocated`.
    pub async fn confirm_hold(
        &self,
        id: Ulid,
        order_id: &str,
        line_item_id: &str,
    ) -> Result<Allocation, EngineError> {
        validate_ref("order_id", order_id)?;
        validate_ref("line_item_id", line_item_id)?;

        let _gate = self.commit_gate.read().await;
        let key = self.hold_key(id)?;
        let mut day = self.lock_day(key).await;
        let hold = self.get_hold(id)?;
        if !matches!(hold.status.step(HoldTransition::Confirm), Step::To(_)) {
            return Err(EngineError::HoldNotActive { id, status: hold.status });
        }
        let now = self.now_ms();
        if hold.is_expired(now) {
            return Err(EngineError::HoldExpired(id));
        }

        let allocation = Allocation {
            id: Ulid::new(),
            hold_id: id,
            resource_id: hold.resource_id,
            date: hold.date,
            quantity: hold.quantity,
            order_id: order_id.to_owned(),
            line_item_id: line_item_id.to_owned(),
            created_at: now,
        };
        self.commit_day(
            &mut day,
            Event::HoldConfirmed {
                id,
                allocation: allocation.clone(),
            },
        )
        .await?;

        metrics::counter!(HOLDS_FINISHED_TOTAL, "outcome" => "confirmed").increment(1);
        debug!(hold = %id, allocation = %allocation.id, order = order_id, "hold confirmed");
        Ok(allocation)
    }

    pub fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        self.allocations
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Allocations recorded for an order, oldest first.
    pub fn allocations_for_order(&self, order_id: &str) -> Vec<Allocation> {
        let ids = self
            .orders
            .get(order_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Allocation> = ids
            .iter()
            .filter_map(|id| self.allocations.get(id).map(|a| a.value().clone()))
            .collect();
        out.sort_by_key(|a| (a.created_at, a.id));
        out
    }

    /// Allocations consuming capacity on one date.
    pub async fn allocations_on(&self, resource_id: Ulid, date: Day) -> Vec<Allocation> {
        let Some(row) = self.capacity.get(&DayKey::new(resource_id, date)) else {
            return Vec::new();
        };
        let ids = row.lock().await.allocations.clone();
        ids.iter()
            .filter_map(|id| self.allocations.get(id).map(|a| a.value().clone()))
            .collect()
    }
}
