use std::time::Duration;

use tracing::debug;
use ulid::Ulid;

use crate::clock::duration_ms;
use crate::limits::{MAX_GROUP_DATES, MAX_HOLD_TTL_MS};
use crate::model::*;
use crate::observability::{
    HOLDS_FINISHED_TOTAL, HOLDS_PLACED_TOTAL, HOLDS_REJECTED_TOTAL, IDEMPOTENT_REPLAYS_TOTAL,
};

use super::validate::*;
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub resource_id: Ulid,
    pub date: Day,
    pub quantity: u32,
    pub idempotency_token: String,
    /// Defaults to the engine's configured TTL.
    pub ttl: Option<Duration>,
    pub customer_ref: Option<String>,
}

/// One reservation across several dates of the same resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldGroupRequest {
    pub resource_id: Ulid,
    pub dates: Vec<Day>,
    pub quantity: u32,
    pub idempotency_token: String,
    pub ttl: Option<Duration>,
    pub customer_ref: Option<String>,
}

impl Engine {
    /// Place a time-limited hold, or return the hold already placed under
    /// the same idempotency token.
    pub async fn create_hold(&self, req: HoldRequest) -> Result<Hold, EngineError> {
        let result = self.create_hold_inner(&req).await;
        if let Err(e) = &result {
            metrics::counter!(HOLDS_REJECTED_TOTAL, "reason" => e.kind()).increment(1);
            debug!(resource = %req.resource_id, date = %req.date, "hold refused: {e}");
        }
        result
    }

    async fn create_hold_inner(&self, req: &HoldRequest) -> Result<Hold, EngineError> {
        validate_token(&req.idempotency_token)?;
        validate_quantity(req.quantity)?;
        if let Some(r) = &req.customer_ref {
            validate_ref("customer_ref", r)?;
        }
        let ttl_ms = resolve_ttl(req.ttl, self.config.default_hold_ttl_ms)?;
        self.bookable_resource(req.resource_id)?;
        validate_not_past(req.date, self.today())?;

        let _gate = self.commit_gate.read().await;
        // Concurrent requests with the same token queue here; the loser
        // finds the winner's hold id once it gets the slot.
        let mut claimed = Self::token_slot(&self.tokens, &req.idempotency_token)
            .lock_owned()
            .await;
        if let Some(existing) = *claimed
            && let Some(hold) = self.holds.get(&existing).map(|h| h.value().clone())
        {
            return Self::same_hold(hold, req);
        }

        match self.place_hold(req, ttl_ms, None).await {
            Ok(hold) => {
                *claimed = Some(hold.id);
                Ok(hold)
            }
            Err(e) => {
                drop(claimed);
                Self::forget_unused_slot(&self.tokens, &req.idempotency_token);
                Err(e)
            }
        }
    }

    fn same_hold(hold: Hold, req: &HoldRequest) -> Result<Hold, EngineError> {
        if !hold.same_request(req.resource_id, req.date, req.quantity) {
            return Err(EngineError::IdempotencyConflict {
                token: req.idempotency_token.clone(),
            });
        }
        metrics::counter!(IDEMPOTENT_REPLAYS_TOTAL).increment(1);
        debug!(hold = %hold.id, status = %hold.status, "idempotent replay");
        Ok(hold)
    }

    /// Existing, active resource.
    fn bookable_resource(&self, resource_id: Ulid) -> Result<Resource, EngineError> {
        let resource = self
            .resources
            .get(&resource_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(resource_id))?;
        if !resource.active {
            return Err(EngineError::validation(format!(
                "resource {resource_id} is inactive"
            )));
        }
        Ok(resource)
    }

    /// Blackout check, conditional decrement and hold insert, all under the
    /// row lock. Caller holds the commit gate and the token slot.
    async fn place_hold(
        &self,
        req: &HoldRequest,
        ttl_ms: Ms,
        group: Option<GroupRef>,
    ) -> Result<Hold, EngineError> {
        let key = DayKey::new(req.resource_id, req.date);
        let mut day = self.lock_day(key).await;

        if self.blackouts.is_blacked_out(req.resource_id, req.date) {
            return Err(EngineError::BlackoutConflict {
                resource_id: req.resource_id,
                date: req.date,
            });
        }
        if day.checked_adjust(-(req.quantity as i64)).is_none() {
            return Err(EngineError::CapacityExceeded {
                resource_id: req.resource_id,
                date: req.date,
                requested: req.quantity,
                available: day.available_capacity,
            });
        }

        let now = self.now_ms();
        let hold = Hold {
            id: Ulid::new(),
            resource_id: req.resource_id,
            date: req.date,
            quantity: req.quantity,
            customer_ref: req.customer_ref.clone(),
            idempotency_token: req.idempotency_token.clone(),
            group,
            created_at: now,
            expires_at: now + ttl_ms,
            status: HoldStatus::Active,
        };
        self.commit_day(&mut day, Event::HoldPlaced { hold: hold.clone() })
            .await?;

        metrics::counter!(HOLDS_PLACED_TOTAL).increment(1);
        debug!(
            hold = %hold.id,
            resource = %hold.resource_id,
            date = %hold.date,
            quantity = hold.quantity,
            available = day.available_capacity,
            "hold placed"
        );
        Ok(hold)
    }

    /// Hand an ACTIVE hold's units back. Releasing a RELEASED or EXPIRED
    /// hold is a no-op; a CONFIRMED one is an error.
    pub async fn release_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        let _gate = self.commit_gate.read().await;
        self.release_hold_inner(id).await
    }

    async fn release_hold_inner(&self, id: Ulid) -> Result<Hold, EngineError> {
        let key = self.hold_key(id)?;
        let mut day = self.lock_day(key).await;
        let hold = self.get_hold(id)?;
        match hold.status.step(HoldTransition::Release) {
            Step::Stay => Ok(hold),
            Step::Reject => Err(EngineError::CannotReleaseConfirmed(id)),
            Step::To(_) => {
                let event = Event::HoldReleased {
                    id,
                    resource_id: key.resource_id,
                    date: key.date,
                };
                self.commit_day(&mut day, event).await?;
                metrics::counter!(HOLDS_FINISHED_TOTAL, "outcome" => "released").increment(1);
                debug!(hold = %id, available = day.available_capacity, "hold released");
                self.get_hold(id)
            }
        }
    }

    /// Push an ACTIVE hold's expiry out by `extra`. Total lifetime from
    /// creation never exceeds 24 hours.
    pub async fn extend_hold(&self, id: Ulid, extra: Duration) -> Result<Hold, EngineError> {
        let extra_ms = duration_ms(extra);
        if extra_ms <= 0 {
            return Err(EngineError::validation("extension must be positive"));
        }

        let _gate = self.commit_gate.read().await;
        let key = self.hold_key(id)?;
        let mut day = self.lock_day(key).await;
        let hold = self.get_hold(id)?;
        if !matches!(hold.status.step(HoldTransition::Extend), Step::To(_)) {
            return Err(EngineError::HoldNotActive { id, status: hold.status });
        }
        if hold.is_expired(self.now_ms()) {
            return Err(EngineError::HoldExpired(id));
        }

        let ceiling = hold.created_at.saturating_add(MAX_HOLD_TTL_MS);
        let expires_at = hold.expires_at.saturating_add(extra_ms).min(ceiling);
        if expires_at <= hold.expires_at {
            return Ok(hold);
        }
        let event = Event::HoldExtended {
            id,
            resource_id: key.resource_id,
            date: key.date,
            expires_at,
        };
        self.commit_day(&mut day, event).await?;
        debug!(hold = %id, expires_at, "hold extended");
        self.get_hold(id)
    }

    pub fn get_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        self.holds
            .get(&id)
            .map(|h| h.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) fn hold_key(&self, id: Ulid) -> Result<DayKey, EngineError> {
        self.holds
            .get(&id)
            .map(|h| h.value().key())
            .ok_or(EngineError::NotFound(id))
    }

    /// ACTIVE holds on one date, oldest first. Includes holds past their
    /// expiry that the sweeper hasn't reached yet.
    pub async fn active_holds(&self, resource_id: Ulid, date: Day) -> Vec<Hold> {
        let Some(row) = self.capacity.get(&DayKey::new(resource_id, date)) else {
            return Vec::new();
        };
        let ids = row.lock().await.holds.clone();
        ids.iter()
            .filter_map(|id| self.holds.get(id).map(|h| h.value().clone()))
            .filter(|h| h.status == HoldStatus::Active)
            .collect()
    }

    /// Hold the same quantity on several dates, all or nothing.
    ///
    /// Member holds are placed in date order. If any date fails, the holds
    /// already placed are released and the error is returned. Repeating the
    /// call with the same token returns the group as it stands, even if it
    /// was rolled back.
    pub async fn create_hold_group(&self, req: HoldGroupRequest) -> Result<HoldGroup, EngineError> {
        let result = self.create_hold_group_inner(&req).await;
        if let Err(e) = &result {
            metrics::counter!(HOLDS_REJECTED_TOTAL, "reason" => e.kind()).increment(1);
            debug!(resource = %req.resource_id, "hold group refused: {e}");
        }
        result
    }

    async fn create_hold_group_inner(&self, req: &HoldGroupRequest) -> Result<HoldGroup, EngineError> {
        validate_token(&req.idempotency_token)?;
        validate_quantity(req.quantity)?;
        if let Some(r) = &req.customer_ref {
            validate_ref("customer_ref", r)?;
        }
        let ttl_ms = resolve_ttl(req.ttl, self.config.default_hold_ttl_ms)?;

        let mut dates = req.dates.clone();
        dates.sort();
        dates.dedup();
        if dates.is_empty() {
            return Err(EngineError::validation("a hold group needs at least one date"));
        }
        if dates.len() > MAX_GROUP_DATES {
            return Err(EngineError::LimitExceeded("too many dates in hold group"));
        }
        self.bookable_resource(req.resource_id)?;
        let today = self.today();
        for date in &dates {
            validate_not_past(*date, today)?;
        }

        let _gate = self.commit_gate.read().await;
        let mut claimed = Self::token_slot(&self.group_tokens, &req.idempotency_token)
            .lock_owned()
            .await;
        if let Some(group_id) = *claimed {
            return self.existing_group(group_id, req);
        }

        let group = GroupRef {
            id: Ulid::new(),
            token: req.idempotency_token.clone(),
        };
        let mut placed: Vec<Hold> = Vec::with_capacity(dates.len());
        let mut failure = None;
        for date in dates {
            let member = HoldRequest {
                resource_id: req.resource_id,
                date,
                quantity: req.quantity,
                idempotency_token: format!("{}/{}/{}", req.idempotency_token, group.id, date),
                ttl: req.ttl,
                customer_ref: req.customer_ref.clone(),
            };
            match self
                .place_hold(&member, ttl_ms, Some(group.clone()))
                .await
            {
                Ok(hold) => placed.push(hold),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(err) = failure else {
            *claimed = Some(group.id);
            debug!(group = %group.id, holds = placed.len(), "hold group placed");
            return Ok(HoldGroup {
                group_id: group.id,
                holds: placed,
            });
        };

        for hold in &placed {
            if let Err(e) = self.release_hold_inner(hold.id).await {
                // Left ACTIVE; the sweeper reclaims it at expiry.
                tracing::warn!(hold = %hold.id, group = %group.id, "group rollback release failed: {e}");
            }
        }
        if placed.is_empty() {
            drop(claimed);
            Self::forget_unused_slot(&self.group_tokens, &req.idempotency_token);
        } else {
            *claimed = Some(group.id);
        }
        debug!(group = %group.id, rolled_back = placed.len(), "hold group rolled back: {err}");
        Err(err)
    }

    fn existing_group(&self, group_id: Ulid, req: &HoldGroupRequest) -> Result<HoldGroup, EngineError> {
        let holds: Vec<Hold> = self
            .groups
            .get(&group_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.holds.get(id).map(|h| h.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        let matches = holds
            .first()
            .is_some_and(|h| h.resource_id == req.resource_id && h.quantity == req.quantity);
        if !matches {
            return Err(EngineError::IdempotencyConflict {
                token: req.idempotency_token.clone(),
            });
        }
        metrics::counter!(IDEMPOTENT_REPLAYS_TOTAL).increment(1);
        Ok(HoldGroup { group_id, holds })
    }

    /// Members of a hold group, in date order.
    pub fn hold_group(&self, group_id: Ulid) -> Result<HoldGroup, EngineError> {
        let ids = self
            .groups
            .get(&group_id)
            .map(|ids| ids.value().clone())
            .ok_or(EngineError::NotFound(group_id))?;
        let holds = ids
            .iter()
            .filter_map(|id| self.holds.get(id).map(|h| h.value().clone()))
            .collect();
        Ok(HoldGroup { group_id, holds })
    }
}
