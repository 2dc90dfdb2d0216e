use tracing::debug;
use ulid::Ulid;

use crate::limits::{MAX_BLACKOUTS_PER_RESOURCE, MAX_RESOURCES};
use crate::model::*;

use super::validate::*;
use super::{Engine, EngineError};

impl Engine {
    // ── Resource catalog mirror ──────────────────────────────

    /// Register a resource or replace its mirrored fields. A new
    /// `max_capacity` applies to dates that have no logged row yet.
    ///
    /// Takes the commit gate exclusively: a row write reads the resource
    /// max when it locks the row, and the max must not move before that
    /// write is logged.
    pub async fn upsert_resource(&self, resource: Resource) -> Result<Resource, EngineError> {
        validate_name(&resource.name)?;
        validate_capacity(resource.max_capacity)?;

        let _gate = self.commit_gate.write().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.resources.contains_key(&resource.id) && self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        self.commit_catalog(Event::ResourceUpserted {
            resource: resource.clone(),
        })
        .await?;
        debug!(resource = %resource.id, max = resource.max_capacity, active = resource.active, "resource upserted");
        Ok(resource)
    }

    pub fn get_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.resources
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Resources sorted by name, optionally of one kind.
    pub fn list_resources(&self, kind: Option<ResourceKind>, include_inactive: bool) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .resources
            .iter()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| include_inactive || r.active)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    // ── Per-date capacity ────────────────────────────────────

    /// Set the max for every date in `[start, end]`.
    ///
    /// All rows are locked in date order and checked before any is written:
    /// if held plus allocated units on some date exceed `max_capacity`,
    /// nothing changes.
    pub async fn set_capacity(
        &self,
        resource_id: Ulid,
        start: Day,
        end: Day,
        max_capacity: u32,
    ) -> Result<Vec<DayLedger>, EngineError> {
        validate_capacity(max_capacity)?;
        let range = validate_range(start, end)?;
        self.get_resource(resource_id)?;

        let _gate = self.commit_gate.read().await;
        let mut rows = Vec::with_capacity(range.len_days() as usize);
        for date in range.days() {
            rows.push(self.lock_day(DayKey::new(resource_id, date)).await);
        }

        if let Some(day) = rows.iter().find(|d| d.consumed() > max_capacity) {
            return Err(EngineError::CapacityExceeded {
                resource_id,
                date: day.key.date,
                requested: day.consumed(),
                available: max_capacity,
            });
        }

        let mut ledgers = Vec::with_capacity(rows.len());
        for day in rows.iter_mut() {
            // An explicit max pins the row even when it matches the
            // resource's current one.
            if !day.logged || day.max_capacity != max_capacity {
                let event = Event::DayCapacitySet {
                    resource_id,
                    date: day.key.date,
                    max_capacity,
                };
                self.commit_day(day, event).await?;
            }
            ledgers.push(day.ledger());
        }
        debug!(resource = %resource_id, %start, %end, max_capacity, "capacity set");
        Ok(ledgers)
    }

    // ── Blackouts ────────────────────────────────────────────

    pub async fn add_blackout(
        &self,
        resource_id: Ulid,
        start: Day,
        end: Day,
        reason: Option<String>,
    ) -> Result<Blackout, EngineError> {
        let range = DateRange::checked(start, end).ok_or_else(|| {
            EngineError::validation(format!("end date {end} is before start date {start}"))
        })?;
        validate_reason(reason.as_deref())?;

        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        self.get_resource(resource_id)?;
        if self.blackouts.count(resource_id) >= MAX_BLACKOUTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blackouts on resource"));
        }
        let blackout = Blackout {
            id: Ulid::new(),
            resource_id,
            range,
            reason,
        };
        self.commit_catalog(Event::BlackoutAdded {
            blackout: blackout.clone(),
        })
        .await?;
        debug!(blackout = %blackout.id, resource = %resource_id, %start, %end, "blackout added");
        Ok(blackout)
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<Blackout, EngineError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let resource_id = self.blackouts.owner(&id).ok_or(EngineError::NotFound(id))?;
        let blackout = self
            .blackouts
            .list(resource_id)
            .into_iter()
            .find(|b| b.id == id)
            .ok_or(EngineError::NotFound(id))?;
        self.commit_catalog(Event::BlackoutRemoved { id, resource_id })
            .await?;
        debug!(blackout = %id, resource = %resource_id, "blackout removed");
        Ok(blackout)
    }

    /// Blackouts of a resource, ordered by start date.
    pub fn list_blackouts(&self, resource_id: Ulid) -> Result<Vec<Blackout>, EngineError> {
        self.get_resource(resource_id)?;
        Ok(self.blackouts.list(resource_id))
    }

    pub fn is_blacked_out(&self, resource_id: Ulid, date: Day) -> bool {
        self.blackouts.is_blacked_out(resource_id, date)
    }
}
