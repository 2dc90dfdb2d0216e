use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Blackout, DateRange, Day};

/// Date-range exclusions per resource, kept sorted by start date.
pub struct BlackoutRegistry {
    by_resource: DashMap<Ulid, Vec<Blackout>>,
    /// blackout id → resource id
    owners: DashMap<Ulid, Ulid>,
}

impl Default for BlackoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackoutRegistry {
    pub fn new() -> Self {
        Self {
            by_resource: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    pub fn is_blacked_out(&self, resource_id: Ulid, date: Day) -> bool {
        self.by_resource
            .get(&resource_id)
            .is_some_and(|list| list.iter().any(|b| b.range.contains(date)))
    }

    /// Blackouts of `resource_id` that overlap `range`.
    pub fn covering(&self, resource_id: Ulid, range: DateRange) -> Vec<DateRange> {
        self.by_resource
            .get(&resource_id)
            .map(|list| {
                list.iter()
                    .map(|b| b.range)
                    .filter(|r| r.overlaps(&range))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list(&self, resource_id: Ulid) -> Vec<Blackout> {
        self.by_resource
            .get(&resource_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, resource_id: Ulid) -> usize {
        self.by_resource.get(&resource_id).map_or(0, |list| list.len())
    }

    pub fn owner(&self, id: &Ulid) -> Option<Ulid> {
        self.owners.get(id).map(|e| *e.value())
    }

    pub fn insert(&self, blackout: Blackout) {
        self.owners.insert(blackout.id, blackout.resource_id);
        let mut list = self.by_resource.entry(blackout.resource_id).or_default();
        list.retain(|b| b.id != blackout.id);
        let at = list.partition_point(|b| (b.range.start, b.id) < (blackout.range.start, blackout.id));
        list.insert(at, blackout);
    }

    pub fn remove(&self, id: Ulid) -> Option<Blackout> {
        let (_, resource_id) = self.owners.remove(&id)?;
        let mut list = self.by_resource.get_mut(&resource_id)?;
        let pos = list.iter().position(|b| b.id == id)?;
        Some(list.remove(pos))
    }

    /// Every blackout, grouped by resource.
    pub fn all(&self) -> Vec<Blackout> {
        let mut out: Vec<Blackout> = self
            .by_resource
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.resource_id, b.range.start, b.id));
        out
    }
}
