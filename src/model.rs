use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for every instant (hold expiry, creation time).
pub type Ms = i64;

/// A calendar day in the engine's booking time zone. No time-of-day.
pub type Day = NaiveDate;

/// Key of one capacity row: a resource on a calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub resource_id: Ulid,
    pub date: Day,
}

impl DayKey {
    pub fn new(resource_id: Ulid, date: Day) -> Self {
        Self { resource_id, date }
    }
}

/// Inclusive date range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// `None` when `end` is before `start`.
    pub fn checked(start: Day, end: Day) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: Day) -> Self {
        Self { start: date, end: date }
    }

    pub fn contains(&self, date: Day) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Number of days, counting both ends.
    pub fn len_days(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days() + 1
    }

    /// Every date in the range, ascending.
    pub fn days(&self) -> impl Iterator<Item = Day> + use<> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| d.succ_opt().filter(|next| *next <= end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Vehicle,
    Tour,
    Guide,
}

/// Local mirror of a catalog resource. Only `max_capacity` and `active`
/// matter to the capacity engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: String,
    /// Capacity units per day for dates without their own row.
    pub max_capacity: u32,
    pub active: bool,
}

/// Ledger row for one (resource, date).
///
/// `available_capacity + held + allocated == max_capacity` holds whenever the
/// row lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityDay {
    pub key: DayKey,
    pub max_capacity: u32,
    pub available_capacity: u32,
    /// Units held by ACTIVE holds.
    pub held: u32,
    /// Units retained by allocations.
    pub allocated: u32,
    /// Every hold ever placed on this row, in placement order.
    pub holds: Vec<Ulid>,
    pub allocations: Vec<Ulid>,
    /// Set once an event for this row is in the log. Until then the row
    /// tracks the resource's max, because replay would never see it.
    pub logged: bool,
}

impl CapacityDay {
    pub fn new(key: DayKey, max_capacity: u32) -> Self {
        Self {
            key,
            max_capacity,
            available_capacity: max_capacity,
            held: 0,
            allocated: 0,
            holds: Vec::new(),
            allocations: Vec::new(),
            logged: false,
        }
    }

    /// Reset an unlogged row to `max`. Logged rows keep their own max.
    pub fn follow_implicit_max(&mut self, max: u32) {
        if !self.logged {
            self.max_capacity = max;
            self.available_capacity = max;
        }
    }

    /// `available_capacity` after applying `delta`, or `None` if the result
    /// would leave `[0, max_capacity]`. Does not mutate.
    pub fn checked_adjust(&self, delta: i64) -> Option<u32> {
        let next = self.available_capacity as i64 + delta;
        if next < 0 || next > self.max_capacity as i64 {
            return None;
        }
        Some(next as u32)
    }

    /// Units no longer available, whether held or allocated.
    pub fn consumed(&self) -> u32 {
        self.max_capacity - self.available_capacity
    }

    pub fn is_balanced(&self) -> bool {
        self.available_capacity as u64 + self.held as u64 + self.allocated as u64
            == self.max_capacity as u64
    }

    pub fn ledger(&self) -> DayLedger {
        DayLedger {
            resource_id: self.key.resource_id,
            date: self.key.date,
            max_capacity: self.max_capacity,
            available_capacity: self.available_capacity,
            held: self.held,
            allocated: self.allocated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub range: DateRange,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Active,
    Confirmed,
    Released,
    Expired,
}

/// Things that can happen to a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldTransition {
    Release,
    Confirm,
    Expire,
    Extend,
}

/// Result of looking a transition up in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to this status (may be the same status, e.g. extending).
    To(HoldStatus),
    /// Already where the transition would lead; succeed without change.
    Stay,
    /// Illegal from the current status.
    Reject,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HoldStatus::Active)
    }

    /// The hold lifecycle. ACTIVE is the only status with outgoing edges.
    pub fn step(self, via: HoldTransition) -> Step {
        use HoldStatus::*;
        use HoldTransition::*;
        match (self, via) {
            (Active, Release) => Step::To(Released),
            (Active, Confirm) => Step::To(Confirmed),
            (Active, Expire) => Step::To(Expired),
            (Active, Extend) => Step::To(Active),
            (Released | Expired, Release) => Step::Stay,
            (Confirmed, Release) => Step::Reject,
            (_, Confirm) => Step::Reject,
            (_, Expire) => Step::Stay,
            (_, Extend) => Step::Reject,
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HoldStatus::Active => "ACTIVE",
            HoldStatus::Confirmed => "CONFIRMED",
            HoldStatus::Released => "RELEASED",
            HoldStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Membership of a hold in a multi-date reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: Ulid,
    /// Caller's token for the whole group.
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: Day,
    pub quantity: u32,
    pub customer_ref: Option<String>,
    pub idempotency_token: String,
    pub group: Option<GroupRef>,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub status: HoldStatus,
}

impl Hold {
    pub fn key(&self) -> DayKey {
        DayKey::new(self.resource_id, self.date)
    }

    /// Past its TTL. Says nothing about status.
    pub fn is_expired(&self, now: Ms) -> bool {
        now > self.expires_at
    }

    /// Whether a retried request carries the same parameters as this hold.
    pub fn same_request(&self, resource_id: Ulid, date: Day, quantity: u32) -> bool {
        self.resource_id == resource_id && self.date == date && self.quantity == quantity
    }
}

/// Permanent record of consumed capacity. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub hold_id: Ulid,
    pub resource_id: Ulid,
    pub date: Day,
    pub quantity: u32,
    pub order_id: String,
    pub line_item_id: String,
    pub created_at: Ms,
}

/// WAL record. Flat, one variant per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ResourceUpserted {
        resource: Resource,
    },
    DayCapacitySet {
        resource_id: Ulid,
        date: Day,
        max_capacity: u32,
    },
    BlackoutAdded {
        blackout: Blackout,
    },
    BlackoutRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Capacity decrement and hold insert in one record.
    HoldPlaced {
        hold: Hold,
    },
    HoldExtended {
        id: Ulid,
        resource_id: Ulid,
        date: Day,
        expires_at: Ms,
    },
    HoldReleased {
        id: Ulid,
        resource_id: Ulid,
        date: Day,
    },
    HoldExpired {
        id: Ulid,
        resource_id: Ulid,
        date: Day,
    },
    HoldConfirmed {
        id: Ulid,
        allocation: Allocation,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceUpserted { resource } => resource.id,
            Event::BlackoutAdded { blackout } => blackout.resource_id,
            Event::HoldPlaced { hold } => hold.resource_id,
            Event::HoldConfirmed { allocation, .. } => allocation.resource_id,
            Event::DayCapacitySet { resource_id, .. }
            | Event::BlackoutRemoved { resource_id, .. }
            | Event::HoldExtended { resource_id, .. }
            | Event::HoldReleased { resource_id, .. }
            | Event::HoldExpired { resource_id, .. } => *resource_id,
        }
    }

    /// The capacity row this event mutates, if it touches one.
    pub fn day_key(&self) -> Option<DayKey> {
        match self {
            Event::ResourceUpserted { .. }
            | Event::BlackoutAdded { .. }
            | Event::BlackoutRemoved { .. } => None,
            Event::HoldPlaced { hold } => Some(hold.key()),
            Event::HoldConfirmed { allocation, .. } => {
                Some(DayKey::new(allocation.resource_id, allocation.date))
            }
            Event::DayCapacitySet { resource_id, date, .. }
            | Event::HoldExtended { resource_id, date, .. }
            | Event::HoldReleased { resource_id, date, .. }
            | Event::HoldExpired { resource_id, date, .. } => Some(DayKey::new(*resource_id, *date)),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayLedger {
    pub resource_id: Ulid,
    pub date: Day,
    pub max_capacity: u32,
    pub available_capacity: u32,
    pub held: u32,
    pub allocated: u32,
}

impl DayLedger {
    /// Ledger of a row that was never written.
    pub fn untouched(key: DayKey, max_capacity: u32) -> Self {
        Self {
            resource_id: key.resource_id,
            date: key.date,
            max_capacity,
            available_capacity: max_capacity,
            held: 0,
            allocated: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: Day,
    pub max_capacity: u32,
    pub available_capacity: u32,
    pub held: u32,
    pub allocated: u32,
    pub is_blackout: bool,
    /// Whether a hold for the queried quantity would likely succeed.
    pub bookable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldGroup {
    pub group_id: Ulid,
    pub holds: Vec<Hold>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// ACTIVE holds found past their expiry.
    pub examined: usize,
    pub expired: usize,
    /// Lost the race to a confirm/release, or extended in the meantime.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub active_holds: usize,
    pub confirmed_holds: usize,
    pub released_holds: usize,
    pub expired_holds: usize,
    /// ACTIVE but already past `expires_at`; waiting for the sweeper.
    pub overdue_holds: usize,
    pub allocations: usize,
    pub active_resources: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    #[test]
    fn range_basics() {
        let r = DateRange::new(d("2025-06-01"), d("2025-06-03"));
        assert_eq!(r.len_days(), 3);
        assert!(r.contains(d("2025-06-01")));
        assert!(r.contains(d("2025-06-03"))); // inclusive end
        assert!(!r.contains(d("2025-06-04")));
        assert!(!r.contains(d("2025-05-31")));
    }

    #[test]
    fn range_days_iterates_inclusive() {
        let r = DateRange::new(d("2025-02-27"), d("2025-03-02"));
        let days: Vec<Day> = r.days().collect();
        assert_eq!(
            days,
            vec![d("2025-02-27"), d("2025-02-28"), d("2025-03-01"), d("2025-03-02")]
        );
    }

    #[test]
    fn range_single_day() {
        let r = DateRange::single(d("2025-06-01"));
        assert_eq!(r.len_days(), 1);
        assert_eq!(r.days().count(), 1);
    }

    #[test]
    fn range_checked_rejects_reversed() {
        assert!(DateRange::checked(d("2025-06-02"), d("2025-06-01")).is_none());
        assert!(DateRange::checked(d("2025-06-01"), d("2025-06-01")).is_some());
    }

    #[test]
    fn range_overlap() {
        let a = DateRange::new(d("2025-06-01"), d("2025-06-05"));
        let b = DateRange::new(d("2025-06-05"), d("2025-06-09"));
        let c = DateRange::new(d("2025-06-06"), d("2025-06-09"));
        assert!(a.overlaps(&b)); // shared end day counts
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn capacity_day_checked_adjust_bounds() {
        let key = DayKey::new(Ulid::new(), d("2025-06-01"));
        let mut day = CapacityDay::new(key, 4);
        assert_eq!(day.checked_adjust(-4), Some(0));
        assert_eq!(day.checked_adjust(-5), None);
        assert_eq!(day.checked_adjust(1), None); // above max
        day.available_capacity = 1;
        assert_eq!(day.checked_adjust(3), Some(4));
        assert_eq!(day.consumed(), 3);
    }

    #[test]
    fn capacity_day_balance() {
        let key = DayKey::new(Ulid::new(), d("2025-06-01"));
        let mut day = CapacityDay::new(key, 5);
        assert!(day.is_balanced());
        day.available_capacity = 2;
        day.held = 2;
        assert!(!day.is_balanced());
        day.allocated = 1;
        assert!(day.is_balanced());
    }

    #[test]
    fn only_unlogged_rows_follow_the_resource_max() {
        let key = DayKey::new(Ulid::new(), d("2025-06-01"));
        let mut day = CapacityDay::new(key, 4);
        day.follow_implicit_max(10);
        assert_eq!((day.max_capacity, day.available_capacity), (10, 10));

        day.logged = true;
        day.follow_implicit_max(2);
        assert_eq!((day.max_capacity, day.available_capacity), (10, 10));
    }

    #[test]
    fn status_table_active_edges() {
        let s = HoldStatus::Active;
        assert_eq!(s.step(HoldTransition::Release), Step::To(HoldStatus::Released));
        assert_eq!(s.step(HoldTransition::Confirm), Step::To(HoldStatus::Confirmed));
        assert_eq!(s.step(HoldTransition::Expire), Step::To(HoldStatus::Expired));
        assert_eq!(s.step(HoldTransition::Extend), Step::To(HoldStatus::Active));
    }

    #[test]
    fn status_table_terminal_states_never_move() {
        for s in [HoldStatus::Confirmed, HoldStatus::Released, HoldStatus::Expired] {
            assert!(s.is_terminal());
            for via in [
                HoldTransition::Release,
                HoldTransition::Confirm,
                HoldTransition::Expire,
                HoldTransition::Extend,
            ] {
                assert!(!matches!(s.step(via), Step::To(_)), "{s} moved via {via:?}");
            }
        }
    }

    #[test]
    fn status_table_release_rules() {
        assert_eq!(HoldStatus::Released.step(HoldTransition::Release), Step::Stay);
        assert_eq!(HoldStatus::Expired.step(HoldTransition::Release), Step::Stay);
        assert_eq!(HoldStatus::Confirmed.step(HoldTransition::Release), Step::Reject);
        assert_eq!(HoldStatus::Confirmed.step(HoldTransition::Expire), Step::Stay);
    }

    #[test]
    fn hold_expiry_is_strict() {
        let hold = Hold {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            date: d("2025-06-01"),
            quantity: 1,
            customer_ref: None,
            idempotency_token: "t".into(),
            group: None,
            created_at: 0,
            expires_at: 1000,
            status: HoldStatus::Active,
        };
        assert!(!hold.is_expired(1000));
        assert!(hold.is_expired(1001));
    }

    #[test]
    fn event_day_key() {
        let rid = Ulid::new();
        let date = d("2025-06-01");
        let e = Event::HoldReleased { id: Ulid::new(), resource_id: rid, date };
        assert_eq!(e.day_key(), Some(DayKey::new(rid, date)));
        assert_eq!(e.resource_id(), rid);
        let e = Event::BlackoutRemoved { id: Ulid::new(), resource_id: rid };
        assert_eq!(e.day_key(), None);
    }

    #[test]
    fn event_bincode_roundtrip() {
        let event = Event::BlackoutAdded {
            blackout: Blackout {
                id: Ulid::new(),
                resource_id: Ulid::new(),
                range: DateRange::new(d("2025-12-24"), d("2025-12-26")),
                reason: Some("Christmas".into()),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
