mod allocations;
mod availability;
mod blackout;
mod capacity;
mod compact;
mod error;
mod expiry;
mod holds;
mod resources;
mod validate;

pub use blackout::BlackoutRegistry;
pub use capacity::CapacityStore;
pub use error::EngineError;
pub use holds::{HoldGroupRequest, HoldRequest};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, local_date};
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{HOLDS_ACTIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

/// Idempotency slot: locked while a request for the token is in flight,
/// `Some` once a hold (or group) was committed for it.
type TokenSlot = Arc<Mutex<Option<Ulid>>>;

fn empty_slot() -> TokenSlot {
    Arc::new(Mutex::new(None))
}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends: block for the first append, drain
/// whatever else is queued, fsync once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mark = wal.mark();
    let mut failure = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync())
        .err();
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Some(e) = &failure {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
        // Every caller hears "failed", so none of the batch may survive
        // into the next replay.
        if let Err(rollback) = wal.rollback(mark) {
            tracing::error!("WAL rollback failed: {rollback}");
            failure = Some(rollback);
        }
    }
    for (_, tx) in batch {
        let r = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_and_respond(wal, vec![(event, response)]),
    }
}

/// The capacity ledger: resources, per-day rows, blackouts, holds and
/// allocations, all in memory and made durable through the WAL.
pub struct Engine {
    resources: DashMap<Ulid, Resource>,
    capacity: CapacityStore,
    blackouts: BlackoutRegistry,
    holds: DashMap<Ulid, Hold>,
    tokens: DashMap<String, TokenSlot>,
    group_tokens: DashMap<String, TokenSlot>,
    /// group id → member hold ids, in date order
    groups: DashMap<Ulid, Vec<Ulid>>,
    allocations: DashMap<Ulid, Allocation>,
    /// order id → allocation ids
    orders: DashMap<String, Vec<Ulid>>,
    /// Serializes resource and blackout writes.
    catalog_lock: Mutex<()>,
    /// Row writers share it; compaction and resource upserts take it
    /// exclusively.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be
    /// called inside a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            capacity: CapacityStore::new(),
            blackouts: BlackoutRegistry::new(),
            holds: DashMap::new(),
            tokens: DashMap::new(),
            group_tokens: DashMap::new(),
            groups: DashMap::new(),
            allocations: DashMap::new(),
            orders: DashMap::new(),
            catalog_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            clock,
            config,
        };

        // Sole owner of every row here, so the uncontended locks can't fail
        // unless something is badly wrong.
        for event in &events {
            match event.day_key() {
                Some(key) => {
                    let max = engine.implicit_max(key.resource_id);
                    let mut day = engine.capacity.lock_uncontended(key, max)?;
                    engine.apply_day(&mut day, event);
                }
                None => engine.apply_catalog(event),
            }
        }
        tracing::info!(
            events = events.len(),
            resources = engine.resources.len(),
            holds = engine.holds.len(),
            "ledger replayed"
        );

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Current calendar date in the booking zone.
    pub fn today(&self) -> Day {
        local_date(self.config.timezone, self.clock.now_ms())
    }

    /// Counts for health checks.
    pub fn stats(&self) -> EngineStats {
        let now = self.now_ms();
        let mut stats = EngineStats {
            allocations: self.allocations.len(),
            active_resources: self.resources.iter().filter(|r| r.active).count(),
            ..EngineStats::default()
        };
        for hold in self.holds.iter() {
            match hold.status {
                HoldStatus::Active => {
                    stats.active_holds += 1;
                    if hold.is_expired(now) {
                        stats.overdue_holds += 1;
                    }
                }
                HoldStatus::Confirmed => stats.confirmed_holds += 1,
                HoldStatus::Released => stats.released_holds += 1,
                HoldStatus::Expired => stats.expired_holds += 1,
            }
        }
        stats
    }

    /// Max used for rows that have never been written.
    fn implicit_max(&self, resource_id: Ulid) -> u32 {
        self.resources
            .get(&resource_id)
            .map_or(0, |r| r.max_capacity)
    }

    /// Row lock for `key`. The caller holds the commit gate, which keeps
    /// resource upserts out until the row's event is logged.
    async fn lock_day(&self, key: DayKey) -> OwnedMutexGuard<CapacityDay> {
        self.capacity
            .lock(key, self.implicit_max(key.resource_id))
            .await
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))??;
        Ok(())
    }

    /// WAL-append, apply to the locked row, notify. The caller holds the
    /// commit gate and the row lock.
    async fn commit_day(&self, day: &mut CapacityDay, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_day(day, &event);
        debug_assert!(day.is_balanced(), "ledger out of balance: {day:?}");
        self.notify.send(&event);
        Ok(())
    }

    /// Same for resource and blackout events. The caller holds the catalog lock.
    async fn commit_catalog(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        self.notify.send(&event);
        Ok(())
    }

    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ResourceUpserted { resource } => {
                self.resources.insert(resource.id, resource.clone());
            }
            Event::BlackoutAdded { blackout } => self.blackouts.insert(blackout.clone()),
            Event::BlackoutRemoved { id, .. } => {
                self.blackouts.remove(*id);
            }
            other => tracing::warn!("row event routed to catalog apply: {other:?}"),
        }
    }

    /// Apply a row event. No validation: events are checked before they
    /// are logged, and replay trusts the log.
    fn apply_day(&self, day: &mut CapacityDay, event: &Event) {
        day.logged = true;
        match event {
            Event::DayCapacitySet { max_capacity, .. } => {
                day.max_capacity = *max_capacity;
                day.available_capacity = max_capacity.saturating_sub(day.held + day.allocated);
            }
            Event::HoldPlaced { hold } => {
                day.available_capacity = day.available_capacity.saturating_sub(hold.quantity);
                day.held += hold.quantity;
                day.holds.push(hold.id);
                self.register_tokens(hold);
                self.holds.insert(hold.id, hold.clone());
                metrics::gauge!(HOLDS_ACTIVE).increment(1.0);
            }
            Event::HoldExtended { id, expires_at, .. } => {
                if let Some(mut hold) = self.holds.get_mut(id) {
                    hold.expires_at = *expires_at;
                }
            }
            Event::HoldReleased { id, .. } => self.finish_hold(day, *id, HoldStatus::Released),
            Event::HoldExpired { id, .. } => self.finish_hold(day, *id, HoldStatus::Expired),
            Event::HoldConfirmed { id, allocation } => {
                if let Some(mut hold) = self.holds.get_mut(id)
                    && hold.status == HoldStatus::Active
                {
                    hold.status = HoldStatus::Confirmed;
                    day.held = day.held.saturating_sub(hold.quantity);
                    day.allocated += allocation.quantity;
                    metrics::gauge!(HOLDS_ACTIVE).decrement(1.0);
                }
                day.allocations.push(allocation.id);
                self.orders
                    .entry(allocation.order_id.clone())
                    .or_default()
                    .push(allocation.id);
                self.allocations.insert(allocation.id, allocation.clone());
            }
            other => tracing::warn!("catalog event routed to row apply: {other:?}"),
        }
    }

    /// ACTIVE → `to`, handing the held units back to the pool.
    fn finish_hold(&self, day: &mut CapacityDay, id: Ulid, to: HoldStatus) {
        let Some(mut hold) = self.holds.get_mut(&id) else { return };
        if hold.status != HoldStatus::Active {
            return;
        }
        hold.status = to;
        day.held = day.held.saturating_sub(hold.quantity);
        day.available_capacity = (day.available_capacity + hold.quantity).min(day.max_capacity);
        metrics::gauge!(HOLDS_ACTIVE).decrement(1.0);
    }

    fn register_tokens(&self, hold: &Hold) {
        match &hold.group {
            None => {
                self.tokens
                    .entry(hold.idempotency_token.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Some(hold.id))));
            }
            Some(group) => {
                self.group_tokens
                    .entry(group.token.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(Some(group.id))));
                self.groups.entry(group.id).or_default().push(hold.id);
            }
        }
    }

    /// Slot for `token`, created empty if this is the first request using it.
    fn token_slot(map: &DashMap<String, TokenSlot>, token: &str) -> TokenSlot {
        map.entry(token.to_owned()).or_insert_with(empty_slot).value().clone()
    }

    /// Forget a slot that never got a hold, unless another request is
    /// waiting on it. Call after dropping the slot guard and clone.
    fn forget_unused_slot(map: &DashMap<String, TokenSlot>, token: &str) {
        map.remove_if(token, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|g| g.is_none())
        });
    }
}
