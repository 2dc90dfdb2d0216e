use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::WAL_COMPACTIONS_TOTAL;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as the shortest event sequence that rebuilds the
    /// current state. Finished holds older than the retention window are
    /// dropped first, along with their idempotency tokens.
    ///
    /// Blocks every writer for the duration. Returns the number of events
    /// in the new log.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let cutoff = self
            .now_ms()
            .saturating_sub(self.config.hold_retention_ms);
        let pruned = self.prune_finished_holds(cutoff).await;

        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))??;

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, pruned, "WAL compacted");
        Ok(count)
    }

    /// Forget RELEASED/EXPIRED holds whose expiry is before `cutoff`.
    async fn prune_finished_holds(&self, cutoff: Ms) -> usize {
        let stale: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| {
                matches!(h.status, HoldStatus::Released | HoldStatus::Expired)
                    && h.expires_at < cutoff
            })
            .map(|h| h.value().clone())
            .collect();

        for hold in &stale {
            self.holds.remove(&hold.id);
            if let Some(row) = self.capacity.get(&hold.key()) {
                row.lock().await.holds.retain(|id| *id != hold.id);
            }
            match &hold.group {
                None => {
                    self.tokens.remove_if(&hold.idempotency_token, |_, slot| {
                        slot.try_lock().is_ok_and(|g| *g == Some(hold.id))
                    });
                }
                Some(group) => {
                    let emptied = self.groups.get_mut(&group.id).is_some_and(|mut ids| {
                        ids.retain(|id| *id != hold.id);
                        ids.is_empty()
                    });
                    if emptied {
                        self.groups.remove(&group.id);
                        self.group_tokens.remove(&group.token);
                    }
                }
            }
        }
        stale.len()
    }

    /// Catalog first, then maxima of logged rows, then every hold followed
    /// by its terminal event, in id order.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut resources: Vec<Resource> = self.resources.iter().map(|r| r.value().clone()).collect();
        resources.sort_by_key(|r| r.id);
        events.extend(resources.into_iter().map(|resource| Event::ResourceUpserted { resource }));

        for (key, max_capacity) in self.capacity.logged_maxima().await {
            events.push(Event::DayCapacitySet {
                resource_id: key.resource_id,
                date: key.date,
                max_capacity,
            });
        }

        events.extend(
            self.blackouts
                .all()
                .into_iter()
                .map(|blackout| Event::BlackoutAdded { blackout }),
        );

        let by_hold: HashMap<Ulid, Allocation> = self
            .allocations
            .iter()
            .map(|a| (a.hold_id, a.value().clone()))
            .collect();
        let mut holds: Vec<Hold> = self.holds.iter().map(|h| h.value().clone()).collect();
        holds.sort_by_key(|h| h.id);

        for hold in holds {
            let (id, resource_id, date, status) = (hold.id, hold.resource_id, hold.date, hold.status);
            events.push(Event::HoldPlaced {
                hold: Hold {
                    status: HoldStatus::Active,
                    ..hold
                },
            });
            match status {
                HoldStatus::Active => {}
                HoldStatus::Released => events.push(Event::HoldReleased { id, resource_id, date }),
                HoldStatus::Expired => events.push(Event::HoldExpired { id, resource_id, date }),
                HoldStatus::Confirmed => {
                    if let Some(allocation) = by_hold.get(&id) {
                        events.push(Event::HoldConfirmed {
                            id,
                            allocation: allocation.clone(),
                        });
                    }
                }
            }
        }
        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
