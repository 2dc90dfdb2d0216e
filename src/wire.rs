use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, HoldGroupRequest, HoldRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, op_label};

/// Queued events per connection before forwarders start waiting.
const SUBSCRIPTION_BUFFER: usize = 256;

fn one() -> u32 {
    1
}

fn yes() -> bool {
    true
}

/// One request line. The `op` field picks the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    UpsertResource {
        id: Ulid,
        kind: ResourceKind,
        name: String,
        max_capacity: u32,
        #[serde(default = "yes")]
        active: bool,
    },
    GetResource {
        resource_id: Ulid,
    },
    ListResources {
        kind: Option<ResourceKind>,
        #[serde(default)]
        include_inactive: bool,
    },
    SetCapacity {
        resource_id: Ulid,
        start_date: Day,
        end_date: Day,
        max_capacity: u32,
    },
    DayLedger {
        resource_id: Ulid,
        date: Day,
    },
    Availability {
        resource_id: Ulid,
        start_date: Day,
        end_date: Day,
        #[serde(default = "one")]
        quantity: u32,
    },
    AvailableDates {
        resource_id: Ulid,
        start_date: Day,
        end_date: Day,
        #[serde(default = "one")]
        min_capacity: u32,
    },
    CreateHold {
        resource_id: Ulid,
        date: Day,
        quantity: u32,
        idempotency_token: String,
        ttl_seconds: Option<u64>,
        customer_ref: Option<String>,
    },
    CreateHoldGroup {
        resource_id: Ulid,
        dates: Vec<Day>,
        quantity: u32,
        idempotency_token: String,
        ttl_seconds: Option<u64>,
        customer_ref: Option<String>,
    },
    GetHold {
        hold_id: Ulid,
    },
    ActiveHolds {
        resource_id: Ulid,
        date: Day,
    },
    ExtendHold {
        hold_id: Ulid,
        extra_seconds: u64,
    },
    ReleaseHold {
        hold_id: Ulid,
    },
    ConfirmHold {
        hold_id: Ulid,
        order_id: String,
        line_item_id: String,
    },
    CreateBlackout {
        resource_id: Ulid,
        start_date: Day,
        end_date: Day,
        reason: Option<String>,
    },
    DeleteBlackout {
        blackout_id: Ulid,
    },
    ListBlackouts {
        resource_id: Ulid,
    },
    Allocations {
        order_id: String,
    },
    AllocationsOn {
        resource_id: Ulid,
        date: Day,
    },
    SweepExpiredHolds,
    Stats,
    Subscribe {
        resource_id: Ulid,
    },
}

/// One reply line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        data: Value,
    },
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },
    /// Pushed to subscribed connections, interleaved with replies.
    Event {
        event: Event,
    },
}

impl Reply {
    pub fn error(err: &WireError) -> Self {
        Reply::Error {
            kind: err.kind().to_owned(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Engine(e) => e.kind(),
            WireError::BadRequest(_) => "bad_request",
            WireError::Json(_) | WireError::Io(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, WireError::Engine(e) if e.is_retryable())
    }
}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                WireError::BadRequest(format!("line longer than {MAX_LINE_LEN} bytes"))
            }
            LinesCodecError::Io(e) => WireError::Io(e),
        }
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, WireError> {
    Ok(serde_json::to_value(value)?)
}

fn seconds(secs: Option<u64>) -> Option<Duration> {
    secs.map(Duration::from_secs)
}

/// Run one request against the engine. For `Subscribe` this only checks
/// the resource exists; the connection loop attaches the event stream.
pub async fn execute(engine: &Engine, req: Request) -> Result<Value, WireError> {
    match req {
        Request::UpsertResource {
            id,
            kind,
            name,
            max_capacity,
            active,
        } => data(
            engine
                .upsert_resource(Resource {
                    id,
                    kind,
                    name,
                    max_capacity,
                    active,
                })
                .await?,
        ),
        Request::GetResource { resource_id } => data(engine.get_resource(resource_id)?),
        Request::ListResources {
            kind,
            include_inactive,
        } => data(engine.list_resources(kind, include_inactive)),
        Request::SetCapacity {
            resource_id,
            start_date,
            end_date,
            max_capacity,
        } => data(
            engine
                .set_capacity(resource_id, start_date, end_date, max_capacity)
                .await?,
        ),
        Request::DayLedger { resource_id, date } => {
            data(engine.day_ledger(resource_id, date).await?)
        }
        Request::Availability {
            resource_id,
            start_date,
            end_date,
            quantity,
        } => data(
            engine
                .check_availability(resource_id, start_date, end_date, quantity)
                .await?,
        ),
        Request::AvailableDates {
            resource_id,
            start_date,
            end_date,
            min_capacity,
        } => data(
            engine
                .available_dates(resource_id, start_date, end_date, min_capacity)
                .await?,
        ),
        Request::CreateHold {
            resource_id,
            date,
            quantity,
            idempotency_token,
            ttl_seconds,
            customer_ref,
        } => data(
            engine
                .create_hold(HoldRequest {
                    resource_id,
                    date,
                    quantity,
                    idempotency_token,
                    ttl: seconds(ttl_seconds),
                    customer_ref,
                })
                .await?,
        ),
        Request::CreateHoldGroup {
            resource_id,
            dates,
            quantity,
            idempotency_token,
            ttl_seconds,
            customer_ref,
        } => data(
            engine
                .create_hold_group(HoldGroupRequest {
                    resource_id,
                    dates,
                    quantity,
                    idempotency_token,
                    ttl: seconds(ttl_seconds),
                    customer_ref,
                })
                .await?,
        ),
        Request::GetHold { hold_id } => data(engine.get_hold(hold_id)?),
        Request::ActiveHolds { resource_id, date } => {
            data(engine.active_holds(resource_id, date).await)
        }
        Request::ExtendHold {
            hold_id,
            extra_seconds,
        } => data(
            engine
                .extend_hold(hold_id, Duration::from_secs(extra_seconds))
                .await?,
        ),
        Request::ReleaseHold { hold_id } => data(engine.release_hold(hold_id).await?),
        Request::ConfirmHold {
            hold_id,
            order_id,
            line_item_id,
        } => data(
            engine
                .confirm_hold(hold_id, &order_id, &line_item_id)
                .await?,
        ),
        Request::CreateBlackout {
            resource_id,
            start_date,
            end_date,
            reason,
        } => data(
            engine
                .add_blackout(resource_id, start_date, end_date, reason)
                .await?,
        ),
        Request::DeleteBlackout { blackout_id } => {
            data(engine.remove_blackout(blackout_id).await?)
        }
        Request::ListBlackouts { resource_id } => data(engine.list_blackouts(resource_id)?),
        Request::Allocations { order_id } => data(engine.allocations_for_order(&order_id)),
        Request::AllocationsOn { resource_id, date } => {
            data(engine.allocations_on(resource_id, date).await)
        }
        Request::SweepExpiredHolds => data(engine.sweep_expired_holds().await),
        Request::Stats => data(engine.stats()),
        Request::Subscribe { resource_id } => {
            engine.get_resource(resource_id)?;
            Ok(json!({ "subscribed": resource_id }))
        }
    }
}

/// Forward one resource's events into the connection's queue until either
/// side goes away.
fn forward_events(
    mut rx: broadcast::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    resource_id: Ulid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(resource = %resource_id, "subscriber skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Serve one client: request lines in, reply lines out, plus pushed events
/// for any resources the client subscribed to.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(SUBSCRIPTION_BUFFER);
    let mut forwarders: Vec<(Ulid, JoinHandle<()>)> = Vec::new();

    let result = async {
        loop {
            tokio::select! {
                line = framed.next() => {
                    let Some(line) = line else { return Ok(()) };
                    let reply = match line {
                        Ok(line) if line.trim().is_empty() => continue,
                        Ok(line) => match serde_json::from_str::<Request>(&line) {
                            Ok(req) => {
                                let subscribe_to = match &req {
                                    Request::Subscribe { resource_id } => Some(*resource_id),
                                    _ => None,
                                };
                                let reply = run_request(&engine, req).await;
                                if let Some(resource_id) = subscribe_to
                                    && matches!(reply, Reply::Ok { .. })
                                    && !forwarders.iter().any(|(rid, _)| *rid == resource_id)
                                {
                                    let rx = engine.notify.subscribe(resource_id);
                                    forwarders.push((resource_id, forward_events(rx, event_tx.clone(), resource_id)));
                                }
                                reply
                            }
                            Err(e) => {
                                metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
                                Reply::error(&WireError::BadRequest(e.to_string()))
                            }
                        },
                        Err(LinesCodecError::MaxLineLengthExceeded) => {
                            Reply::error(&WireError::from(LinesCodecError::MaxLineLengthExceeded))
                        }
                        Err(LinesCodecError::Io(e)) => return Err(WireError::Io(e)),
                    };
                    framed.send(serde_json::to_string(&reply)?).await?;
                }
                Some(event) = event_rx.recv() => {
                    framed.send(serde_json::to_string(&Reply::Event { event })?).await?;
                }
            }
        }
    }
    .await;

    for (_, task) in forwarders {
        task.abort();
    }
    result
}

/// Execute and time one parsed request.
async fn run_request(engine: &Engine, req: Request) -> Reply {
    let op = op_label(&req);
    let started = Instant::now();
    let result = execute(engine, req).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            Reply::Ok { data }
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => e.kind()).increment(1);
            tracing::debug!(op, "request failed: {e}");
            Reply::error(&e)
        }
    }
}
