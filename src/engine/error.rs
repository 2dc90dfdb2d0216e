use ulid::Ulid;

use crate::model::{Day, HoldStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("resource {resource_id} is blacked out on {date}")]
    BlackoutConflict { resource_id: Ulid, date: Day },
    #[error("resource {resource_id} on {date}: requested {requested}, only {available} available")]
    CapacityExceeded {
        resource_id: Ulid,
        date: Day,
        requested: u32,
        available: u32,
    },
    #[error("hold {id} is {status}, not ACTIVE")]
    HoldNotActive { id: Ulid, status: HoldStatus },
    #[error("hold {0} has expired")]
    HoldExpired(Ulid),
    #[error("hold {0} is confirmed and can no longer be released")]
    CannotReleaseConfirmed(Ulid),
    #[error("idempotency token {token:?} was already used with different parameters")]
    IdempotencyConflict { token: String },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("ledger store unavailable: {0}")]
    TransientStore(String),
}

impl EngineError {
    /// Stable, machine-readable name for the wire and for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::BlackoutConflict { .. } => "blackout_conflict",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::HoldNotActive { .. } => "hold_not_active",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::CannotReleaseConfirmed(_) => "cannot_release_confirmed",
            EngineError::IdempotencyConflict { .. } => "idempotency_conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::TransientStore(_) => "transient_store",
        }
    }

    /// Whether the same request may succeed if sent again later.
    /// Capacity frees up as holds lapse; store failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::CapacityExceeded { .. } | EngineError::TransientStore(_)
        )
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::TransientStore(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let date: Day = "2025-06-01".parse().unwrap();
        let exceeded = EngineError::CapacityExceeded {
            resource_id: Ulid::new(),
            date,
            requested: 3,
            available: 1,
        };
        assert!(exceeded.is_retryable());
        assert_eq!(exceeded.kind(), "capacity_exceeded");
        assert!(EngineError::TransientStore("disk full".into()).is_retryable());
        assert!(!EngineError::HoldExpired(Ulid::new()).is_retryable());
        assert!(!EngineError::BlackoutConflict { resource_id: Ulid::new(), date }.is_retryable());
    }

    #[test]
    fn messages_name_the_offending_status() {
        let id = Ulid::new();
        let err = EngineError::HoldNotActive { id, status: HoldStatus::Released };
        assert_eq!(err.to_string(), format!("hold {id} is RELEASED, not ACTIVE"));
    }
}
