use std::time::Duration;

use crate::clock::duration_ms;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::validation("quantity must be greater than zero"));
    }
    if quantity > MAX_HOLD_QUANTITY {
        return Err(EngineError::LimitExceeded("hold quantity too large"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(max_capacity: u32) -> Result<(), EngineError> {
    if max_capacity == 0 {
        return Err(EngineError::validation("max_capacity must be at least 1"));
    }
    if max_capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("max_capacity too large"));
    }
    Ok(())
}

/// Inclusive range no longer than the query limit.
pub(crate) fn validate_range(start: Day, end: Day) -> Result<DateRange, EngineError> {
    let range = DateRange::checked(start, end)
        .ok_or_else(|| EngineError::validation(format!("end date {end} is before start date {start}")))?;
    if range.len_days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    Ok(range)
}

/// Holds cannot be placed on dates before `today`.
pub(crate) fn validate_not_past(date: Day, today: Day) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::validation(format!(
            "date {date} is in the past (today is {today})"
        )));
    }
    Ok(())
}

/// Requested TTL in milliseconds, or the default when none was given.
pub(crate) fn resolve_ttl(ttl: Option<Duration>, default_ms: Ms) -> Result<Ms, EngineError> {
    let Some(ttl) = ttl else { return Ok(default_ms) };
    let ms = duration_ms(ttl);
    if ms <= 0 {
        return Err(EngineError::validation("ttl must be positive"));
    }
    if ms > MAX_HOLD_TTL_MS {
        return Err(EngineError::validation("ttl must not exceed 24 hours"));
    }
    Ok(ms)
}

pub(crate) fn validate_token(token: &str) -> Result<(), EngineError> {
    if token.trim().is_empty() {
        return Err(EngineError::validation("idempotency token must not be empty"));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(EngineError::LimitExceeded("idempotency token too long"));
    }
    Ok(())
}

/// Non-empty, bounded reference such as an order id.
pub(crate) fn validate_ref(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_REF_LEN {
        return Err(EngineError::LimitExceeded("reference too long"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("resource name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("blackout reason too long"));
    }
    Ok(())
}
