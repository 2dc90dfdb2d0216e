use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_CAPACITY: u32 = 1_000_000;
pub const MAX_HOLD_QUANTITY: u32 = 10_000;

pub const MAX_TOKEN_LEN: usize = 256;
/// Order ids, line-item ids and customer references.
pub const MAX_REF_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

/// Longest range for availability and capacity queries, in days.
pub const MAX_RANGE_DAYS: i64 = 366;
pub const MAX_GROUP_DATES: usize = 31;
pub const MAX_BLACKOUTS_PER_RESOURCE: usize = 1024;

pub const DEFAULT_HOLD_TTL_MS: Ms = 30 * 60_000;
/// Upper bound on a hold's total lifetime, extensions included.
pub const MAX_HOLD_TTL_MS: Ms = 24 * 3_600_000;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
