use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

/// Longest bookable service (one full day).
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

pub const MIN_SLOT_STEP_MIN: u32 = 5;
pub const MAX_SLOT_STEP_MIN: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest window accepted by range listings (93 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 93 * 24 * 3_600_000;

pub const MAX_RULES_PER_STAFF: usize = 64;
pub const MAX_BOOKINGS_PER_STAFF: usize = 100_000;

pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
