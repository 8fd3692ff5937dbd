use crate::model::Ms;

pub const MAX_ROOMS_PER_ORGANIZATION: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_RESOURCES: usize = 64;
pub const MAX_OWNER_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single reservation may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Read windows (agenda, availability, listings) are capped at 366 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_UPCOMING: usize = 50;
pub const DEFAULT_UPCOMING: usize = 5;

pub const MAX_ORGANIZATIONS: usize = 1_024;
pub const MAX_ORGANIZATION_NAME_LEN: usize = 128;
