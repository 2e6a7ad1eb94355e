use crate::model::Ms;

/// Resources addressed by a single command or subscription.
pub const MAX_RESOURCES_PER_COMMAND: usize = 16;

/// Widest span a command or query may cover (400 days).
pub const MAX_SPAN_DURATION_MS: Ms = 400 * 24 * 3_600_000;

/// Timestamps outside this range are rejected outright.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000; // 2100-01-01T00:00:00Z

/// Hold TTL bounds in seconds.
pub const MIN_HOLD_TTL_SEC: i64 = 1;
pub const MAX_HOLD_TTL_SEC: i64 = 24 * 3600;

/// Snapshot pagination.
pub const DEFAULT_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 1024;

/// Per-read batch when backfilling a stream from the log.
pub const STREAM_READ_BATCH: usize = 256;

/// Heartbeat clamp, seconds.
pub const MIN_HEARTBEAT_SEC: u32 = 1;
pub const MAX_HEARTBEAT_SEC: u32 = 300;

/// Opaque segment of a resource urn.
pub const MAX_URN_OPAQUE_LEN: usize = 128;

/// Free-form strings carried on commands.
pub const MAX_IDEM_KEY_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 256;
