//! Hard limits on inputs and on the transaction runner.

/// Widest availability query, in days (inclusive range).
pub const MAX_QUERY_DAYS: i64 = 92;

/// Longest single booking (and requested availability duration), in minutes.
pub const MAX_BOOKING_MINUTES: u32 = 24 * 60;

pub const MAX_SERVICES_PER_BOOKING: usize = 20;
pub const MAX_SERVICES_PER_BUSINESS: usize = 200;
pub const MAX_BLOCKED_DATES: usize = 1000;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PUSH_TOKENS: usize = 20;
pub const MAX_TOKEN_LEN: usize = 4096;

/// How many times a transaction body is re-executed on stale reads
/// before the operation fails with a serialization conflict.
pub const MAX_TX_RETRIES: usize = 16;

/// Appointment granularities a business may choose from, in minutes.
pub const ALLOWED_SLOT_INTERVALS: [u16; 3] = [15, 30, 60];

/// Granularity assumed when a business never configured one.
pub const DEFAULT_SLOT_INTERVAL: u16 = 15;

/// Granularity given to freshly registered businesses.
pub const NEW_BUSINESS_SLOT_INTERVAL: u16 = 30;

pub const DEFAULT_CANCEL_NOTICE_HOURS: u32 = 24;
pub const MAX_CANCEL_NOTICE_HOURS: u32 = 24 * 365;
