//! Shared retry schedule.
//!
//! Every retried operation (ledger submit, status poll, rollback,
//! webhook delivery) doubles its delay per attempt up to a 60 second
//! cap. With 1440 capped steps the budget is roughly 24 hours of wall
//! time.

use std::time::Duration;

/// Per-step delay cap in seconds.
const MAX_DELAY_SECS: u64 = 60;

/// `ceil(86400 / 60)`: enough capped steps to cover a day.
pub const MAX_RETRIES: u32 = 1440;

/// Delay before retry number `attempt` (zero-based).
pub fn delay(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .min(MAX_DELAY_SECS);
    Duration::from_secs(secs)
}
