use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Whole seconds left until `deadline`, rounded up
pub fn seconds_until(deadline: u64, now: u64) -> u32 {
    let remaining = deadline.saturating_sub(now);
    remaining.div_ceil(1000) as u32
}

// Milliseconds between two timestamps as fractional seconds
pub fn elapsed_secs(since: u64, now: u64) -> f32 {
    now.saturating_sub(since) as f32 / 1000.0
}
