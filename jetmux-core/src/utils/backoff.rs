use rand::Rng;
use std::time::Duration;

/// Exponent cap: the delay never exceeds 2^6 = 64 seconds before jitter.
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Returns the reconnect delay for the given attempt (0-based).
///
/// Uses exponential backoff: 2^attempt seconds, capped at
/// 2^[`MAX_BACKOFF_EXPONENT`].
pub fn reconnect_delay(attempt: u32) -> Duration {
    let seconds = 2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT));
    Duration::from_secs(seconds)
}

/// [`reconnect_delay`] plus up to 25% random jitter, so that many clients
/// dropped at once do not reconnect in lockstep.
pub fn reconnect_delay_with_jitter(attempt: u32) -> Duration {
    let base = reconnect_delay(attempt);
    let max_jitter_ms = (base.as_millis() / 4) as u64;
    let jitter_ms = rand::rng().random_range(0..=max_jitter_ms);
    base + Duration::from_millis(jitter_ms)
}
