use std::time::Duration;
use chrono::{DateTime, Utc};

/// Wall-clock time left until `target`; zero once it has passed.
pub fn duration_until(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Clamp a caller-supplied row limit, rejecting values outside `1..=max`.
pub fn checked_limit(requested: Option<usize>, default: usize, max: usize) -> Option<usize> {
    match requested {
        None => Some(default),
        Some(n) if (1..=max).contains(&n) => Some(n),
        Some(_) => None,
    }
}
