//! Time-to-live support for cached connections.
//!
//! Cached connection handles carry a creation timestamp and an expiry
//! deadline. Time comes from an injected [`Clock`] so expiry can be driven
//! deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Default lifetime of a cached backend connection: 2 hours.
pub const CONNECTION_DEFAULT_TTL: Duration = Duration::hours(2);

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Parse a duration such as `"30s"`, `"15m"`, `"2h"`, `"1d"` or `"1w"`.
///
/// The number must be a positive integer; weeks are 7 days.
pub fn parse_ttl(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let Some(unit) = s.chars().last() else {
        return Err("duration is empty".into());
    };
    let digits = &s[..s.len() - unit.len_utf8()];
    let num: i64 = digits
        .parse()
        .map_err(|_| format!("invalid duration number: '{digits}'"))?;
    if num <= 0 {
        return Err(format!("duration must be positive, got {num}"));
    }

    let per_unit = match unit {
        's' => Duration::seconds,
        'm' => Duration::minutes,
        'h' => Duration::hours,
        'd' => Duration::days,
        'w' => Duration::weeks,
        other => return Err(format!("unknown duration unit '{other}'; use s, m, h, d or w")),
    };
    Ok(per_unit(num))
}

/// Compute the expiry deadline of something created at `created_at`.
pub fn expires_at(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    created_at + ttl
}

/// A deadline has passed once `now` reaches it.
pub fn is_expired(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= deadline
}

// ============================================================================
// Tests
// ============================================================================
