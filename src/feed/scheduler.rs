//! Adaptive poll intervals.
//!
//! A feed is polled roughly as often as it publishes. Unproductive polls
//! (nothing new, or a failure) widen the interval by up to 1% each time.

use chrono::{DateTime, TimeDelta, Utc};

/// Lower bound for any persisted interval.
pub const MIN_FREQUENCY: TimeDelta = TimeDelta::hours(1);

/// Upper bound for any persisted interval.
pub const MAX_FREQUENCY: TimeDelta = TimeDelta::days(3);

/// Interval assumed for a podcast that has never been scheduled.
pub const DEFAULT_FREQUENCY: TimeDelta = TimeDelta::hours(24);

/// Maximum widening applied by one [`reschedule`].
const BACKOFF_STEP: f64 = 0.01;

fn as_seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

fn from_seconds(seconds: f64) -> TimeDelta {
    TimeDelta::seconds(seconds.round() as i64)
}

/// Estimate the publishing interval from item publish dates.
///
/// Uses the median-low gap between consecutive items; a single item uses
/// its age. Floored at [`MIN_FREQUENCY`] but not capped: callers persisting
/// the value apply [`clamp_frequency`].
pub fn schedule(dates: &[DateTime<Utc>], now: DateTime<Utc>) -> TimeDelta {
    let mut sorted = dates.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    let interval = match sorted.as_slice() {
        [] => DEFAULT_FREQUENCY,
        [only] => now - *only,
        _ => {
            let mut gaps: Vec<TimeDelta> = sorted.windows(2).map(|w| w[0] - w[1]).collect();
            gaps.sort_unstable();
            gaps[(gaps.len() - 1) / 2]
        }
    };

    from_seconds(as_seconds(interval)).max(MIN_FREQUENCY)
}

/// Widen `frequency` after a poll that produced nothing new.
///
/// The increase is proportional to how overdue the feed is relative to its
/// interval, capped at 1%. An unset frequency resets to [`DEFAULT_FREQUENCY`].
pub fn reschedule(
    pub_date: Option<DateTime<Utc>>,
    frequency: Option<TimeDelta>,
    now: DateTime<Utc>,
) -> TimeDelta {
    let elapsed = as_seconds(now - pub_date.unwrap_or(now)).max(0.0);

    let (base, ratio) = match frequency.map(as_seconds) {
        Some(f) if f > 0.0 => (f, (elapsed / f).min(1.0)),
        Some(f) => (f, 0.0),
        None => (as_seconds(DEFAULT_FREQUENCY), 0.0),
    };

    from_seconds(base * (1.0 + BACKOFF_STEP * ratio))
}

/// Bound an interval to `[MIN_FREQUENCY, MAX_FREQUENCY]`.
pub fn clamp_frequency(frequency: TimeDelta) -> TimeDelta {
    frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}
