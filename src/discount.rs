//! Live discount computation.
//!
//! A coupon's displayed discount escalates as its expiry approaches. The
//! rate is a pure function of the coupon and the current time; the
//! `current_discount` column is only a cache of [`live_rate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Coupon, ScheduleBreakpoint};

/// How a custom schedule picks among breakpoints that all match.
///
/// Which order is correct is a product decision; both are supported and
/// chosen through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMatch {
    /// Walk the schedule in stored order; the last matching entry wins.
    #[default]
    Last,
    /// Walk the schedule in stored order; the first matching entry wins.
    First,
}

impl ScheduleMatch {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last" => Some(ScheduleMatch::Last),
            "first" => Some(ScheduleMatch::First),
            _ => None,
        }
    }
}

/// Default ladder applied when a coupon has no custom schedule:
/// `(minutes remaining at most, bonus over base, cap)`, most urgent first.
const DEFAULT_LADDER: [(f64, i32, i32); 3] = [(10.0, 30, 50), (30.0, 20, 40), (60.0, 10, 30)];

/// Compute the live discount percentage of `coupon` at `now`.
///
/// Expired coupons report their base rate: escalation only applies while
/// the coupon is still open.
pub fn live_rate(coupon: &Coupon, now: DateTime<Utc>, order: ScheduleMatch) -> i32 {
    if now >= coupon.end_time {
        return coupon.discount_rate_initial;
    }

    let minutes_remaining = (coupon.end_time - now).num_milliseconds() as f64 / 60_000.0;
    let base = coupon.discount_rate_initial;

    match coupon.discount_rate_schedule.as_deref() {
        Some(schedule) if !schedule.is_empty() => {
            scheduled_rate(schedule, base, minutes_remaining, order)
        }
        _ => default_rate(base, minutes_remaining),
    }
}

fn scheduled_rate(
    schedule: &[ScheduleBreakpoint],
    base: i32,
    minutes_remaining: f64,
    order: ScheduleMatch,
) -> i32 {
    let mut matching = schedule
        .iter()
        .filter(|bp| minutes_remaining <= bp.time_remaining_minutes as f64);

    let hit = match order {
        ScheduleMatch::Last => matching.last(),
        ScheduleMatch::First => matching.next(),
    };

    hit.map_or(base, |bp| bp.rate)
}

fn default_rate(base: i32, minutes_remaining: f64) -> i32 {
    DEFAULT_LADDER
        .iter()
        .find(|(threshold, _, _)| minutes_remaining <= *threshold)
        .map_or(base, |(_, bonus, cap)| (*cap).min(base + bonus))
}
