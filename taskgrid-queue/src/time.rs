//! Monotonic clock and cron-expression evaluation in a configurable time
//! zone (§4.A).

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{QueueError, Result};
use crate::store::RedisStore;

/// Sources `now()` from the shared store (`TIME`) so every process observes
/// the same clock, not each process's local wall clock.
#[derive(Clone)]
pub struct TimeSource {
  store: RedisStore,
}

impl TimeSource {
  pub fn new(store: RedisStore) -> Self {
    return Self { store };
  }

  /// Seconds since epoch, millisecond precision, sourced from Redis `TIME`.
  pub async fn now(&self) -> Result<f64> {
    let mut conn = self.store.connection().await?;
    let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
    return Ok(secs as f64 + (micros as f64 / 1_000_000.0));
  }
}

/// Parses and evaluates cron expressions. Supports the standard 5-field
/// form and an optional 6th (leading seconds) field, matching honors the
/// given time zone.
pub struct CronMatcher;

impl CronMatcher {
  pub fn is_valid(expr: &str) -> bool {
    return Self::parse(expr).is_ok();
  }

  fn parse(expr: &str) -> Result<Schedule> {
    let normalized = Self::normalize(expr);
    return Schedule::from_str(&normalized).map_err(|e| QueueError::InvalidCron(e.to_string()));
  }

  /// The `cron` crate always expects a leading seconds field; a 5-field
  /// expression is normalized by prefixing a literal `0` seconds field.
  fn normalize(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    return if field_count == 5 {
      format!("0 {expr}")
    } else {
      expr.to_string()
    };
  }

  /// Whether `expr` fires at instant `t` (seconds since epoch) in `tz`.
  /// `t` is aligned to the ceiling-of-second boundary before matching, per
  /// the tie-break rule in §4.A.
  pub fn matches(expr: &str, t: f64, tz: Tz) -> Result<bool> {
    let schedule = Self::parse(expr)?;
    let aligned = t.ceil() as i64;

    let Some(instant) = tz.timestamp_opt(aligned, 0).single() else {
      return Ok(false);
    };

    // `cron`'s `includes` checks the exact instant (to the second).
    return Ok(schedule.includes(instant));
  }

  pub fn utc_matches(expr: &str, t: f64) -> Result<bool> {
    let schedule = Self::parse(expr)?;
    let aligned = t.ceil() as i64;
    let instant: DateTime<Utc> = Utc.timestamp_opt(aligned, 0).single().ok_or_else(|| {
      QueueError::InvalidCron(format!("instant out of range: {aligned}"))
    })?;
    return Ok(schedule.includes(instant));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_five_field_every_two_seconds() {
    // Every even second, per S1 in §8.
    let expr = "*/2 * * * * *";
    assert!(CronMatcher::utc_matches(expr, 10.0).unwrap());
    assert!(CronMatcher::utc_matches(expr, 12.0).unwrap());
    assert!(!CronMatcher::utc_matches(expr, 11.0).unwrap());
  }

  #[test]
  fn test_dynamic_expr_every_five_seconds() {
    let expr = "*/5 * * * * *";
    assert!(CronMatcher::utc_matches(expr, 15.0).unwrap());
    assert!(CronMatcher::utc_matches(expr, 20.0).unwrap());
    assert!(CronMatcher::utc_matches(expr, 25.0).unwrap());
    assert!(!CronMatcher::utc_matches(expr, 12.0).unwrap());
    assert!(!CronMatcher::utc_matches(expr, 14.0).unwrap());
  }

  #[test]
  fn test_invalid_expression() {
    assert!(!CronMatcher::is_valid("not a cron expr"));
  }
}
