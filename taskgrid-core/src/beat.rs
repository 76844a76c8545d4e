//! Beat (§4.I): the singleton clock. Every wake is aligned to the next
//! whole second. At each tick it (1) contends for the master lock, (2)
//! evaluates the fixed table of system task metas against the tick instant
//! and enqueues the ones that match, and (3) promotes delayed tasks on
//! every queue until none remain due. Beat never executes a task itself —
//! it only enqueues Task Requests that a Worker later claims (§2 data flow).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use taskgrid_queue::{CronMatcher, TaskRequest};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::constants::{BEAT_MASTER_LOCK_TTL, BEAT_TICK_HARD_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum BeatError {
  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),

  #[error("one Beat tick exceeded its {0:.0}s hard timeout")]
  TickTimedOut(f64),
}

pub type Result<T> = std::result::Result<T, BeatError>;

/// One row of the fixed system-task table Beat evaluates every tick (§4.I
/// step 2). `delay` places the request on the delay queue instead of the
/// worker queue directly, same as a user Cron Job's `delayedCronJob`.
struct SystemTaskMeta {
  name: &'static str,
  cron_expr: String,
  queue: i64,
  delay: f64,
  timeout: f64,
  expires: f64,
}

fn system_task_metas(config: &crate::config::Config) -> Vec<SystemTaskMeta> {
  return vec![
    SystemTaskMeta {
      name: "Internal.CronJobStarter",
      cron_expr: "* * * * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 55.0,
      expires: 10.0,
    },
    SystemTaskMeta {
      name: "Internal.SystemMetric",
      cron_expr: "0 * * * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 30.0,
      expires: 55.0,
    },
    SystemTaskMeta {
      name: "Internal.FlushDataBuffer",
      cron_expr: "*/10 * * * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 30.0,
      expires: 9.0,
    },
    SystemTaskMeta {
      name: "Internal.AutoClean",
      cron_expr: "0 30 3 * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 300.0,
      expires: 3600.0,
    },
    SystemTaskMeta {
      name: "Internal.ReloadDataMD5Cache",
      cron_expr: "0 */5 * * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 60.0,
      expires: 290.0,
    },
    SystemTaskMeta {
      name: "Internal.UpdateWorkerQueueLimit",
      cron_expr: "*/30 * * * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 15.0,
      expires: 29.0,
    },
    SystemTaskMeta {
      name: "Internal.AutoRun",
      cron_expr: "0 0 0 * * *".to_string(),
      queue: 1,
      delay: 0.0,
      timeout: 60.0,
      expires: 3600.0,
    },
    SystemTaskMeta {
      name: "Internal.AutoBackupDB",
      // hour_of_day is operator-configurable; minute/second pinned to the top of the hour.
      cron_expr: format!("0 0 {} * * *", config.backup.hour_of_day),
      queue: 1,
      delay: 0.0,
      timeout: 120.0,
      expires: 3600.0,
    },
  ];
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
  pub owner: bool,
  pub enqueued: u32,
  pub promoted: i64,
}

pub struct Beat {
  state: AppState,
  owner_token: String,
  ticks: u64,
}

impl Beat {
  pub fn new(state: AppState) -> Self {
    return Self { state, owner_token: Uuid::new_v4().to_string(), ticks: 0 };
  }

  /// Runs ticks forever, each aligned to the next whole second, until the
  /// configured tick-recycle count is reached, at which point it returns so
  /// the supervising process can exit and be respawned (§4.I, bounding
  /// long-run memory growth).
  pub async fn run_forever(&mut self) -> Result<()> {
    loop {
      let now = sleep_until_next_second().await as f64;

      match tokio::time::timeout(BEAT_TICK_HARD_TIMEOUT, self.tick(now)).await {
        Ok(Ok(report)) => {
          if report.owner {
            tracing::debug!(enqueued = report.enqueued, promoted = report.promoted, "beat tick");
          }
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "beat tick failed"),
        Err(_) => tracing::warn!(%now, "beat tick exceeded hard timeout"),
      }

      self.ticks += 1;
      if self.ticks >= self.state.config().beat.recycle_after_ticks {
        tracing::info!(ticks = self.ticks, "beat recycling after configured tick count");
        return Ok(());
      }
    }
  }

  /// One tick at instant `now`. Returns `owner=false` without doing
  /// anything else when the master lock is held by another Beat.
  pub async fn tick(&self, now: f64) -> Result<TickReport> {
    let key = self.state.keys().master_lock();
    let renewed = self.state.locks().renew(&key, &self.owner_token, BEAT_MASTER_LOCK_TTL).await?;
    let owner = renewed || self.state.locks().lock(&key, &self.owner_token, BEAT_MASTER_LOCK_TTL).await?;
    if !owner {
      return Ok(TickReport { owner: false, ..Default::default() });
    }

    let mut enqueued = 0u32;
    for meta in system_task_metas(self.state.config()) {
      if !CronMatcher::utc_matches(&meta.cron_expr, now).unwrap_or(false) {
        continue;
      }

      let request = TaskRequest {
        name: meta.name.to_string(),
        id: Uuid::new_v4().to_string(),
        kwargs: serde_json::json!({}),
        trigger_time: now,
        queue: meta.queue,
        eta: if meta.delay > 0.0 { Some(now + meta.delay) } else { None },
        delay: meta.delay,
        timeout: meta.timeout,
        expires: meta.expires,
        ignore_result: true,
        task_record_limit: None,
        call_chain: vec![],
        cron_job_lock: None,
      };

      if meta.delay > 0.0 {
        self.state.queue().zadd_delay(meta.queue, &request, now + meta.delay).await?;
      } else {
        self.state.queue().push(meta.queue, &request).await?;
      }
      enqueued += 1;
    }

    let mut promoted = 0i64;
    for queue in 0..self.state.config().num_queues {
      loop {
        let moved = self.state.queue().promote(queue, now).await?;
        if moved == 0 {
          break;
        }
        promoted += moved;
      }
    }

    return Ok(TickReport { owner: true, enqueued, promoted });
  }
}

/// Sleeps until the next whole second and returns that second (as a Unix
/// timestamp), rather than re-reading the clock on wake. Wakeup latency
/// always lands a sleep a hair *after* its target instant, so a second
/// `SystemTime::now()` read back would read e.g. `N.0003` for a sleep that
/// targeted `N` — and `CronMatcher`'s ceiling tie-break (§4.A) would then
/// round that up to `N+1`, evaluating the system-task table for the wrong
/// second. Returning the integer second the sleep was aligned to sidesteps
/// the ceiling entirely: `ceil(N) == N`.
async fn sleep_until_next_second() -> i64 {
  let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
  let fractional = now.subsec_nanos() as f64 / 1_000_000_000.0;
  let remaining = (1.0 - fractional).max(0.0);
  let target = now.as_secs() as i64 + 1;
  tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
  return target;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;

  // Requires a live Redis (master-lock contention); see `app_state::test_state`.
  #[tokio::test]
  #[ignore]
  async fn test_single_beat_becomes_owner() {
    let state = test_state().await;
    let beat = Beat::new(state);
    let report = beat.tick(10.0).await.unwrap();
    assert!(report.owner);
  }

  // S1 in §8: every-two-seconds cron job fires at t=10,12 but not t=11.
  #[tokio::test]
  #[ignore]
  async fn test_cron_job_starter_meta_matches_every_second() {
    let state = test_state().await;
    let beat = Beat::new(state);
    let report = beat.tick(11.0).await.unwrap();
    assert!(report.owner);
    // Internal.CronJobStarter matches every second, so it's always enqueued.
    assert!(report.enqueued >= 1);
  }
}
