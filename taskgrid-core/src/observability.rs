//! Observability Pipeline (§4.L): Heartbeat publication from every process
//! (Beat and Worker alike) plus the per-queue worker/process-count rollup
//! read back from those entries. Task Record buffering and flushing to the
//! metadata store live in [`crate::internal_tasks::flush_data_buffer`];
//! this module only covers the liveness side of observability.

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::app_state::AppState;
use crate::constants::HEARTBEAT_INTERVAL;

/// Wire shape published into the shared heartbeats hash (§4.L). Kept plain
/// `snake_case`, the same convention every other wire struct in this crate
/// uses (`TaskRequest`, `TaskResponse`) rather than a `camelCase` rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
  pub hostname: String,
  pub pid: u32,
  pub service: String,
  pub version: String,
  pub edition: String,
  pub uptime_secs: f64,
  pub listening_queues: Vec<i64>,
  /// Always 1 from this process's own point of view; `process_count` in the
  /// aggregated rollup (see [`aggregate_process_counts`]) is the sum of
  /// this field across every live entry.
  pub process_count: u32,
  pub cpu_percent: f32,
  pub memory_bytes: u64,
}

fn hostname() -> String {
  return hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown".to_string());
}

fn sample_self(system: &mut System) -> (f32, u64) {
  system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
  let Ok(pid) = sysinfo::get_current_pid() else {
    return (0.0, 0);
  };
  return system
    .process(pid)
    .map(|p| (p.cpu_usage(), p.memory()))
    .unwrap_or((0.0, 0));
}

/// Runs until `shutdown` observes `true`, publishing a heartbeat every
/// [`HEARTBEAT_INTERVAL`]. `service` is `"worker"` or `"beat"`; the field
/// key in the shared hash is `<hostname>:<pid>` so `AutoClean` can sweep
/// stale entries by age without parsing the service out of the key.
///
/// `shutdown` is a `watch` receiver, not a `Notify`, for the same reason
/// `Worker::run_forever` uses one (`crate::worker`): a `watch::Receiver`
/// compares against the last-seen value on every check, so a shutdown
/// signaled while this loop is off in `ticker.tick()` is never missed.
pub async fn run_heartbeat_loop(
  state: AppState,
  service: &str,
  started_at: f64,
  mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
  let host = hostname();
  let pid = std::process::id();
  let field = state.keys().worker_heartbeat(&host, pid);
  let mut system = System::new();

  if *shutdown.borrow() {
    let _ = state.cache().remove_heartbeat(&field).await;
    return;
  }

  let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
  loop {
    tokio::select! {
      _ = ticker.tick() => {},
      _ = shutdown.changed() => {
        let _ = state.cache().remove_heartbeat(&field).await;
        return;
      }
    }

    let (cpu_percent, memory_bytes) = sample_self(&mut system);
    let payload = HeartbeatPayload {
      hostname: host.clone(),
      pid,
      service: service.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      edition: "community".to_string(),
      uptime_secs: (now_unix() - started_at).max(0.0),
      listening_queues: state.config().worker.listening_queues.clone(),
      process_count: 1,
      cpu_percent,
      memory_bytes,
    };

    let Ok(json) = serde_json::to_string(&payload) else { continue };
    if let Err(e) = state.cache().set_heartbeat(&field, &json).await {
      tracing::warn!(error = %e, "failed to publish heartbeat");
    }
  }
}

/// Reads every live heartbeat entry and sums `process_count` per queue
/// listened to by at least one Worker, for operator-facing liveness
/// dashboards (§4.L). Entries that fail to parse (e.g. from a stale schema
/// version) are skipped rather than failing the whole rollup.
pub async fn aggregate_process_counts(state: &AppState) -> crate::error::Result<std::collections::HashMap<i64, u32>> {
  let entries = state.cache().list_heartbeats().await?;
  let mut counts = std::collections::HashMap::new();

  for (_field, payload) in entries {
    let Ok(heartbeat) = serde_json::from_str::<HeartbeatPayload>(&payload) else { continue };
    for queue in heartbeat.listening_queues {
      *counts.entry(queue).or_insert(0) += heartbeat.process_count;
    }
  }

  return Ok(counts);
}

fn now_unix() -> f64 {
  return std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs_f64();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_heartbeat_payload_roundtrips_through_json() {
    let payload = HeartbeatPayload {
      hostname: "host-a".to_string(),
      pid: 123,
      service: "worker".to_string(),
      version: "0.1.0".to_string(),
      edition: "community".to_string(),
      uptime_secs: 42.5,
      listening_queues: vec![1, 2, 3],
      process_count: 1,
      cpu_percent: 3.5,
      memory_bytes: 1024,
    };
    let json = serde_json::to_string(&payload).unwrap();
    let parsed: HeartbeatPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.hostname, "host-a");
    assert_eq!(parsed.listening_queues, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_aggregate_process_counts_on_empty_store_is_empty() {
    let state = crate::app_state::test_state().await;
    let counts = aggregate_process_counts(&state).await.unwrap();
    assert!(counts.is_empty());
  }
}
