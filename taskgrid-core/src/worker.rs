//! Worker (§4.H): the task-runner loop plus its supervising process.
//!
//! `Worker::run_forever` is the inner loop — `bpop` a listening queue,
//! dispatch the popped request to an Internal Task or, failing that, a
//! Function run, and exit cleanly once `maxTasksPerProcess` is reached so
//! the supervisor can respawn it (bounding long-run memory growth the same
//! way Beat bounds itself by tick count, §4.I). `Supervisor::run` is the
//! outer loop: it owns the termination-signal handler, the periodic
//! connectivity checks, and heartbeat reporting, and restarts the inner
//! loop whenever it exits for any reason short of a clean shutdown request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::app_state::AppState;
use crate::runtime::FunctionTaskRunner;
use crate::script_loader::ScriptLoader;
use crate::task::{self, TaskRunner};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Why the inner loop or the supervisor stopped. Distinguishes a clean
/// recycle (respawn immediately) from an infrastructure check failure
/// (respawn after a short delay, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  MaxTasksReached,
  RestartAllWorkers,
  SysRedisCheck,
  SysDbCheck,
  Shutdown,
}

pub struct Worker {
  state: AppState,
  dispatch: HashMap<String, Arc<dyn TaskRunner>>,
  loader: ScriptLoader,
  ran_tasks: u64,
}

impl Worker {
  pub fn new(state: AppState) -> Self {
    let loader = ScriptLoader::new(state.clone(), Duration::from_secs(state.config().runtime.script_cache_ttl_secs));
    return Self { dispatch: crate::internal_tasks::dispatch_table(), loader, state, ran_tasks: 0 };
  }

  /// Runs until `maxTasksPerProcess` is reached or `shutdown` observes a
  /// `true` value, whichever comes first. `shutdown` is a `watch` receiver
  /// rather than a `Notify` so a shutdown signaled while a task is mid-run
  /// (i.e. not currently awaited in the `select!` below) is never missed —
  /// `watch` retains the last value, `Notify::notify_waiters` does not.
  pub async fn run_forever(&mut self, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> Result<StopReason> {
    let queues = self.state.config().worker.listening_queues.clone();
    let fetch_timeout = Duration::from_secs_f64(self.state.config().worker.fetch_timeout_secs);
    let max_tasks = self.state.config().worker.max_tasks_per_process;

    if *shutdown.borrow() {
      return Ok(StopReason::Shutdown);
    }

    loop {
      let popped = tokio::select! {
        popped = self.state.queue().bpop(&queues, fetch_timeout) => popped?,
        _ = shutdown.changed() => return Ok(StopReason::Shutdown),
      };

      let Some((queue, request)) = popped else {
        continue;
      };

      let runner = self.resolve_runner(&request.name);
      let instance = task::execute(&self.state, request, runner.as_ref()).await;
      tracing::debug!(
        task_id = %instance.request.id,
        name = %instance.request.name,
        queue,
        status = ?instance.status,
        "task finished"
      );

      self.ran_tasks += 1;
      if self.ran_tasks >= max_tasks {
        return Ok(StopReason::MaxTasksReached);
      }
    }
  }

  /// Internal Tasks first (fixed dispatch table, §4.K); any other name is
  /// treated as a Function id and handed to the Function Runtime.
  fn resolve_runner(&self, name: &str) -> Arc<dyn TaskRunner> {
    if let Some(runner) = self.dispatch.get(name) {
      return runner.clone();
    }
    return Arc::new(FunctionTaskRunner::new(name.to_string(), self.loader.clone()));
  }
}

/// Owns the process lifecycle around one [`Worker`]: signal handling,
/// infrastructure connectivity checks, the restart-all-workers flag, and
/// heartbeat reporting (§4.L). `run` returns once a termination signal is
/// observed; any other stop reason is handled internally by respawning the
/// inner loop.
pub struct Supervisor {
  state: AppState,
  started_at: f64,
}

impl Supervisor {
  pub fn new(state: AppState) -> Self {
    let started_at = now_unix();
    return Self { state, started_at };
  }

  pub async fn run(&self) -> Result<()> {
    // `shutdown` is driven exclusively by the OS termination signal and
    // only ever transitions false -> true once; `watch` (vs. `Notify`)
    // means that transition is still observed even if it lands while the
    // receiver isn't actively being awaited (e.g. mid-task-execution),
    // since a `watch::Receiver` always compares against the last-seen value
    // rather than relying on an in-flight notification.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let signal_task = tokio::spawn(async move {
      wait_for_termination_signal().await;
      let _ = shutdown_tx.send(true);
    });

    let heartbeat_shutdown = shutdown_rx.clone();
    let heartbeat_state = self.state.clone();
    let heartbeat_started_at = self.started_at;
    let heartbeat_task = tokio::spawn(async move {
      crate::observability::run_heartbeat_loop(heartbeat_state, "worker", heartbeat_started_at, heartbeat_shutdown).await;
    });

    let mut shutdown = shutdown_rx;
    loop {
      if *shutdown.borrow() {
        break;
      }

      let mut worker = Worker::new(self.state.clone());

      // Races the inner task-runner loop against the infrastructure checks
      // for this iteration; an infra-check failure drops (force-cancels)
      // whatever `bpop`/task execution the worker was mid-way through, the
      // same non-cooperative fallback the supervisor model allows when a
      // child doesn't exit on its own in time (§5).
      let reason = tokio::select! {
        r = worker.run_forever(&mut shutdown) => r?,
        reason = run_infra_checks(self.state.clone(), self.started_at) => reason,
      };
      tracing::info!(?reason, "worker loop exited");

      if reason == StopReason::Shutdown {
        break;
      }

      // Infrastructure check failures get a short delay before respawn so a
      // flapping dependency doesn't spin the loop hot (§7); a clean
      // recycle (`MaxTasksReached`) or an operator-requested restart
      // respawns immediately.
      if matches!(reason, StopReason::SysRedisCheck | StopReason::SysDbCheck) {
        tokio::time::sleep(Duration::from_secs(1)).await;
      }
    }

    signal_task.abort();
    heartbeat_task.abort();
    return Ok(());
  }
}

/// Races `ctrl-c` against `SIGTERM` (Unix only). Shared by every supervised
/// process entrypoint (`beat`, `worker`) in the `taskgrid-cli` binary.
pub async fn wait_for_termination_signal() {
  let ctrl_c = async {
    let _ = signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    if let Ok(mut term) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
      term.recv().await;
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down worker supervisor"),
    _ = terminate => tracing::info!("received SIGTERM, shutting down worker supervisor"),
  }
}

/// Polls shared-store connectivity and the restart-all-workers flag every
/// few seconds; resolves with the reason on the first failure observed.
/// Raced against the inner worker loop at the call site — dropped
/// (force-cancelled) once the worker loop itself returns first. Public
/// because the `admin-tool` binary's `beat` command races it against
/// [`crate::beat::Beat::run_forever`] the same way.
pub async fn run_infra_checks(state: AppState, started_at: f64) -> StopReason {
  let mut ticker = tokio::time::interval(Duration::from_secs(5));
  loop {
    ticker.tick().await;

    match tokio::time::timeout(Duration::from_secs(3), state.queue().worker_queue_len(0)).await {
      Ok(Ok(_)) => {}
      Ok(Err(e)) => {
        tracing::warn!(error = %e, "shared-store connectivity check failed");
        return StopReason::SysRedisCheck;
      }
      Err(_elapsed) => {
        tracing::warn!("shared-store connectivity check timed out");
        return StopReason::SysRedisCheck;
      }
    }

    // Metadata store is local SQLite (§3), so this never blocks on network;
    // a failure here means the data directory itself is unreachable (e.g.
    // unmounted volume), which is just as fatal to this process as losing
    // the shared store.
    match tokio::time::timeout(Duration::from_secs(3), state.metadata().list_scripts()).await {
      Ok(Ok(_)) => {}
      Ok(Err(e)) => {
        tracing::warn!(error = %e, "metadata store connectivity check failed");
        return StopReason::SysDbCheck;
      }
      Err(_elapsed) => {
        tracing::warn!("metadata store connectivity check timed out");
        return StopReason::SysDbCheck;
      }
    }

    match state.cache().restart_all_workers().await {
      Ok(true) if now_unix() > started_at => {
        tracing::info!("restart-all-workers flag observed");
        return StopReason::RestartAllWorkers;
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(error = %e, "restart-all-workers check failed"),
    }
  }
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
  use crate::app_state::test_state;
  use taskgrid_queue::TaskRequest;

  // Requires a live Redis; exercises invariant 5 of §8 end to end: the
  // worker loop exits cleanly after a single task when maxTasksPerProcess=1.
  #[tokio::test]
  #[ignore]
  async fn test_worker_exits_after_max_tasks() {
    let mut state = test_state().await;
    let mut config = state.config().clone();
    config.worker.max_tasks_per_process = 1;
    config.worker.fetch_timeout_secs = 1.0;
    state = AppState::build(config, state.data_dir().clone()).await.unwrap();

    let request = TaskRequest {
      name: "Internal.SystemMetric".to_string(),
      id: uuid::Uuid::new_v4().to_string(),
      kwargs: serde_json::json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 5.0,
      expires: 300.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };
    state.queue().push(1, &request).await.unwrap();

    let (_tx, mut shutdown) = tokio::sync::watch::channel(false);
    let mut worker = Worker::new(state);
    let reason = worker.run_forever(&mut shutdown).await.unwrap();
    assert_eq!(reason, StopReason::MaxTasksReached);
  }
}
