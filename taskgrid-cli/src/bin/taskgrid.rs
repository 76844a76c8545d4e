#![allow(clippy::needless_return)]

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use taskgrid_cli::{admin_tool, AdminToolCommand, DefaultCommandLineArgs, SubCommands};
use taskgrid_core::config::Config;
use taskgrid_core::{AppState, DataDir};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit codes, per §6: success, generic failure, operator-canceled.
const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELED: i32 = 130;

fn main() {
  let args = DefaultCommandLineArgs::parse();
  if args.shared.dev && std::env::var("RUST_LOG").is_err() {
    std::env::set_var("RUST_LOG", "debug");
  }
  taskgrid_core::logging::init_tracing();

  // A manually-built multi-thread runtime, rather than `#[tokio::main]`,
  // mirrors the reference workspace's CLI entrypoint and lets `main` map
  // the async result to a process exit code after the runtime tears down.
  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(rt) => rt,
    Err(err) => {
      eprintln!("failed to start runtime: {err}");
      std::process::exit(EXIT_FAILURE);
    }
  };

  let code = runtime.block_on(async_main(args));
  std::process::exit(code);
}

async fn async_main(args: DefaultCommandLineArgs) -> i32 {
  let data_dir = DataDir(args.shared.data_dir.clone().into());

  let config = match Config::load(&data_dir.config_path()) {
    Ok(config) => config,
    Err(err) => {
      eprintln!("failed to load config: {err}");
      return EXIT_FAILURE;
    }
  };

  let state = match AppState::build(config, data_dir).await {
    Ok(state) => state,
    Err(err) => {
      eprintln!("failed to initialize: {err}");
      return EXIT_FAILURE;
    }
  };

  return match args.cmd {
    SubCommands::Beat => run_beat(state).await,
    SubCommands::Worker => run_worker(state).await,
    SubCommands::AdminTool(admin_args) => run_admin_tool(&state, admin_args).await,
  };
}

/// Owns the Beat process lifecycle the same way `taskgrid_core::worker::Supervisor`
/// owns the Worker's: termination-signal handling, heartbeat reporting, and
/// respawning the inner tick loop on a clean recycle or an infrastructure
/// check failure (the two share `taskgrid_core::worker::run_infra_checks`
/// since both are equally exposed to shared-store/metadata-store outages).
async fn run_beat(state: AppState) -> i32 {
  let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
  let signal_task = tokio::spawn(async move {
    taskgrid_core::worker::wait_for_termination_signal().await;
    let _ = shutdown_tx.send(true);
  });

  let started_at = now_unix();
  let heartbeat_state = state.clone();
  let heartbeat_shutdown = shutdown_rx.clone();
  let heartbeat_task = tokio::spawn(async move {
    taskgrid_core::observability::run_heartbeat_loop(heartbeat_state, "beat", started_at, heartbeat_shutdown).await;
  });

  let mut shutdown = shutdown_rx;
  loop {
    if *shutdown.borrow() {
      break;
    }

    let mut beat = taskgrid_core::beat::Beat::new(state.clone());
    let infra_reason = tokio::select! {
      result = beat.run_forever() => {
        if let Err(err) = result {
          tracing::warn!(error = %err, "beat tick loop exited with an error");
        }
        None
      }
      reason = taskgrid_core::worker::run_infra_checks(state.clone(), started_at) => Some(reason),
    };

    if let Some(reason) = infra_reason {
      tracing::info!(?reason, "beat loop exited");
      if matches!(
        reason,
        taskgrid_core::worker::StopReason::SysRedisCheck | taskgrid_core::worker::StopReason::SysDbCheck
      ) {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
      }
    }
  }

  signal_task.abort();
  heartbeat_task.abort();
  return EXIT_SUCCESS;
}

async fn run_worker(state: AppState) -> i32 {
  let supervisor = taskgrid_core::worker::Supervisor::new(state);
  return match supervisor.run().await {
    Ok(()) => EXIT_SUCCESS,
    Err(err) => {
      eprintln!("worker supervisor exited with an error: {err}");
      EXIT_FAILURE
    }
  };
}

async fn run_admin_tool(state: &AppState, args: taskgrid_cli::AdminToolArgs) -> i32 {
  let force = args.force;
  let result = match args.cmd {
    AdminToolCommand::ResetAdmin { admin_username, admin_password } => {
      admin_tool::reset_admin(state, force, admin_username, admin_password).await
    }
    AdminToolCommand::ResetUpgradeDbSeq { value } => admin_tool::reset_upgrade_db_seq(state, force, value).await,
    AdminToolCommand::ClearRedis => admin_tool::clear_redis(state, force).await,
    AdminToolCommand::RunSql { source } => admin_tool::run_sql(state, source).await,
  };

  return match result {
    Ok(()) => {
      println!("Done");
      EXIT_SUCCESS
    }
    Err(admin_tool::AdminToolError::Canceled) => {
      println!("Canceled");
      EXIT_CANCELED
    }
    Err(err) => {
      eprintln!("{err}");
      EXIT_FAILURE
    }
  };
}

fn now_unix() -> f64 {
  return SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
}
