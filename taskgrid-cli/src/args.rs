//! Command-line surface for the `taskgrid` binary: the two supervised
//! process entrypoints (`beat`, `worker`, §4.H/§4.I) plus `admin-tool`, the
//! external maintenance surface named in §6. Mirrors the reference
//! workspace's `clap`-derive style (`#[arg(long, env)]` bindings, nested
//! `Subcommand` enums) rather than a hand-rolled argument parser.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "taskgrid", version, about = "Distributed task execution platform: scheduler and worker processes")]
pub struct DefaultCommandLineArgs {
  #[command(flatten)]
  pub shared: SharedArgs,

  #[command(subcommand)]
  pub cmd: SubCommands,
}

#[derive(Debug, Clone, Args)]
pub struct SharedArgs {
  /// Base data directory: metadata-store database, config.toml, secrets, backups (§10.C).
  /// Defaults to `taskgrid_core::DataDir::DEFAULT`.
  #[arg(long, env = "TASKGRID_DATA_DIR", default_value = "taskgriddepot")]
  pub data_dir: String,

  /// Verbose logging (`debug` instead of `info`).
  #[arg(long, env = "TASKGRID_DEV", default_value_t = false)]
  pub dev: bool,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
  /// Run the Beat leader-elected clock process (§4.I). Exits and is
  /// respawned by its own supervisor loop every `beat.recycleAfterTicks`
  /// ticks or on an infrastructure check failure.
  Beat,

  /// Run a Worker supervisor process (§4.H): pops tasks off the listening
  /// queues, dispatches to Internal Tasks or the Function Runtime, and
  /// respawns its inner loop on recycle or infrastructure failure.
  Worker,

  /// Administrative maintenance commands (§6), run out-of-band from the
  /// Beat/Worker processes — e.g. `taskgrid admin-tool reset-admin`.
  AdminTool(AdminToolArgs),
}

#[derive(Debug, Args)]
pub struct AdminToolArgs {
  /// Run without the interactive confirmation prompt.
  #[arg(short = 'f', long)]
  pub force: bool,

  #[command(subcommand)]
  pub cmd: AdminToolCommand,
}

#[derive(Debug, Subcommand)]
pub enum AdminToolCommand {
  /// Reset the platform's administrative credential record.
  ResetAdmin {
    #[arg(long)]
    admin_username: Option<String>,

    #[arg(long)]
    admin_password: Option<String>,
  },

  /// Reset the metadata-store upgrade sequence marker.
  ResetUpgradeDbSeq {
    /// New sequence value. Prompted interactively when omitted.
    #[arg(long)]
    value: Option<String>,
  },

  /// Flush the entire shared Redis store (queues, locks, cache, heartbeats).
  ClearRedis,

  /// Run a raw SQL statement against the metadata store.
  RunSql {
    /// A local file path, an `http(s)://` URL, or a literal SQL statement.
    /// Prompted interactively when omitted.
    source: Option<String>,
  },
}
