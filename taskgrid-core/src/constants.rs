//! Process-wide defaults. Mirrors the reference workspace's flat
//! `constants.rs` of named literals, for values that are fixed rather than
//! operator-tunable (those live in `config.rs` instead).

use std::time::Duration;

/// Worker queues are numbered `0..numQueues` and statically partitioned;
/// queue 0 is reserved and never a valid `Function.extraConfig.queue`.
pub const RESERVED_QUEUE: i64 = 0;

pub const BEAT_MASTER_LOCK_TTL: Duration = Duration::from_secs(5);
pub const BEAT_TICK_HARD_TIMEOUT: Duration = Duration::from_secs(60);
pub const CRON_STARTER_LOCK_TTL: Duration = Duration::from_secs(10);

/// `seq mod DISTRIBUTION_RANGE` spreads Cron Job Starter enqueues across the
/// matched second, per §4.J.
pub const DISTRIBUTION_RANGE: i64 = 1000;

pub const SCRIPT_CACHE_TTL: Duration = Duration::from_secs(60);

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_MAX_AGE: Duration = Duration::from_secs(60);

pub const MAX_CALL_CHAIN_DEPTH: usize = 16;

pub const ENV_PREFIX: &str = "TASKGRID_";
pub const ENV_CUSTOM_PREFIX: &str = "TASKGRID_CUSTOM_";

/// Data-type keys under which the MD5 index and `ReloadDataMD5Cache` track
/// content hashes (§4.K).
pub const MD5_KIND_SCRIPT: &str = "script";
pub const MD5_KIND_CONNECTOR: &str = "connector";
pub const MD5_KIND_ENV_VARIABLE: &str = "env_variable";

/// `CheckConnector`/`QueryConnector` get a dedicated, much larger timeout
/// than an ordinary Function call, per §4.K.
pub const CONNECTOR_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);
