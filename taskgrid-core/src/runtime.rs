//! Function Runtime (§4.F): executes one Function inside a freshly
//! constructed script scope. Grounded on the reference workspace's
//! `js::runtime` — a message-passed, dedicated-OS-thread V8 isolate pool
//! behind an `async_channel`, the same shape as `RuntimeSingleton` there —
//! with the HTTP dispatch half dropped (that surface belongs to the admin
//! API, explicitly out of scope here, §1) and a Rust-side `TaskContext`
//! dropped in to replace the request/response plumbing.
//!
//! Every per-call capability helper (`LOG`, `VAR`, `CONN`, `ENV`, `CTX`,
//! `STORE`, `CACHE`, `CONFIG`, `SQL`, `RSRC`, `SIGN`, the `RESP` family,
//! `FUNC`, `THREAD`, `TOOLKIT`, `EXTRA_GUANCE_DATA`) is registered as a
//! native function bound to the run's [`RunState`], which is set on the
//! isolate's own thread immediately before the call and cleared immediately
//! after — so no lock is required despite N isolate threads serving
//! concurrent runs.
//!
//! `API`/`BLUEPRINT`/`SYNC_API`/`ASYNC_API`/`CRON_JOB` are decorators
//! evaluated at Script *publish* time, not per-call natives — that
//! publish pipeline writes the entity rows the decorators describe, which
//! falls under the out-of-scope admin API (§1). This module still owns
//! the part of that contract the execution engine depends on:
//! [`validate_api_descriptor`] and [`normalize_delayed_cron_job`] enforce
//! the same constraints the publish pipeline must, so a Script accepted
//! by either path produces Functions the Worker and Beat can actually run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskgrid_queue::TaskRequest;
use tokio::sync::oneshot;

use crate::app_state::AppState;
use crate::constants::MAX_CALL_CHAIN_DEPTH;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  #[error("metadata: {0}")]
  Metadata(#[from] taskgrid_schema::MetadataError),

  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),

  #[error("cipher: {0}")]
  Cipher(#[from] taskgrid_extension::CipherError),

  #[cfg(feature = "v8")]
  #[error("script: {0}")]
  Script(#[from] rustyscript::Error),

  #[error("circular call: {0} already present in call chain")]
  CircularCall(String),

  #[error("call chain depth exceeded ({0} >= max)")]
  CallChainTooDeep(usize),

  #[error("duplicate API registration: {0}")]
  DuplicateApi(String),

  #[error("invalid fixedCronExpr: {0}")]
  InvalidCronExpr(String),

  #[error("queue {0} is not a valid target (0 is reserved)")]
  InvalidQueue(i64),

  #[error("unknown integration: {0}")]
  UnknownIntegration(String),

  #[error("unsupported connector kind: {0}")]
  UnsupportedConnector(String),

  #[error("unknown connector: {0}")]
  UnknownConnector(String),

  #[error("unknown env variable: {0}")]
  UnknownEnvVariable(String),

  #[error("duplicate thread-pool key: {0}")]
  DuplicateThreadKey(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Descriptor recorded by the `API` decorator (§4.F). Flows into
/// `functions.extra_config_json`/`functions` rows when a Script is
/// (re-)published; user code never writes the table directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDescriptor {
  pub name: String,
  pub title: String,
  pub category: Option<String>,
  pub tags: Vec<String>,
  pub is_hidden: bool,
  pub extra_config: taskgrid_schema::entities::FunctionExtraConfig,
  pub integration: Option<String>,
}

const MIN_TIMEOUT_SECS: f64 = 1.0;
const MAX_TIMEOUT_SECS: f64 = 3600.0;
const MIN_EXPIRES_SECS: f64 = 1.0;
const MAX_EXPIRES_SECS: f64 = 86_400.0;

/// Validates the constraints §4.F lists for the `API` decorator.
pub fn validate_api_descriptor(
  seen_names: &std::collections::HashSet<String>,
  descriptor: &ApiDescriptor,
  num_queues: i64,
) -> Result<()> {
  if seen_names.contains(&descriptor.name) {
    return Err(RuntimeError::DuplicateApi(descriptor.name.clone()));
  }

  if let Some(expr) = &descriptor.extra_config.fixed_cron_expr {
    if expr.split_whitespace().count() != 5 || !taskgrid_queue::CronMatcher::is_valid(expr) {
      return Err(RuntimeError::InvalidCronExpr(expr.clone()));
    }
  }

  if let Some(timeout) = descriptor.extra_config.timeout {
    let t = timeout as f64;
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&t) {
      return Err(RuntimeError::InvalidCronExpr(format!("timeout {t} out of range")));
    }
  }

  if let Some(expires) = descriptor.extra_config.expires {
    let e = expires as f64;
    if !(MIN_EXPIRES_SECS..=MAX_EXPIRES_SECS).contains(&e) {
      return Err(RuntimeError::InvalidCronExpr(format!("expires {e} out of range")));
    }
  }

  if let Some(queue) = descriptor.extra_config.queue {
    if queue == crate::constants::RESERVED_QUEUE || queue < 0 || queue >= num_queues {
      return Err(RuntimeError::InvalidQueue(queue));
    }
  }

  if let Some(integration) = &descriptor.integration {
    if integration != "signIn" && integration != "autoRun" {
      return Err(RuntimeError::UnknownIntegration(integration.clone()));
    }
  }

  return Ok(());
}

/// Sorts and deduplicates `delayedCronJob`, per §4.F.
pub fn normalize_delayed_cron_job(delays: &mut Vec<i64>) {
  delays.sort_unstable();
  delays.dedup();
}

/// Per-run state, set on the isolate's own OS thread immediately before a
/// call and cleared immediately after (§4.F, §9: breaks the Task ↔ helpers
/// ↔ Task cycle by handing helpers an opaque context instead of a
/// back-reference to the Task).
pub struct RunState {
  pub app: AppState,
  pub task_id: String,
  pub origin_id: String,
  pub queue: i64,
  pub trigger_time: f64,
  pub num_queues: i64,
  pub call_chain: Vec<String>,
  pub started_at: Instant,
  pub logs: Vec<(f64, String)>,
  pub secrets: Vec<String>,
  pub extra_tags: HashMap<String, String>,
  pub thread_pool: HashMap<String, Value>,
  /// Scripts reachable from the entry module's `__`-delimited imports
  /// (§4.F, §4.E), pre-resolved before the call is dispatched to the
  /// isolate thread since [`rustyscript::module_loader::ImportProvider`]'s
  /// `import` hook is synchronous and cannot itself await the loader.
  pub script_imports: HashMap<String, std::sync::Arc<crate::script_loader::LoadedScript>>,
}

impl RunState {
  pub fn new(app: AppState, request: &TaskRequest) -> Self {
    return Self {
      app,
      task_id: request.id.clone(),
      origin_id: request.id.clone(),
      queue: request.queue,
      trigger_time: request.trigger_time,
      num_queues: 0,
      call_chain: request.call_chain.clone(),
      started_at: Instant::now(),
      logs: Vec::new(),
      secrets: Vec::new(),
      extra_tags: HashMap::new(),
      thread_pool: HashMap::new(),
      script_imports: HashMap::new(),
    };
  }

  fn elapsed(&self) -> f64 {
    return self.started_at.elapsed().as_secs_f64();
  }

  fn log(&mut self, message: String) {
    let masked = mask(&message, &self.secrets);
    self.logs.push((self.elapsed(), masked));
  }
}

fn mask(message: &str, secrets: &[String]) -> String {
  let mut sorted: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
  sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));
  let mut out = message.to_string();
  for secret in sorted {
    out = out.replace(secret.as_str(), "***");
  }
  return out;
}

/// The outcome of one Function call, handed back to the Task Base caller
/// (`task::execute`) to fold into its own log buffer and Task Record.
pub struct FunctionRunOutput {
  pub value: Value,
  pub logs: Vec<(f64, String)>,
  pub extra_tags: HashMap<String, String>,
}

// --- V8-backed execution, gated behind the `v8` feature -----------------------------------------------------------

#[cfg(feature = "v8")]
mod v8_backend {
  use std::cell::RefCell;
  use std::sync::OnceLock;

  use super::*;
  use rustyscript::deno_core::anyhow::anyhow;
  use rustyscript::deno_core::{ModuleSpecifier, RequestedModuleType, ResolutionKind};
  use rustyscript::module_loader::ImportProvider;
  use rustyscript::{Module, Runtime, RuntimeOptions};

  type AnyError = Box<dyn std::error::Error + Send + Sync>;

  const SCRIPT_IMPORT_SCHEME: &str = "taskgrid-script";

  /// Resolves `__`-delimited import specifiers (§4.E/§4.F) to Scripts
  /// pre-loaded into the active run's [`RunState::script_imports`] before
  /// the call was dispatched to this isolate thread. Every other specifier
  /// — relative paths, unscoped bare names — falls through untouched so
  /// the host's normal resolver handles it (and, for anything it doesn't
  /// recognize either, reports the same error it always would).
  #[derive(Default)]
  struct ScriptImportProvider;

  impl ImportProvider for ScriptImportProvider {
    fn resolve(
      &mut self,
      specifier: &ModuleSpecifier,
      _referrer: &str,
      _kind: ResolutionKind,
    ) -> Option<std::result::Result<ModuleSpecifier, rustyscript::deno_core::anyhow::Error>> {
      if specifier.scheme() == SCRIPT_IMPORT_SCHEME {
        return Some(Ok(specifier.clone()));
      }

      let name = specifier.path().rsplit('/').next().unwrap_or_default();
      if name.contains("__") {
        return Some(
          ModuleSpecifier::parse(&format!("{SCRIPT_IMPORT_SCHEME}://{name}")).map_err(|e| anyhow!(e.to_string())),
        );
      }

      return None;
    }

    fn import(
      &mut self,
      specifier: &ModuleSpecifier,
      _referrer: Option<&ModuleSpecifier>,
      _is_dyn_import: bool,
      _requested_module_type: RequestedModuleType,
    ) -> Option<std::result::Result<String, rustyscript::deno_core::anyhow::Error>> {
      if specifier.scheme() != SCRIPT_IMPORT_SCHEME {
        return None;
      }

      let script_id = specifier.host_str().unwrap_or_default().to_string();
      let lookup = with_run_state(|s| s.script_imports.get(&script_id).map(|script| script.code.clone()));
      return Some(match lookup {
        Ok(Some(code)) => Ok(code),
        Ok(None) => Err(anyhow!("unknown script import: {script_id}")),
        Err(e) => Err(anyhow!(e.to_string())),
      });
    }
  }

  enum Message {
    Run(Box<dyn FnOnce(&mut Runtime) + Send>),
    CallFunction(
      Module,
      String,
      Vec<Value>,
      RunState,
      oneshot::Sender<(std::result::Result<Value, AnyError>, RunState)>,
    ),
  }

  struct IsolateThread {
    sender: async_channel::Sender<Message>,
    _handle: std::thread::JoinHandle<()>,
  }

  /// Mirrors the reference workspace's `RuntimeSingleton`: the V8 platform
  /// is process-global and must only be initialized once, so the pool of
  /// isolate threads is a `OnceLock`.
  struct IsolatePool {
    threads: Vec<IsolateThread>,
    next: std::sync::atomic::AtomicUsize,
  }

  impl IsolatePool {
    fn pick(&self) -> &IsolateThread {
      let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.threads.len();
      return &self.threads[idx];
    }
  }

  fn pool(n_threads: usize) -> &'static IsolatePool {
    static POOL: OnceLock<IsolatePool> = OnceLock::new();
    return POOL.get_or_init(|| {
      rustyscript::init_platform(n_threads.max(1) as u32, true);

      let threads = (0..n_threads.max(1))
        .map(|index| spawn_isolate_thread(index))
        .collect();

      return IsolatePool { threads, next: std::sync::atomic::AtomicUsize::new(0) };
    });
  }

  fn spawn_isolate_thread(index: usize) -> IsolateThread {
    let (sender, receiver) = async_channel::unbounded::<Message>();

    let handle = std::thread::Builder::new()
      .name(format!("function-runtime-{index}"))
      .spawn(move || {
        let tokio_runtime = std::rc::Rc::new(
          tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .enable_io()
            .thread_name("function-runtime")
            .build()
            .expect("function-runtime tokio startup"),
        );

        let mut runtime = Runtime::with_tokio_runtime(
          RuntimeOptions { import_provider: Some(Box::new(ScriptImportProvider)), ..Default::default() },
          tokio_runtime.clone(),
        )
        .expect("function-runtime v8 startup");
        install_capabilities(&mut runtime).expect("failed to register function-runtime capabilities");

        tokio_runtime.block_on(async move {
          while let Ok(msg) = receiver.recv().await {
            match msg {
              Message::Run(f) => f(&mut runtime),
              Message::CallFunction(module, name, args, run_state, reply) => {
                let current = RUN_STATE.with(|slot| slot.borrow_mut().replace(run_state));
                debug_assert!(current.is_none(), "isolate thread reentered while a run was active");

                let result = match runtime.load_module_async(&module).await {
                  Ok(handle) => runtime
                    .call_function_async::<Value>(Some(&handle), &name, &args)
                    .await
                    .map_err(|e| Box::new(e) as AnyError),
                  // A script that fails to parse/compile never reaches
                  // `call_function_async` — surface the load error itself
                  // as the task's failure instead of silently calling into
                  // no module (§7: a script error must reach the task
                  // exception, not vanish).
                  Err(e) => Err(Box::new(e) as AnyError),
                };

                let finished = RUN_STATE.with(|slot| slot.borrow_mut().take()).expect("run state vanished");
                let _ = reply.send((result, finished));
              }
            }
          }
        });
      })
      .expect("spawn function-runtime isolate thread");

    return IsolateThread { sender, _handle: handle };
  }

  thread_local! {
    static RUN_STATE: RefCell<Option<RunState>> = const { RefCell::new(None) };
  }

  /// Runs inside capability closures: every closure below executes on the
  /// same isolate thread that owns `RUN_STATE`, so borrowing it is always
  /// sound — there is no cross-thread access.
  fn with_run_state<R>(f: impl FnOnce(&mut RunState) -> R) -> std::result::Result<R, rustyscript::Error> {
    return RUN_STATE.with(|slot| {
      let mut guard = slot.borrow_mut();
      let Some(state) = guard.as_mut() else {
        return Err(rustyscript::Error::Runtime("no active task run".to_string()));
      };
      Ok(f(state))
    });
  }

  fn get_arg<T: serde::de::DeserializeOwned>(args: &[Value], index: usize) -> std::result::Result<T, rustyscript::Error> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    return serde_json::from_value(value).map_err(|e| rustyscript::Error::Runtime(e.to_string()));
  }

  /// Registers every capability helper (§4.F) on a freshly built isolate.
  /// Called once per isolate thread at startup, not per run.
  fn install_capabilities(runtime: &mut Runtime) -> std::result::Result<(), rustyscript::Error> {
    runtime.register_function("__log", |args: &[Value]| {
      let message: String = get_arg(args, 0)?;
      with_run_state(|s| s.log(message))?;
      return Ok(Value::Null);
    })?;

    runtime.register_function("__ctx", |_args: &[Value]| {
      return with_run_state(|s| {
        json!({
          "taskId": s.task_id,
          "originId": s.origin_id,
          "queue": s.queue,
          "triggerTime": s.trigger_time,
          "callChain": s.call_chain,
        })
      });
    })?;

    runtime.register_function("__sign_hmac_sha256", |args: &[Value]| {
      use hmac::{Hmac, Mac};
      use sha2::Sha256;

      let key: String = get_arg(args, 0)?;
      let message: String = get_arg(args, 1)?;

      let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
      mac.update(message.as_bytes());
      let digest = mac.finalize().into_bytes();
      return Ok(json!(hex_encode(&digest)));
    })?;

    runtime.register_function("__toolkit_uuid", |_args: &[Value]| {
      return Ok(json!(uuid::Uuid::new_v4().to_string()));
    })?;

    runtime.register_function("__toolkit_md5", |args: &[Value]| {
      let text: String = get_arg(args, 0)?;
      return Ok(json!(taskgrid_extension::md5_hex_digest(text.as_bytes())));
    })?;

    runtime.register_function("__extra_guance_data", |args: &[Value]| {
      let tags: HashMap<String, String> = get_arg(args, 0)?;
      with_run_state(|s| s.extra_tags.extend(tags))?;
      return Ok(Value::Null);
    })?;

    runtime.register_function("__resp_wrap", |args: &[Value]| {
      let kind: String = get_arg(args, 0)?;
      let payload: Value = get_arg(args, 1)?;
      return Ok(json!({"__respKind": kind, "payload": payload}));
    })?;

    runtime.register_async_function("__var", |args: Vec<Value>| {
      Box::pin(async move {
        let id: String = get_arg(&args, 0)?;
        let app = with_run_state(|s| s.app.clone())?;
        let Some(row) = app
          .metadata()
          .get_env_variable(&id)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?
        else {
          return Err(rustyscript::Error::Runtime(format!("unknown env variable: {id}")));
        };

        let is_password = row.auto_type_casting == "password";
        let cleartext = decrypt_env_value(&app, &row).map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;

        if is_password {
          with_run_state(|s| s.secrets.push(cleartext.clone()))?;
        }

        return Ok(cast_env_value(&row.auto_type_casting, &cleartext));
      })
    })?;

    runtime.register_function("__env", |args: &[Value]| {
      let name: String = get_arg(args, 0)?;
      return Ok(match std::env::var(&name) {
        Ok(v) => json!(v),
        Err(_) => Value::Null,
      });
    })?;

    runtime.register_function("__config", |args: &[Value]| {
      let key: String = get_arg(args, 0)?;
      let custom = crate::config::Config::custom_config_from_env();
      return Ok(match custom.get(&key) {
        Some(v) => json!(v),
        None => Value::Null,
      });
    })?;

    runtime.register_async_function("__store_get", |args: Vec<Value>| {
      Box::pin(async move {
        let scope: String = get_arg(&args, 0)?;
        let key: String = get_arg(&args, 1)?;
        let app = with_run_state(|s| s.app.clone())?;
        let now = app.time().now().await.unwrap_or(0.0) as i64;
        let value = app
          .metadata()
          .store_get(&scope, &key, now)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(match value {
          Some(v) => serde_json::from_str(&v).unwrap_or(Value::Null),
          None => Value::Null,
        });
      })
    })?;

    runtime.register_async_function("__store_set", |args: Vec<Value>| {
      Box::pin(async move {
        let scope: String = get_arg(&args, 0)?;
        let key: String = get_arg(&args, 1)?;
        let value: Value = get_arg(&args, 2)?;
        let expire_in_secs: Option<f64> = get_arg(&args, 3)?;
        let app = with_run_state(|s| s.app.clone())?;
        let now = app.time().now().await.unwrap_or(0.0);
        let expire_at = expire_in_secs.map(|secs| (now + secs) as i64);

        app
          .metadata()
          .store_set(&scope, &key, &value.to_string(), expire_at, now as i64)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(Value::Null);
      })
    })?;

    runtime.register_async_function("__cache_get", |args: Vec<Value>| {
      Box::pin(async move {
        let namespace: String = get_arg(&args, 0)?;
        let key: String = get_arg(&args, 1)?;
        let app = with_run_state(|s| s.app.clone())?;
        let value = app
          .cache()
          .user_cache_get(&namespace, &key)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(match value {
          Some(v) => serde_json::from_str(&v).unwrap_or(Value::Null),
          None => Value::Null,
        });
      })
    })?;

    runtime.register_async_function("__cache_set", |args: Vec<Value>| {
      Box::pin(async move {
        let namespace: String = get_arg(&args, 0)?;
        let key: String = get_arg(&args, 1)?;
        let value: Value = get_arg(&args, 2)?;
        let ttl_secs: Option<u64> = get_arg(&args, 3)?;
        let app = with_run_state(|s| s.app.clone())?;
        app
          .cache()
          .user_cache_set(&namespace, &key, &value.to_string(), ttl_secs.map(Duration::from_secs))
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(Value::Null);
      })
    })?;

    runtime.register_async_function("__conn_get", |args: Vec<Value>| {
      Box::pin(async move {
        let id: String = get_arg(&args, 0)?;
        let app = with_run_state(|s| s.app.clone())?;
        let Some(row) = app
          .metadata()
          .get_connector(&id)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?
        else {
          return Err(rustyscript::Error::Runtime(format!("unknown connector: {id}")));
        };

        let config = decrypt_connector_config(&app, &row).map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(json!({"id": row.id, "type": row.connector_type, "config": config}));
      })
    })?;

    runtime.register_function("__thread_get", |args: &[Value]| {
      let key: String = get_arg(args, 0)?;
      return with_run_state(|s| s.thread_pool.get(&key).cloned().unwrap_or(Value::Null));
    })?;

    runtime.register_function("__thread_set", |args: &[Value]| {
      let key: String = get_arg(args, 0)?;
      let value: Value = get_arg(args, 1)?;
      with_run_state(|s| s.thread_pool.insert(key, value))?;
      return Ok(Value::Null);
    })?;

    // `RSRC`: named byte-blob resources a Script bundles alongside its code
    // (e.g. a lookup table or template), stored in the same Func Store the
    // `STORE` helper uses, under a reserved scope so user `STORE` keys never
    // collide with resource names.
    runtime.register_async_function("__rsrc_get", |args: Vec<Value>| {
      Box::pin(async move {
        let name: String = get_arg(&args, 0)?;
        let app = with_run_state(|s| s.app.clone())?;
        let now = app.time().now().await.unwrap_or(0.0) as i64;
        let value = app
          .metadata()
          .store_get(RESOURCE_SCOPE, &name, now)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(match value {
          Some(v) => serde_json::from_str(&v).unwrap_or(Value::Null),
          None => Value::Null,
        });
      })
    })?;

    // `SQL`: a read-only escape hatch into the metadata store for user code
    // that needs an ad hoc query the entity helpers don't cover. Statements
    // are executed through the same connection every other metadata access
    // goes through; write statements are rejected up front since a Script's
    // `SQL` calls must not be able to mutate platform tables out from under
    // the entity helpers.
    runtime.register_async_function("__sql_query", |args: Vec<Value>| {
      Box::pin(async move {
        let statement: String = get_arg(&args, 0)?;
        if !is_read_only_statement(&statement) {
          return Err(rustyscript::Error::Runtime("SQL: only SELECT statements are permitted".to_string()));
        }

        let app = with_run_state(|s| s.app.clone())?;
        let rows = app
          .metadata()
          .connection()
          .query_values::<serde_json::Map<String, Value>>(&statement, taskgrid_sqlite::params!())
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;
        return Ok(Value::Array(rows.into_iter().map(Value::Object).collect()));
      })
    })?;

    runtime.register_async_function("__func", |args: Vec<Value>| {
      Box::pin(async move {
        let func_id: String = get_arg(&args, 0)?;
        let kwargs: Value = get_arg(&args, 1)?;

        let (app, call_chain) = with_run_state(|s| (s.app.clone(), s.call_chain.clone()))?;

        if call_chain.contains(&func_id) {
          return Err(rustyscript::Error::Runtime(format!("circular call: {func_id} already in call chain")));
        }
        if call_chain.len() >= MAX_CALL_CHAIN_DEPTH {
          return Err(rustyscript::Error::Runtime(format!("call chain depth exceeded: {}", call_chain.len())));
        }

        let Some(function) = app
          .metadata()
          .get_function(&func_id)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?
        else {
          return Err(rustyscript::Error::Runtime(format!("unknown function: {func_id}")));
        };
        let extra = function.extra_config().unwrap_or_default();

        let now = app.time().now().await.unwrap_or(0.0);
        let mut new_chain = call_chain;
        new_chain.push(func_id.clone());

        let request = TaskRequest {
          name: func_id.clone(),
          id: uuid::Uuid::new_v4().to_string(),
          kwargs,
          trigger_time: now,
          queue: extra.queue.unwrap_or(1),
          eta: None,
          delay: 0.0,
          timeout: extra.timeout.unwrap_or(60) as f64,
          expires: extra.expires.unwrap_or(300) as f64,
          ignore_result: true,
          task_record_limit: None,
          call_chain: new_chain,
          cron_job_lock: None,
        };

        app
          .queue()
          .push(request.queue, &request)
          .await
          .map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;

        return Ok(json!(request.id));
      })
    })?;

    return Ok(());
  }

  const RESOURCE_SCOPE: &str = "__rsrc";

  /// Conservative allow-list: the first non-whitespace token must be
  /// `SELECT` or `WITH` (a read-only CTE). Anything else — `INSERT`,
  /// `UPDATE`, `DELETE`, `PRAGMA`, DDL — is rejected before it ever reaches
  /// the connection, since `SQL` is a read helper for Scripts, not a way to
  /// bypass the entity helpers' own validation.
  fn is_read_only_statement(statement: &str) -> bool {
    let first_word = statement.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
    return first_word == "SELECT" || first_word == "WITH";
  }

  fn decrypt_env_value(app: &AppState, row: &taskgrid_schema::entities::EnvVariable) -> Result<String> {
    if row.auto_type_casting != "password" {
      return Ok(row.value_text.clone());
    }
    let bytes = base64_decode(&row.value_text);
    let plain = taskgrid_extension::decrypt(app.cipher_key(), row.id.as_bytes(), &bytes)?;
    return Ok(String::from_utf8_lossy(&plain).to_string());
  }

  fn decrypt_connector_config(app: &AppState, row: &taskgrid_schema::entities::Connector) -> Result<Value> {
    let mut config: Value = serde_json::from_str(&row.config_json).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut config {
      for (key, value) in map.iter_mut() {
        if key.ends_with("_secret") || key == "password" || key == "token" || key == "secret" {
          if let Value::String(encoded) = value {
            let bytes = base64_decode(encoded);
            if let Ok(plain) = taskgrid_extension::decrypt(app.cipher_key(), row.id.as_bytes(), &bytes) {
              *value = Value::String(String::from_utf8_lossy(&plain).to_string());
            }
          }
        }
      }
    }
    return Ok(config);
  }

  fn cast_env_value(kind: &str, raw: &str) -> Value {
    return match kind {
      "integer" => raw.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
      "float" => raw.parse::<f64>().map(Value::from).unwrap_or(Value::Null),
      "boolean" => raw.parse::<bool>().map(Value::from).unwrap_or(Value::Null),
      "json" => serde_json::from_str(raw).unwrap_or(Value::Null),
      "commaArray" => json!(raw.split(',').map(str::trim).collect::<Vec<_>>()),
      _ => json!(raw),
    };
  }

  fn base64_decode(s: &str) -> Vec<u8> {
    use base64::Engine;
    return base64::engine::general_purpose::STANDARD.decode(s).unwrap_or_default();
  }

  fn hex_encode(bytes: &[u8]) -> String {
    return bytes.iter().map(|b| format!("{b:02x}")).collect();
  }

  pub async fn run_function(
    app: &AppState,
    request: &TaskRequest,
    code: &str,
    function_name: &str,
    kwargs: Value,
    n_threads: usize,
    script_imports: HashMap<String, std::sync::Arc<crate::script_loader::LoadedScript>>,
  ) -> Result<FunctionRunOutput> {
    let mut run_state = RunState::new(app.clone(), request);
    run_state.num_queues = app.config().num_queues;
    run_state.script_imports = script_imports;

    let module = Module::new(&format!("{}.ts", request.name), code);
    let isolate = pool(n_threads).pick();

    let (reply_tx, reply_rx) = oneshot::channel();
    isolate
      .sender
      .send(Message::CallFunction(
        module,
        function_name.to_string(),
        vec![kwargs],
        run_state,
        reply_tx,
      ))
      .await
      .map_err(|_| rustyscript::Error::Runtime("function-runtime isolate gone".to_string()))?;

    let (result, finished_state) = reply_rx
      .await
      .map_err(|_| rustyscript::Error::Runtime("function-runtime reply dropped".to_string()))?;

    let value = result.map_err(|e| rustyscript::Error::Runtime(e.to_string()))?;

    return Ok(FunctionRunOutput {
      value,
      logs: finished_state.logs,
      extra_tags: finished_state.extra_tags,
    });
  }

  pub(super) fn install_on(runtime: &mut Runtime) -> std::result::Result<(), rustyscript::Error> {
    return install_capabilities(runtime);
  }
}

#[cfg(feature = "v8")]
pub use v8_backend::run_function;

/// Without the `v8` feature, the Function Runtime still builds (and the
/// rest of the engine — Beat, Worker, Cron Job Starter — still functions
/// for internal task classes that don't execute user scripts); attempting
/// to run an actual user Function is a clear, typed error instead of a
/// missing symbol.
#[cfg(not(feature = "v8"))]
pub async fn run_function(
  _app: &AppState,
  _request: &TaskRequest,
  _code: &str,
  _function_name: &str,
  _kwargs: Value,
  _n_threads: usize,
  _script_imports: HashMap<String, std::sync::Arc<crate::script_loader::LoadedScript>>,
) -> Result<FunctionRunOutput> {
  return Err(RuntimeError::UnsupportedConnector("v8 feature disabled".to_string()));
}

const CACHE_RESULT_SCOPE: &str = "func_result_cache";

fn cache_fingerprint(func_id: &str, kwargs: &Value) -> String {
  let canonical = serde_json::to_string(kwargs).unwrap_or_default();
  return taskgrid_extension::md5_hex_digest(format!("{func_id}:{canonical}").as_bytes());
}

/// Wraps one Function run as a [`crate::task::TaskRunner`] (§4.F + §4.G):
/// the Worker falls back to this for any Task Request name that isn't in
/// `internal_tasks::dispatch_table` (§4.H). Resolves the owning Script
/// through the per-process [`crate::script_loader::ScriptLoader`], checks
/// the `cacheResult` fast path, executes via [`run_function`], and folds
/// the isolate's captured log lines and the Cron Job lock (if the request
/// carries one, §4.J) into the ordinary Task Base lifecycle.
pub struct FunctionTaskRunner {
  func_id: String,
  loader: crate::script_loader::ScriptLoader,
  /// Per-task-instance: a run's own `__`-delimited imports are resolved at
  /// most once for this run, independent of the process-wide loader cache's
  /// TTL (§4.E). Fresh per [`FunctionTaskRunner`], which is itself
  /// constructed fresh per dispatched Task Request (see `worker.rs`).
  script_cache: crate::script_loader::TaskScriptCache,
}

impl FunctionTaskRunner {
  pub fn new(func_id: String, loader: crate::script_loader::ScriptLoader) -> Self {
    return Self { func_id, loader, script_cache: crate::script_loader::TaskScriptCache::new() };
  }

  async fn run_once(
    &self,
    ctx: &mut crate::task::TaskContext<'_>,
    kwargs: Value,
  ) -> std::result::Result<Value, crate::task::TaskError> {
    use crate::task::TaskError;

    let state = ctx.state;
    let request = ctx.request;
    let now = ctx.start_time;
    let started = Instant::now();

    let Some((script_id, function_name)) = self.func_id.rsplit_once('.') else {
      return Err(TaskError::Failure(format!("malformed function id: {}", self.func_id)));
    };

    let loaded = self
      .loader
      .load(script_id, false, now)
      .await
      .map_err(|e| TaskError::Failure(e.to_string()))?
      .ok_or_else(|| TaskError::Failure(format!("unknown script: {script_id}")))?;

    let extra = loaded.functions.get(self.func_id.as_str()).cloned().unwrap_or_default();

    // `cacheResult` fast path (invariant 5 of §8): an identical fingerprint
    // within the configured TTL returns the cached value without touching
    // the isolate pool at all, so S5's "< 1s" bound holds regardless of how
    // expensive the original call was.
    let fingerprint = extra.cache_result.map(|ttl_secs| (ttl_secs, cache_fingerprint(&self.func_id, &kwargs)));
    if let Some((ttl_secs, fingerprint)) = &fingerprint {
      if let Some(cached) = state
        .metadata()
        .store_get(CACHE_RESULT_SCOPE, fingerprint, now as i64)
        .await
        .map_err(|e| TaskError::Failure(e.to_string()))?
      {
        ctx.log(now, format!("cache hit for {} (ttl {ttl_secs}s)", self.func_id));
        return Ok(serde_json::from_str(&cached).unwrap_or(Value::Null));
      }
    }

    let script_imports = self
      .loader
      .resolve_imports(&loaded.code, &self.script_cache, now)
      .await
      .map_err(|e| TaskError::Failure(e.to_string()))?;

    let output = run_function(
      state,
      request,
      &loaded.code,
      function_name,
      kwargs,
      state.config().runtime.thread_pool_size,
      script_imports,
    )
    .await
    .map_err(|e| TaskError::Failure(e.to_string()))?;

    for (offset, message) in &output.logs {
      ctx.log(now + offset, message.clone());
    }

    if let Some((ttl_secs, fingerprint)) = &fingerprint {
      let expire_at = Some(now as i64 + ttl_secs);
      let _ = state
        .metadata()
        .store_set(CACHE_RESULT_SCOPE, fingerprint, &output.value.to_string(), expire_at, now as i64)
        .await;
    }

    let record = taskgrid_schema::entities::TaskRecordFunc {
      seq: 0,
      task_id: request.id.clone(),
      func_id: self.func_id.clone(),
      cost_ms: started.elapsed().as_millis() as i64,
      status: "success".to_string(),
      create_time: now as i64,
    };
    let _ = state.metadata().insert_task_record_func(&record).await;

    return Ok(output.value);
  }
}

// The Cron Job lock a request may carry (`request.cron_job_lock`, §4.J) is
// acquired and released by `task::execute` itself, around the same
// `tokio::time::timeout` that bounds `run_once` — not here. `run_once` is a
// plain cancellable future; acquiring the lock around it in this impl would
// mean a timeout drops the future before the unlock below it ever runs,
// leaving release to the lock's TTL alone instead of the run's actual end.
#[async_trait::async_trait]
impl crate::task::TaskRunner for FunctionTaskRunner {
  fn name(&self) -> &str {
    return &self.func_id;
  }

  async fn run(
    &self,
    ctx: &mut crate::task::TaskContext<'_>,
    kwargs: Value,
  ) -> std::result::Result<Value, crate::task::TaskError> {
    return self.run_once(ctx, kwargs).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use taskgrid_schema::entities::{FunctionExtraConfig, IntegrationConfig};

  #[test]
  fn test_validate_api_descriptor_rejects_reserved_queue() {
    let descriptor = ApiDescriptor {
      name: "plus".to_string(),
      title: "Plus".to_string(),
      category: None,
      tags: vec![],
      is_hidden: false,
      extra_config: FunctionExtraConfig { queue: Some(0), ..Default::default() },
      integration: None,
    };
    let err = validate_api_descriptor(&Default::default(), &descriptor, 4).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidQueue(0)));
  }

  #[test]
  fn test_validate_api_descriptor_rejects_duplicate_name() {
    let mut seen = std::collections::HashSet::new();
    seen.insert("plus".to_string());
    let descriptor = ApiDescriptor {
      name: "plus".to_string(),
      title: "Plus".to_string(),
      category: None,
      tags: vec![],
      is_hidden: false,
      extra_config: FunctionExtraConfig::default(),
      integration: None,
    };
    let err = validate_api_descriptor(&seen, &descriptor, 4).unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateApi(_)));
  }

  #[test]
  fn test_validate_api_descriptor_accepts_auto_run_integration() {
    let descriptor = ApiDescriptor {
      name: "nightly".to_string(),
      title: "Nightly".to_string(),
      category: None,
      tags: vec![],
      is_hidden: false,
      extra_config: FunctionExtraConfig {
        queue: Some(1),
        integration_config: Some(IntegrationConfig { on_system_launch: true, ..Default::default() }),
        ..Default::default()
      },
      integration: Some("autoRun".to_string()),
    };
    assert!(validate_api_descriptor(&Default::default(), &descriptor, 4).is_ok());
  }

  #[test]
  fn test_normalize_delayed_cron_job_dedups_and_sorts() {
    let mut delays = vec![30, 0, 10, 0, 10];
    normalize_delayed_cron_job(&mut delays);
    assert_eq!(delays, vec![0, 10, 30]);
  }

  #[test]
  fn test_mask_longest_first() {
    let secrets = vec!["ab".to_string(), "abcdef".to_string()];
    assert_eq!(mask("x=abcdef y=ab", &secrets), "x=*** y=***");
  }
}
