//! Script Loader & Cache (§4.E): MD5-keyed lazy loader sitting in front of
//! the Metadata Store. Two cache layers:
//! - a bounded-TTL per-process cache, invalidated early by the shared MD5
//!   index (so a publish anywhere is visible to every process within one
//!   TTL window, not just `ttl` by coincidence);
//! - a per-task [`TaskScriptCache`] that prevents a single task from
//!   re-resolving the same Script import more than once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use taskgrid_schema::entities::FunctionExtraConfig;

use crate::app_state::AppState;
use crate::constants::MD5_KIND_SCRIPT;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
  #[error("metadata: {0}")]
  Metadata(#[from] taskgrid_schema::MetadataError),

  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),

  #[error("invalid extraConfig for function {function_id}: {source}")]
  InvalidExtraConfig {
    function_id: String,
    #[source]
    source: serde_json::Error,
  },
}

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Clone)]
pub struct LoadedScript {
  pub id: String,
  pub code: String,
  pub code_md5: String,
  pub functions: HashMap<String, FunctionExtraConfig>,
}

struct CacheEntry {
  script: Arc<LoadedScript>,
  cached_at: f64,
}

#[derive(Clone)]
pub struct ScriptLoader {
  state: AppState,
  ttl: Duration,
  cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl ScriptLoader {
  pub fn new(state: AppState, ttl: Duration) -> Self {
    return Self { state, ttl, cache: Arc::new(Mutex::new(HashMap::new())) };
  }

  /// `draft=true` always reads the row's draft code straight from the
  /// store and never touches the cache — drafts are previewed, not
  /// published, so caching them would serve stale previews.
  pub async fn load(&self, script_id: &str, draft: bool, now: f64) -> Result<Option<Arc<LoadedScript>>> {
    if draft {
      return self.fetch_draft(script_id).await;
    }

    if let Some(cached) = self.fresh_cached(script_id, now) {
      if let Some(remote_md5) = self.state.cache().get_md5(MD5_KIND_SCRIPT, script_id).await? {
        if remote_md5 == cached.code_md5 {
          self.touch(script_id, now);
          return Ok(Some(cached));
        }
      }
    }

    return self.fetch_and_cache(script_id, now).await;
  }

  fn fresh_cached(&self, script_id: &str, now: f64) -> Option<Arc<LoadedScript>> {
    let cache = self.cache.lock();
    let entry = cache.get(script_id)?;
    if now - entry.cached_at > self.ttl.as_secs_f64() {
      return None;
    }
    return Some(entry.script.clone());
  }

  fn touch(&self, script_id: &str, now: f64) {
    if let Some(entry) = self.cache.lock().get_mut(script_id) {
      entry.cached_at = now;
    }
  }

  async fn fetch_draft(&self, script_id: &str) -> Result<Option<Arc<LoadedScript>>> {
    let Some(script) = self.state.metadata().get_script(script_id).await? else {
      return Ok(None);
    };
    let Some(code) = script.code_draft else {
      return Ok(None);
    };
    let functions = self.load_function_configs(script_id).await?;
    return Ok(Some(Arc::new(LoadedScript {
      id: script_id.to_string(),
      code_md5: script.code_draft_md5.unwrap_or_default(),
      code,
      functions,
    })));
  }

  async fn fetch_and_cache(&self, script_id: &str, now: f64) -> Result<Option<Arc<LoadedScript>>> {
    let Some(script) = self.state.metadata().get_script(script_id).await? else {
      self.cache.lock().remove(script_id);
      return Ok(None);
    };

    let functions = self.load_function_configs(script_id).await?;
    let loaded = Arc::new(LoadedScript {
      id: script_id.to_string(),
      code: script.code,
      code_md5: script.code_md5.clone(),
      functions,
    });

    self.state.cache().set_md5(MD5_KIND_SCRIPT, script_id, &script.code_md5).await?;
    self.state.metadata().set_md5_index(MD5_KIND_SCRIPT, script_id, &script.code_md5, now as i64).await?;

    self.cache.lock().insert(script_id.to_string(), CacheEntry { script: loaded.clone(), cached_at: now });

    return Ok(Some(loaded));
  }

  async fn load_function_configs(&self, script_id: &str) -> Result<HashMap<String, FunctionExtraConfig>> {
    let functions = self.state.metadata().list_functions_by_script(script_id).await?;
    let mut out = HashMap::with_capacity(functions.len());
    for function in functions {
      let extra_config = function
        .extra_config()
        .map_err(|source| ScriptError::InvalidExtraConfig { function_id: function.id.clone(), source })?;
      out.insert(function.id, extra_config);
    }
    return Ok(out);
  }

  /// Walks `entry_code`'s `__`-delimited import specifiers transitively
  /// (an imported Script may itself import further Scripts) and loads every
  /// one reachable from it, consulting and filling `cache` so a Script
  /// imported from more than one place in the same run is only fetched
  /// once. A specifier that names an unknown Script is left out of the
  /// returned map; the import resolver surfaces that as a load error when
  /// the module graph actually asks for it.
  pub async fn resolve_imports(
    &self,
    entry_code: &str,
    cache: &TaskScriptCache,
    now: f64,
  ) -> Result<HashMap<String, Arc<LoadedScript>>> {
    let mut resolved = HashMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier: Vec<String> = import_specifiers(entry_code);

    while let Some(script_id) = frontier.pop() {
      if !visited.insert(script_id.clone()) {
        continue;
      }

      let script = match cache.get(&script_id) {
        Some(cached) => cached,
        None => {
          let Some(loaded) = self.load(&script_id, false, now).await? else {
            continue;
          };
          cache.insert(script_id.clone(), loaded.clone());
          loaded
        }
      };

      frontier.extend(import_specifiers(&script.code));
      resolved.insert(script_id, script);
    }

    return Ok(resolved);
  }
}

/// Every distinct `import ... from "..."` / `import("...")` specifier in
/// `code` that contains `__` — the marker that it names a Script rather
/// than a host or relative module (§4.F).
fn import_specifiers(code: &str) -> Vec<String> {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  let pattern = PATTERN.get_or_init(|| {
    Regex::new(r#"(?:from\s+|import\s*\(\s*)["']([A-Za-z0-9_]*__[A-Za-z0-9_]*)["']"#).expect("valid import regex")
  });
  return pattern.captures_iter(code).map(|c| c[1].to_string()).collect();
}

/// Per-task secondary cache (§4.E): `FUNC`/import resolution within one
/// task's `run()` never re-reads the same Script twice, independent of the
/// process-wide cache's TTL/MD5 check.
#[derive(Default)]
pub struct TaskScriptCache(Mutex<HashMap<String, Arc<LoadedScript>>>);

impl TaskScriptCache {
  pub fn new() -> Self {
    return Self::default();
  }

  pub fn get(&self, script_id: &str) -> Option<Arc<LoadedScript>> {
    return self.0.lock().get(script_id).cloned();
  }

  pub fn insert(&self, script_id: String, script: Arc<LoadedScript>) {
    self.0.lock().insert(script_id, script);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;

  #[tokio::test]
  async fn test_load_missing_script_returns_none() {
    let state = test_state().await;
    let loader = ScriptLoader::new(state, Duration::from_secs(60));
    let result = loader.load("nope__script", false, 0.0).await.unwrap();
    assert!(result.is_none());
  }

  #[test]
  fn test_task_script_cache_roundtrip() {
    let cache = TaskScriptCache::new();
    assert!(cache.get("s__a").is_none());
    let script = Arc::new(LoadedScript {
      id: "s__a".to_string(),
      code: "export function f() {}".to_string(),
      code_md5: "abc".to_string(),
      functions: HashMap::new(),
    });
    cache.insert("s__a".to_string(), script.clone());
    assert_eq!(cache.get("s__a").unwrap().code_md5, "abc");
  }

  #[test]
  fn test_import_specifiers_finds_dunder_names_only() {
    let code = r#"
      import helpers from "utils__helpers";
      import { signIn } from "./auth";
      const lazy = await import("reports__monthly");
      import numpy from "numpy";
    "#;
    let mut found = import_specifiers(code);
    found.sort();
    assert_eq!(found, vec!["reports__monthly".to_string(), "utils__helpers".to_string()]);
  }

  // Requires a live Redis (the process-wide cache's MD5 index); see
  // `app_state::test_state`.
  #[tokio::test]
  #[ignore]
  async fn test_resolve_imports_walks_transitive_script_graph() {
    let state = test_state().await;
    state
      .metadata()
      .upsert_script("leaf__script", "leaf", "export function f() { return 1; }", 0)
      .await
      .unwrap();
    state
      .metadata()
      .upsert_script("mid__script", "mid", r#"import leaf from "leaf__script";"#, 0)
      .await
      .unwrap();

    let loader = ScriptLoader::new(state, Duration::from_secs(60));
    let cache = TaskScriptCache::new();
    let entry_code = r#"import mid from "mid__script";"#;

    let resolved = loader.resolve_imports(entry_code, &cache, 0.0).await.unwrap();
    assert_eq!(resolved.len(), 2);
    assert!(resolved.contains_key("mid__script"));
    assert!(resolved.contains_key("leaf__script"));
    assert!(cache.get("leaf__script").is_some());

    // A second resolve against the same cache doesn't need to hit the store again
    // for `leaf__script`; the cache already has it from the first walk.
    let resolved_again = loader.resolve_imports(entry_code, &cache, 0.0).await.unwrap();
    assert_eq!(resolved_again.len(), 2);
  }

  #[tokio::test]
  async fn test_resolve_imports_skips_unknown_script() {
    // `nope__script` is never upserted, so `load()` returns `Ok(None)` before
    // ever touching the MD5-index cache — no live Redis required here.
    let state = test_state().await;
    let loader = ScriptLoader::new(state, Duration::from_secs(60));
    let cache = TaskScriptCache::new();
    let entry_code = r#"import x from "nope__script";"#;

    let resolved = loader.resolve_imports(entry_code, &cache, 0.0).await.unwrap();
    assert!(resolved.is_empty());
  }
}
