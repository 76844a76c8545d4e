//! Process-wide structured logging (§10.A) plus the per-task print/log
//! capture buffer (§4.F), which is a distinct concern: it is never routed
//! through the process-wide `tracing`/`log` sinks below, because it must be
//! timestamped relative to task start and persisted into Task Records.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the process-wide `tracing` subscriber. Mirrors the reference
/// workspace's pattern of an `EnvFilter` seeded from `RUST_LOG`, falling
/// back to `info`.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone)]
pub struct LogLine {
  pub wall_clock: f64,
  pub delta_secs: f64,
  pub total_secs: f64,
  pub message: String,
}

/// Appends every `LOG`/`print` call observed during one Task's `run()`,
/// relative to the Task's `startTime`. Owned by the Task Instance, not a
/// process-global sink.
#[derive(Debug)]
pub struct TaskLogBuffer {
  start: f64,
  last: f64,
  lines: Vec<LogLine>,
}

impl TaskLogBuffer {
  pub fn new(start: f64) -> Self {
    return Self { start, last: start, lines: Vec::new() };
  }

  /// Records `message` at wall-clock `now`, masking any of `secrets` found
  /// in it. Masking is longest-first so a shorter secret that happens to be
  /// a substring of a longer one never partially unmasks it (invariant 7).
  pub fn push(&mut self, now: f64, message: &str, secrets: &[String]) {
    let masked = mask_secrets(message, secrets);
    self.lines.push(LogLine {
      wall_clock: now,
      delta_secs: now - self.last,
      total_secs: now - self.start,
      message: masked,
    });
    self.last = now;
  }

  pub fn lines(&self) -> &[LogLine] {
    return &self.lines;
  }

  pub fn render(&self) -> String {
    let mut out = String::new();
    for line in &self.lines {
      out.push_str(&format!(
        "[+{:.3}s/{:.3}s] {}\n",
        line.delta_secs, line.total_secs, line.message
      ));
    }
    return out;
  }
}

/// Replaces every occurrence of every secret in `secrets` with `***`,
/// longest secrets first, so no partial match of a shorter secret leaves a
/// fragment of a longer one exposed.
fn mask_secrets(message: &str, secrets: &[String]) -> String {
  let mut sorted: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
  sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));

  let mut out = message.to_string();
  for secret in sorted {
    if out.contains(secret.as_str()) {
      out = out.replace(secret.as_str(), "***");
    }
  }
  return out;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mask_secrets_longest_first() {
    let secrets = vec!["pass".to_string(), "password123".to_string()];
    let masked = mask_secrets("token=password123 fallback=pass", &secrets);
    assert_eq!(masked, "token=*** fallback=***");
  }

  #[test]
  fn test_log_buffer_deltas() {
    let mut buf = TaskLogBuffer::new(100.0);
    buf.push(100.5, "first", &[]);
    buf.push(101.0, "second", &[]);

    assert_eq!(buf.lines().len(), 2);
    assert!((buf.lines()[0].delta_secs - 0.5).abs() < 1e-9);
    assert!((buf.lines()[1].delta_secs - 0.5).abs() < 1e-9);
    assert!((buf.lines()[1].total_secs - 1.0).abs() < 1e-9);
  }

  #[test]
  fn test_mask_does_not_touch_unrelated_text() {
    let masked = mask_secrets("hello world", &["secret".to_string()]);
    assert_eq!(masked, "hello world");
  }
}
