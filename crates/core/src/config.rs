use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// `None` for negative, non-finite or out-of-range values.
fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

pub fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

pub fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// Active profile from `MAZEPA_PROFILE` (empty = default).
pub fn active_profile() -> String {
    env_or("MAZEPA_PROFILE", "").to_uppercase()
}

/// Apply `overrides` on top of `base`, rejecting keys `base` does not have.
///
/// `overrides` must be a JSON object; nested objects replace whole sections.
pub fn reconfigure<T>(base: &T, overrides: &serde_json::Value) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned,
{
    let serde_json::Value::Object(overrides) = overrides else {
        return Err(ConfigError::NotATable(overrides.to_string()));
    };
    let mut current = serde_json::to_value(base).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let Some(fields) = current.as_object_mut() else {
        return Err(ConfigError::NotATable(current.to_string()));
    };
    for (key, value) in overrides {
        let Some(slot) = fields.get_mut(key) else {
            return Err(ConfigError::UnknownKey(key.clone()));
        };
        *slot = value.clone();
    }
    serde_json::from_value(current).map_err(|e| ConfigError::Invalid(e.to_string()))
}

// ── Executor ──────────────────────────────────────────────────

fn default_max_batch_len() -> usize {
    1000
}

fn default_batch_gap_sleep_sec() -> f64 {
    4.0
}

fn default_max_task_retry() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".mazepa/checkpoints")
}

/// Knobs for one `execute` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    /// Upper bound on tasks pushed per iteration.
    #[serde(default = "default_max_batch_len")]
    pub max_batch_len: usize,
    /// Pause between push and pull, only for non-local queues.
    #[serde(default = "default_batch_gap_sleep_sec")]
    pub batch_gap_sleep_sec: f64,
    /// Resubmissions allowed for a transiently failing task.
    #[serde(default = "default_max_task_retry")]
    pub max_task_retry: u32,
    #[serde(default = "default_true")]
    pub do_dryrun_estimation: bool,
    /// `None` disables periodic checkpoints; `0` checkpoints every iteration.
    #[serde(default)]
    pub checkpoint_interval_sec: Option<f64>,
    /// Checkpoint file (or a directory of them) to resume from.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    /// Generated when unset.
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            max_batch_len: default_max_batch_len(),
            batch_gap_sleep_sec: default_batch_gap_sleep_sec(),
            max_task_retry: default_max_task_retry(),
            do_dryrun_estimation: true,
            checkpoint_interval_sec: None,
            checkpoint: None,
            checkpoint_dir: default_checkpoint_dir(),
            show_progress: true,
            execution_id: None,
        }
    }
}

impl ExecutorConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `MAZEPA_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        Self::for_profile(&active_profile())
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let defaults = Self::default();
        Self {
            profile: p.to_string(),
            max_batch_len: profiled_env_parse(p, "MAZEPA_MAX_BATCH_LEN", defaults.max_batch_len),
            batch_gap_sleep_sec: profiled_env_parse(
                p,
                "MAZEPA_BATCH_GAP_SLEEP_SEC",
                defaults.batch_gap_sleep_sec,
            ),
            max_task_retry: profiled_env_parse(p, "MAZEPA_MAX_TASK_RETRY", defaults.max_task_retry),
            do_dryrun_estimation: profiled_env_bool(
                p,
                "MAZEPA_DRYRUN_ESTIMATION",
                defaults.do_dryrun_estimation,
            ),
            checkpoint_interval_sec: profiled_env_opt(p, "MAZEPA_CHECKPOINT_INTERVAL_SEC")
                .and_then(|v| v.parse().ok()),
            checkpoint: profiled_env_opt(p, "MAZEPA_CHECKPOINT").map(PathBuf::from),
            checkpoint_dir: profiled_env_opt(p, "MAZEPA_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_dir),
            show_progress: profiled_env_bool(p, "MAZEPA_SHOW_PROGRESS", defaults.show_progress),
            execution_id: profiled_env_opt(p, "MAZEPA_EXECUTION_ID"),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Copy of this config with `overrides` applied. Unknown keys are an error.
    pub fn reconfigure(&self, overrides: &serde_json::Value) -> Result<Self, ConfigError> {
        let updated: Self = reconfigure(self, overrides)?;
        updated.validate()?;
        Ok(updated)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_len == 0 {
            return Err(ConfigError::Invalid("max_batch_len must be at least 1".into()));
        }
        if secs_to_duration(self.batch_gap_sleep_sec).is_none() {
            return Err(ConfigError::Invalid(format!(
                "batch_gap_sleep_sec must be a non-negative number of seconds, got {}",
                self.batch_gap_sleep_sec
            )));
        }
        if let Some(interval) = self.checkpoint_interval_sec {
            if secs_to_duration(interval).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "checkpoint_interval_sec must be a non-negative number of seconds, \
                     got {interval}"
                )));
            }
        }
        Ok(())
    }

    pub fn batch_gap_sleep(&self) -> Duration {
        secs_to_duration(self.batch_gap_sleep_sec).unwrap_or_default()
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_sec.and_then(secs_to_duration)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Executor config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  batching:    max_batch_len={}, batch_gap_sleep_sec={}",
            self.max_batch_len,
            self.batch_gap_sleep_sec
        );
        tracing::info!(
            "  retries:     max_task_retry={}, dryrun={}",
            self.max_task_retry,
            self.do_dryrun_estimation
        );
        tracing::info!(
            "  checkpoint:  interval={}, dir={}, resume={}",
            self.checkpoint_interval_sec
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "(off)".into()),
            self.checkpoint_dir.display(),
            self.checkpoint
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".into())
        );
    }
}
