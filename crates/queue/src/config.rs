use std::time::Duration;

use serde::{Deserialize, Serialize};

use mazepa_core::config::{
    active_profile, profiled_env_opt, profiled_env_or, profiled_env_parse, reconfigure,
};
use mazepa_core::ConfigError;

/// Work queue name for an execution: `zzz-<execution_id>-work`.
pub fn work_queue_name(execution_id: &str) -> String {
    format!("zzz-{execution_id}-work")
}

/// Outcome queue name for an execution: `zzz-<execution_id>-outcome`.
pub fn outcome_queue_name(execution_id: &str) -> String {
    format!("zzz-{execution_id}-outcome")
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Read from `QUEUE_AWS_ENDPOINT_URL` only, so a generic
    /// `AWS_ENDPOINT_URL` pointing at another service is never picked up.
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
        }
    }
}

impl AwsConfig {
    pub fn from_env() -> Self {
        Self::from_env_profiled(&active_profile())
    }

    pub fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── SQS execution queue ───────────────────────────────────────

fn default_pull_lease_sec() -> u64 {
    600
}

fn default_receive_wait_sec() -> u32 {
    1
}

fn default_max_messages_per_pull() -> u32 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqsQueueConfig {
    pub work_queue_url: String,
    pub outcome_queue_url: String,
    /// Visibility timeout applied to received messages.
    #[serde(default = "default_pull_lease_sec")]
    pub pull_lease_sec: u64,
    /// Long-poll wait per receive call (SQS allows 0-20).
    #[serde(default = "default_receive_wait_sec")]
    pub receive_wait_sec: u32,
    /// Upper bound on outcomes drained per executor pull.
    #[serde(default = "default_max_messages_per_pull")]
    pub max_messages_per_pull: u32,
}

impl SqsQueueConfig {
    pub fn new(work_queue_url: impl Into<String>, outcome_queue_url: impl Into<String>) -> Self {
        Self {
            work_queue_url: work_queue_url.into(),
            outcome_queue_url: outcome_queue_url.into(),
            pull_lease_sec: default_pull_lease_sec(),
            receive_wait_sec: default_receive_wait_sec(),
            max_messages_per_pull: default_max_messages_per_pull(),
        }
    }

    /// Build from `MAZEPA_WORK_QUEUE_URL` / `MAZEPA_OUTCOME_QUEUE_URL`.
    /// Returns an error if either URL is missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_profiled(&active_profile())
    }

    pub fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        let work = profiled_env_opt(p, "MAZEPA_WORK_QUEUE_URL")
            .ok_or_else(|| ConfigError::Invalid("MAZEPA_WORK_QUEUE_URL is not set".into()))?;
        let outcome = profiled_env_opt(p, "MAZEPA_OUTCOME_QUEUE_URL")
            .ok_or_else(|| ConfigError::Invalid("MAZEPA_OUTCOME_QUEUE_URL is not set".into()))?;
        let config = Self {
            pull_lease_sec: profiled_env_parse(
                p,
                "MAZEPA_PULL_LEASE_SEC",
                default_pull_lease_sec(),
            ),
            ..Self::new(work, outcome)
        };
        config.validate()?;
        Ok(config)
    }

    /// Copy of this config with `overrides` applied. Unknown keys are an error.
    pub fn reconfigure(&self, overrides: &serde_json::Value) -> Result<Self, ConfigError> {
        let updated: Self = reconfigure(self, overrides)?;
        updated.validate()?;
        Ok(updated)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_queue_url.is_empty() || self.outcome_queue_url.is_empty() {
            return Err(ConfigError::Invalid("queue urls must not be empty".into()));
        }
        if self.work_queue_url == self.outcome_queue_url {
            return Err(ConfigError::Invalid("work and outcome queues must differ".into()));
        }
        if self.receive_wait_sec > 20 {
            return Err(ConfigError::Invalid(format!(
                "receive_wait_sec must be at most 20, got {}",
                self.receive_wait_sec
            )));
        }
        Ok(())
    }

    pub fn pull_lease(&self) -> Duration {
        Duration::from_secs(self.pull_lease_sec)
    }

    pub fn log_summary(&self) {
        tracing::info!("SQS queue config:");
        tracing::info!("  work:     {}", self.work_queue_url);
        tracing::info!("  outcome:  {}", self.outcome_queue_url);
        tracing::info!(
            "  lease:    {}s, wait={}s, max_per_pull={}",
            self.pull_lease_sec,
            self.receive_wait_sec,
            self.max_messages_per_pull
        );
    }
}
