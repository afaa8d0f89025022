//! Engine configuration stored under `<state_dir>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::backoff_delay;
use crate::core::profile::{ComplexityModels, PhaseTools, ProfileTable};
use crate::io::fs::write_atomic;

/// Environment override for `[git].target_branch`.
pub const TARGET_BRANCH_ENV: &str = "TASKLOOP_TARGET_BRANCH";

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskloopConfig {
    pub agent: AgentConfig,
    pub git: GitConfig,
    pub pr: PrConfig,
    pub webhooks: WebhookDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the prompt is written to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Local retries for timeout/transient failures before the run blocks.
    pub max_retries: u32,
    /// Wait before retry n is `min(base * 2^(n-1), max)`.
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub output_limit_bytes: usize,
    /// Verification rounds that may extend the plan before the run fails.
    pub max_verification_rounds: u32,
    pub tools: PhaseTools,
    pub models: ComplexityModels,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            max_retries: 2,
            retry_backoff_base_ms: 1000,
            retry_backoff_max_ms: 30_000,
            output_limit_bytes: 1_000_000,
            max_verification_rounds: 2,
            tools: PhaseTools::default(),
            models: ComplexityModels::default(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before local retry `attempt` (1-based) of a failed session.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            Duration::from_millis(self.retry_backoff_base_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    pub fn profiles(&self) -> ProfileTable {
        ProfileTable {
            tools: self.tools.clone(),
            models: self.models.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    pub target_branch: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    pub fn as_flag(self) -> &'static str {
        match self {
            MergeMethod::Squash => "--squash",
            MergeMethod::Merge => "--merge",
            MergeMethod::Rebase => "--rebase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrConfig {
    pub poll_interval_secs: u64,
    pub max_polls: u32,
    /// Fix sessions per PR before the run blocks.
    pub max_fix_attempts: u32,
    pub require_approval: bool,
    pub merge_method: MergeMethod,
    pub ci_log_chunk_chars: usize,
    /// `owner/name`; detected by the code host when unset.
    pub repo: Option<String>,
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_polls: 360,
            max_fix_attempts: 5,
            require_approval: false,
            merge_method: MergeMethod::default(),
            ci_log_chunk_chars: 20_000,
            repo: None,
        }
    }
}

impl PrConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookDefaults {
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WebhookDefaults {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            default_max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl TaskloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.retry_backoff_base_ms > self.agent.retry_backoff_max_ms {
            return Err(anyhow!(
                "agent.retry_backoff_base_ms must be <= agent.retry_backoff_max_ms"
            ));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must not be empty"));
        }
        if self.git.target_branch.trim().is_empty() {
            return Err(anyhow!("git.target_branch must not be empty"));
        }
        if self.pr.max_polls == 0 {
            return Err(anyhow!("pr.max_polls must be > 0"));
        }
        if self.pr.ci_log_chunk_chars == 0 {
            return Err(anyhow!("pr.ci_log_chunk_chars must be > 0"));
        }
        if let Some(repo) = &self.pr.repo
            && repo.split('/').filter(|p| !p.is_empty()).count() != 2
        {
            return Err(anyhow!("pr.repo must look like owner/name, got '{repo}'"));
        }
        if self.webhooks.default_timeout_secs == 0 {
            return Err(anyhow!("webhooks.default_timeout_secs must be > 0"));
        }
        if self.webhooks.backoff_base_ms > self.webhooks.backoff_max_ms {
            return Err(anyhow!(
                "webhooks.backoff_base_ms must be <= webhooks.backoff_max_ms"
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(branch) = std::env::var(TARGET_BRANCH_ENV)
            && !branch.trim().is_empty()
        {
            debug!(branch = %branch, "target branch overridden from environment");
            self.git.target_branch = branch.trim().to_string();
        }
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, returns defaults.
pub fn load_config(path: &Path) -> Result<TaskloopConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        TaskloopConfig::default()
    };
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TaskloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
