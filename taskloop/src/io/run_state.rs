//! Persisted run record (`state.json`) and run options.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::plan::Plan;
use crate::core::status::{RunStatus, TransitionError, WorkflowStage};

/// Console verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl LogLevel {
    /// Default `tracing` filter directive for this level.
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Quiet => "warn",
            LogLevel::Normal => "info",
            LogLevel::Verbose => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" => Ok(LogLevel::Quiet),
            "normal" => Ok(LogLevel::Normal),
            "verbose" => Ok(LogLevel::Verbose),
            other => Err(anyhow!("invalid log_level '{other}' (expected quiet|normal|verbose)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("invalid log_format '{other}' (expected text|json)")),
        }
    }
}

/// Per-run options, changed through `config.update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub auto_merge: bool,
    pub max_sessions: Option<u32>,
    pub max_prs: Option<u32>,
    pub pause_on_pr: bool,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    /// Open one PR per task instead of one per task group.
    pub pr_per_task: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            auto_merge: true,
            max_sessions: None,
            max_prs: None,
            pause_on_pr: false,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            pr_per_task: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == Some(0) {
            return Err(anyhow!("max_sessions must be >= 1"));
        }
        if self.max_prs == Some(0) {
            return Err(anyhow!("max_prs must be >= 1"));
        }
        Ok(())
    }

    /// Apply a partial update. A limit of `0` in the update clears that limit.
    pub fn apply(&mut self, update: &OptionsUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(v) = update.auto_merge {
            next.auto_merge = v;
        }
        if let Some(v) = update.max_sessions {
            next.max_sessions = (v > 0).then_some(v);
        }
        if let Some(v) = update.max_prs {
            next.max_prs = (v > 0).then_some(v);
        }
        if let Some(v) = update.pause_on_pr {
            next.pause_on_pr = v;
        }
        if let Some(v) = update.log_level {
            next.log_level = v;
        }
        if let Some(v) = update.log_format {
            next.log_format = v;
        }
        if let Some(v) = update.pr_per_task {
            next.pr_per_task = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Partial options change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_prs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_on_pr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_per_task: Option<bool>,
}

impl OptionsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == OptionsUpdate::default()
    }
}

/// One run's full state.
///
/// `goal`, `criteria` and `plan` live in their own files next to
/// `state.json`; the store fills them in on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub workflow_stage: Option<WorkflowStage>,
    #[serde(default)]
    pub current_task_index: usize,
    #[serde(default)]
    pub session_count: u32,
    #[serde(default)]
    pub current_pr: Option<u64>,
    /// A finished task group still has to go through the PR lifecycle.
    #[serde(default)]
    pub ship_pending: bool,
    /// Completed tasks have commits that no merged PR carries yet.
    #[serde(default)]
    pub unshipped_work: bool,
    #[serde(default)]
    pub prs_created: u32,
    #[serde(default)]
    pub prs_merged: u32,
    #[serde(default)]
    pub verification_rounds: u32,
    #[serde(default)]
    pub options: RunOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub task_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(skip)]
    pub goal: String,
    #[serde(skip)]
    pub criteria: String,
    #[serde(skip)]
    pub plan: Plan,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, goal: impl Into<String>, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Planning,
            workflow_stage: None,
            current_task_index: 0,
            session_count: 0,
            current_pr: None,
            ship_pending: false,
            unshipped_work: false,
            prs_created: 0,
            prs_merged: 0,
            verification_rounds: 0,
            options,
            created_at: now,
            updated_at: now,
            task_start_time: None,
            last_error: None,
            goal: goal.into(),
            criteria: String::new(),
            plan: Plan::default(),
        }
    }

    /// Move to `next` through the transition table. Returns whether the
    /// status actually changed.
    pub fn set_status(&mut self, next: RunStatus) -> Result<bool, TransitionError> {
        let previous = self.status;
        self.status = previous.transition(next)?;
        if next != RunStatus::Working {
            self.workflow_stage = None;
        } else if self.workflow_stage.is_none() {
            self.workflow_stage = Some(WorkflowStage::Working);
        }
        Ok(previous != next)
    }

    pub fn current_task(&self) -> Option<&crate::core::plan::Task> {
        self.plan.get(self.current_task_index)
    }

    /// Human-readable summary written to `progress.md`.
    pub fn progress_summary(&self) -> String {
        let total = self.plan.len();
        let done = self.plan.completed_count();
        let mut out = format!(
            "# Progress\n\nRun: {}\nStatus: {}\nTasks: {done}/{total} completed\nSessions: {}\nPRs: {} created, {} merged\n",
            self.run_id, self.status, self.session_count, self.prs_created, self.prs_merged
        );
        if let Some(stage) = self.workflow_stage {
            out.push_str(&format!("Stage: {stage}\n"));
        }
        if let Some(pr) = self.current_pr {
            out.push_str(&format!("Current PR: #{pr}\n"));
        }
        if let Some(task) = self.current_task() {
            out.push_str(&format!(
                "Current task ({}): {}\n",
                self.current_task_index + 1,
                task.description
            ));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!("Last error: {err}\n"));
        }
        out
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Normal => "normal",
            LogLevel::Verbose => "verbose",
        })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}
