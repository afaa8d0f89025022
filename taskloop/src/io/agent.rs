//! External coding agent adapter.
//!
//! The [`Agent`] trait decouples orchestration from the agent backend. The
//! production [`CommandAgent`] shells out to a configured command; tests use
//! scripted agents that return canned outputs without spawning processes.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::agent_error::{AgentError, classify_failure};
use crate::core::profile::{Phase, ToolProfile};
use crate::io::process::run_command_with_timeout;

const OUTPUT_SCHEMA: &str = include_str!("schemas/agent_output.schema.json");

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub profile: ToolProfile,
    pub prompt: String,
    /// Short file-name-safe label for logs (`task-3`, `verify-1`).
    pub label: String,
}

impl AgentRequest {
    pub fn phase(&self) -> Phase {
        self.profile.phase
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Done,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    Pass,
    Fail,
}

/// Structured result written by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub status: AgentStatus,
    pub summary: String,
    /// Checkbox plan (planning and plan-update phases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediation_tasks: Vec<String>,
    /// Notes worth carrying into later sessions (`context.md`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learnings: Option<String>,
}

impl AgentOutput {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Done,
            summary: summary.into(),
            plan: None,
            criteria: None,
            verification: None,
            remediation_tasks: Vec::new(),
            learnings: None,
        }
    }

    pub fn blocked(summary: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Blocked,
            ..Self::done(summary)
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }

    pub fn with_verification(mut self, verification: Verification) -> Self {
        self.verification = Some(verification);
        self
    }

    pub fn with_remediation(mut self, tasks: Vec<String>) -> Self {
        self.remediation_tasks = tasks;
        self
    }
}

/// Abstraction over agent backends. One call = one session.
pub trait Agent {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError>;
}

/// Agent that spawns the configured command with the prompt on stdin.
///
/// The child sees `TASKLOOP_PHASE`, `TASKLOOP_MODEL`,
/// `TASKLOOP_ALLOWED_TOOLS` (comma-separated) and `TASKLOOP_OUTPUT`, the path
/// where it must write its JSON result. A JSON object printed on stdout is
/// accepted when no output file is written.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(phase = %request.phase(), model = %request.profile.model, label = %request.label))]
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AgentError::Fatal("agent command is empty".into()));
        };
        fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| AgentError::Fatal(format!("create {}: {e}", self.scratch_dir.display())))?;
        let output_path = self.scratch_dir.join(format!("{}-output.json", request.label));
        let log_path = self.scratch_dir.join(format!("{}.log", request.label));
        let _ = fs::remove_file(&output_path);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("TASKLOOP_PHASE", request.phase().as_str())
            .env("TASKLOOP_MODEL", &request.profile.model)
            .env("TASKLOOP_ALLOWED_TOOLS", request.profile.tools.join(","))
            .env("TASKLOOP_OUTPUT", &output_path);

        info!(workdir = %self.workdir.display(), "starting agent session");
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| AgentError::Fatal(format!("{e:#}")))?;

        if let Err(err) = fs::write(&log_path, output.transcript()) {
            warn!(err = %err, path = %log_path.display(), "failed to write agent log");
        }

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
            return Err(AgentError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent exited with failure");
            let mut detail = output.stderr_text();
            if detail.trim().is_empty() {
                detail = output.stdout_text();
            }
            if detail.trim().is_empty() {
                detail = format!("agent exited with status {:?}", output.status.code());
            }
            return Err(classify_failure(&detail));
        }

        let raw = match fs::read_to_string(&output_path) {
            Ok(raw) => raw,
            Err(_) => output.stdout_text(),
        };
        let parsed = parse_agent_output(&raw).map_err(|e| AgentError::Transient(format!("{e:#}")))?;
        debug!(status = ?parsed.status, "parsed agent output");
        Ok(parsed)
    }
}

/// Parse and schema-check an agent result.
pub fn parse_agent_output(raw: &str) -> Result<AgentOutput> {
    let instance: Value = serde_json::from_str(raw.trim()).context("parse agent output json")?;
    let schema: Value = serde_json::from_str(OUTPUT_SCHEMA).context("parse output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("agent output failed schema validation:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("decode agent output")
}
