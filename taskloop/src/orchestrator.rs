//! Work loop for one run.
//!
//! Each iteration runs at most one agent session, then a checkpoint applies
//! mailbox change requests, queued control commands and session/PR limits.
//! Nothing interrupts a session in flight: commands written meanwhile wait in
//! the state dir until the next checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::core::agent_error::AgentError;
use crate::core::events::{EventType, WebhookEvent};
use crate::core::merge::merge_messages;
use crate::core::plan::{Complexity, Task, parse_complexity};
use crate::core::profile::{Phase, ProfileTable};
use crate::core::status::RunStatus;
use crate::io::agent::{Agent, AgentOutput, AgentRequest, AgentStatus, Verification};
use crate::io::config::TaskloopConfig;
use crate::io::git::Vcs;
use crate::io::host::CodeHost;
use crate::io::mailbox::MailboxStore;
use crate::io::prompt::PromptBuilder;
use crate::io::run_log::RunLog;
use crate::io::run_state::RunState;
use crate::io::state_store::{ControlCommand, KEEP_RUN_LOGS, StateStore};
use crate::io::webhooks::EventSink;
use crate::plan_updater;

/// Why the loop stopped and what the run should become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Halt {
    pub status: RunStatus,
    pub reason: String,
    /// Clean the state dir after persisting (`stop --cleanup`).
    pub cleanup: bool,
}

impl Halt {
    pub(crate) fn new(status: RunStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            cleanup: false,
        }
    }
}

/// Result of one agent session including local retries.
pub(crate) enum Session {
    Done(AgentOutput),
    Halt(Halt),
}

/// Drives a run from `planning`/`working` to a stopping status.
pub struct Orchestrator<'a> {
    pub(crate) store: &'a StateStore,
    pub(crate) mailbox: MailboxStore,
    pub(crate) agent: &'a dyn Agent,
    pub(crate) vcs: &'a dyn Vcs,
    pub(crate) host: &'a dyn CodeHost,
    pub(crate) events: &'a dyn EventSink,
    pub(crate) config: TaskloopConfig,
    pub(crate) profiles: ProfileTable,
    pub(crate) prompts: PromptBuilder,
    interrupt: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a StateStore,
        agent: &'a dyn Agent,
        vcs: &'a dyn Vcs,
        host: &'a dyn CodeHost,
        events: &'a dyn EventSink,
        config: TaskloopConfig,
    ) -> Self {
        Self {
            store,
            mailbox: MailboxStore::new(store.paths()),
            agent,
            vcs,
            host,
            events,
            profiles: config.agent.profiles(),
            config,
            prompts: PromptBuilder::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag that, once set, pauses the run at the next safe point.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Run until the run reaches a stopping status and return it.
    ///
    /// `state` is replaced by the stored state once the lock is held, so
    /// control commands applied before that are honored. Fails fast with
    /// [`crate::io::state_store::LockConflict`] when another process owns the
    /// state dir. Errors inside the loop are recorded in `last_error` and park
    /// the run as `blocked`.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub fn run(&self, state: &mut RunState) -> Result<RunStatus> {
        let _lock = self.store.acquire_lock()?;
        *state = self.store.load()?;
        if !matches!(state.status, RunStatus::Planning | RunStatus::Working) {
            let hint = if state.status.is_resumable() {
                "resume it first"
            } else {
                "initialise a new run"
            };
            anyhow::bail!("run {} is {}; {hint}", state.run_id, state.status);
        }

        match self.store.rotate_logs(KEEP_RUN_LOGS) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "old run logs removed"),
            Err(err) => warn!(err = %err, "failed to rotate run logs"),
        }
        info!(status = %state.status, tasks = state.plan.len(), "run starting");
        self.record(state, &format!("run started ({})", state.status));
        self.emit(
            state,
            EventType::RunStarted,
            json!({
                "goal": state.goal,
                "status": state.status,
                "tasks_total": state.plan.len(),
                "current_task_index": state.current_task_index,
            }),
        );

        let halt = match self.drive(state) {
            Ok(halt) => halt,
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "run loop failed");
                state.last_error = Some(message.clone());
                Halt::new(RunStatus::Blocked, message)
            }
        };
        self.finish(state, halt)
    }

    fn drive(&self, state: &mut RunState) -> Result<Halt> {
        // A run paused during planning resumes as `working` with no plan yet.
        if state.plan.is_empty()
            && let Some(halt) = self.plan_run(state)?
        {
            return Ok(halt);
        }
        if state.status == RunStatus::Planning {
            self.transition(state, RunStatus::Working, "plan ready")?;
            self.store.save(state)?;
        }

        loop {
            if self.interrupted() {
                return Ok(Halt::new(RunStatus::Paused, "interrupted"));
            }
            let exhausted = state.current_task_index >= state.plan.len();
            if (state.ship_pending || state.current_pr.is_some() || (exhausted && state.unshipped_work))
                && let Some(halt) = self.ship(state)?
            {
                return Ok(halt);
            }
            if exhausted {
                if let Some(halt) = self.verify(state)? {
                    return Ok(halt);
                }
                continue;
            }

            let index = state.current_task_index;
            let ran = !state.plan.tasks[index].completed;
            if ran {
                if let Some(halt) = self.work_task(state, index)? {
                    return Ok(halt);
                }
                if state.plan.is_group_boundary(index, state.options.pr_per_task) {
                    state.ship_pending = true;
                    self.store.save(state)?;
                    if let Some(halt) = self.ship(state)? {
                        return Ok(halt);
                    }
                }
            } else {
                debug!(index, "task already completed, skipping");
            }

            state.current_task_index = index + 1;
            self.store.save(state)?;
            if ran && let Some(halt) = self.checkpoint(state)? {
                return Ok(halt);
            }
        }
    }

    /// Ask the agent for a plan and success criteria.
    fn plan_run(&self, state: &mut RunState) -> Result<Option<Halt>> {
        let notes = self.store.read_context()?;
        let request = AgentRequest {
            profile: self.profiles.resolve(Phase::Planning, Complexity::Coding),
            prompt: self.prompts.planning(&state.goal, &notes)?,
            label: "planning".to_string(),
        };
        let output = match self.run_session(state, &request)? {
            Session::Done(output) => output,
            Session::Halt(halt) => return Ok(Some(halt)),
        };
        if output.status == AgentStatus::Blocked {
            state.last_error = Some(output.summary.clone());
            return Ok(Some(Halt::new(RunStatus::Blocked, output.summary)));
        }

        state.plan = output
            .plan
            .as_deref()
            .map(crate::core::plan::Plan::parse)
            .unwrap_or_default();
        if state.plan.is_empty() {
            let reason = "planning produced no tasks";
            state.last_error = Some(reason.to_string());
            return Ok(Some(Halt::new(RunStatus::Failed, reason)));
        }
        if let Some(criteria) = output.criteria.as_deref() {
            state.criteria = criteria.trim().to_string();
        }
        if let Some(learnings) = output.learnings.as_deref() {
            self.store.append_context(learnings)?;
        }
        state.current_task_index = 0;
        self.store.save(state)?;
        info!(tasks = state.plan.len(), "plan created");
        self.record(state, &format!("plan created with {} tasks", state.plan.len()));
        self.emit(
            state,
            EventType::PlanUpdated,
            json!({ "reason": "planning", "tasks_total": state.plan.len() }),
        );
        Ok(None)
    }

    #[instrument(skip_all, fields(index))]
    fn work_task(&self, state: &mut RunState, index: usize) -> Result<Option<Halt>> {
        let task = state.plan.tasks[index].clone();
        state.task_start_time = Some(Utc::now());
        self.store.save(state)?;
        self.record(state, &format!("task {} started: {}", index + 1, task.description));
        self.emit(state, EventType::TaskStarted, task_data(index, &task));

        let notes = self.store.read_context()?;
        let request = AgentRequest {
            profile: self.profiles.resolve(Phase::Working, task.complexity),
            prompt: self.prompts.work(state, index, &notes)?,
            label: format!("task-{}", index + 1),
        };
        let output = match self.run_session(state, &request)? {
            Session::Done(output) if output.status == AgentStatus::Done => output,
            Session::Done(output) => {
                state.last_error = Some(output.summary.clone());
                self.task_failed(state, index, &task, &output.summary);
                return Ok(Some(Halt::new(RunStatus::Blocked, output.summary)));
            }
            Session::Halt(halt) => {
                self.task_failed(state, index, &task, &halt.reason);
                return Ok(Some(halt));
            }
        };

        state.plan.mark_completed(index);
        state.unshipped_work = true;
        if let Some(learnings) = output.learnings.as_deref() {
            self.store
                .append_context(&format!("- Task {}: {}", index + 1, learnings.trim()))?;
        }
        let committed = self
            .vcs
            .commit_all(&format!("task {}: {}", index + 1, task.description))?;
        debug!(committed, "task changes committed");
        state.task_start_time = None;
        state.last_error = None;
        self.store.save(state)?;

        info!(index, summary = %output.summary, "task completed");
        self.record(state, &format!("task {} completed: {}", index + 1, output.summary));
        let mut data = task_data(index, &task);
        data["summary"] = Value::String(output.summary.clone());
        self.emit(state, EventType::TaskCompleted, data);
        self.emit(
            state,
            EventType::StatusChanged,
            json!({
                "previous": state.status,
                "status": state.status,
                "reason": "task completed",
                "task_index": index,
                "tasks_completed": state.plan.completed_count(),
            }),
        );
        Ok(None)
    }

    fn task_failed(&self, state: &RunState, index: usize, task: &Task, reason: &str) {
        warn!(index, reason, "task did not complete");
        self.record(state, &format!("task {} failed: {reason}", index + 1));
        let mut data = task_data(index, task);
        data["error"] = Value::String(reason.to_string());
        self.emit(state, EventType::TaskFailed, data);
    }

    /// Verification once every task is done. `None` means remediation tasks
    /// were appended and the loop continues.
    fn verify(&self, state: &mut RunState) -> Result<Option<Halt>> {
        let round = state.verification_rounds + 1;
        let request = AgentRequest {
            profile: self.profiles.resolve(Phase::Verification, Complexity::Coding),
            prompt: self.prompts.verification(state)?,
            label: format!("verify-{round}"),
        };
        let output = match self.run_session(state, &request)? {
            Session::Done(output) => output,
            Session::Halt(halt) => return Ok(Some(halt)),
        };
        state.verification_rounds = round;

        if output.status == AgentStatus::Blocked {
            state.last_error = Some(output.summary.clone());
            return Ok(Some(Halt::new(RunStatus::Blocked, output.summary)));
        }
        if output.verification != Some(Verification::Fail) {
            info!(round, "verification passed");
            self.record(state, &format!("verification passed: {}", output.summary));
            return Ok(Some(Halt::new(RunStatus::Success, "criteria met")));
        }

        warn!(round, summary = %output.summary, "verification failed");
        self.record(state, &format!("verification round {round} failed: {}", output.summary));
        if output.remediation_tasks.is_empty() {
            let reason = format!("criteria unmet: {}", output.summary);
            state.last_error = Some(reason.clone());
            return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
        }
        if round > self.config.agent.max_verification_rounds {
            let reason = format!("criteria still unmet after {round} verification rounds");
            state.last_error = Some(reason.clone());
            return Ok(Some(Halt::new(RunStatus::Failed, reason)));
        }

        let added = output.remediation_tasks.len();
        for raw in &output.remediation_tasks {
            let (complexity, description) = parse_complexity(raw);
            state.plan.tasks.push(
                Task::new(description)
                    .with_complexity(complexity)
                    .with_group(format!("Verification fixes {round}")),
            );
        }
        self.store.save(state)?;
        self.emit(
            state,
            EventType::PlanUpdated,
            json!({
                "reason": "verification",
                "added": added,
                "tasks_total": state.plan.len(),
            }),
        );
        Ok(None)
    }

    /// Mailbox first, then queued control commands, then limits.
    #[instrument(skip_all)]
    fn checkpoint(&self, state: &mut RunState) -> Result<Option<Halt>> {
        let batch = self.mailbox.get_and_clear()?;
        if !batch.is_empty()
            && let Some(halt) = self.apply_change_requests(state, batch)?
        {
            return Ok(Some(halt));
        }

        if let Some(halt) = self.apply_control(state)? {
            return Ok(Some(halt));
        }
        if self.interrupted() {
            return Ok(Some(Halt::new(RunStatus::Paused, "interrupted")));
        }
        if let Some(halt) = self.session_limit(state) {
            return Ok(Some(halt));
        }
        if let Some(max) = state.options.max_prs
            && state.prs_created >= max
        {
            return Ok(Some(Halt::new(
                RunStatus::Paused,
                format!("PR limit reached ({max})"),
            )));
        }
        Ok(None)
    }

    /// Apply control commands queued while the lock was held. A stop wins
    /// over a pause in the same batch.
    pub(crate) fn apply_control(&self, state: &mut RunState) -> Result<Option<Halt>> {
        let mut halt: Option<Halt> = None;
        for command in self.store.drain_control()? {
            debug!(?command, "applying control command");
            match command {
                ControlCommand::UpdateOptions { update } => {
                    match state.options.apply(&update) {
                        Ok(()) => info!("run options updated"),
                        Err(err) => warn!(err = %err, "ignoring invalid options update"),
                    }
                    self.store.save(state)?;
                }
                ControlCommand::Pause { reason } => {
                    if halt.is_none() {
                        halt = Some(Halt::new(
                            RunStatus::Paused,
                            reason.unwrap_or_else(|| "pause requested".to_string()),
                        ));
                    }
                }
                ControlCommand::Stop { reason, cleanup } => {
                    let mut stop = Halt::new(
                        RunStatus::Stopped,
                        reason.unwrap_or_else(|| "stop requested".to_string()),
                    );
                    stop.cleanup = cleanup;
                    halt = Some(stop);
                }
            }
        }
        Ok(halt)
    }

    pub(crate) fn session_limit(&self, state: &RunState) -> Option<Halt> {
        let max = state.options.max_sessions?;
        (state.session_count >= max)
            .then(|| Halt::new(RunStatus::Paused, format!("session limit reached ({max})")))
    }

    fn apply_change_requests(
        &self,
        state: &mut RunState,
        batch: Vec<crate::core::merge::MailboxMessage>,
    ) -> Result<Option<Halt>> {
        let count = batch.len();
        let merged = merge_messages(&batch, Utc::now())?;
        info!(messages = count, "merging change requests into plan");
        let request = plan_updater::build_request(state, &merged, &self.prompts, &self.profiles)?;

        let output = match self.run_session(state, &request)? {
            Session::Done(output) => output,
            Session::Halt(halt) => {
                self.mailbox.restore(batch)?;
                return Ok(Some(halt));
            }
        };
        let splice = match plan_updater::apply_update(state, &output) {
            Ok(splice) => splice,
            Err(err) => {
                self.mailbox.restore(batch)?;
                let reason = format!("{err:#}");
                state.last_error = Some(reason.clone());
                return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
            }
        };
        // The update may have dropped the rest of the group whose work is
        // already committed; that group ships before the next task.
        if state.unshipped_work
            && state.current_pr.is_none()
            && let Some(last_done) = splice.next_index.checked_sub(1)
            && state.plan.is_group_boundary(last_done, state.options.pr_per_task)
        {
            debug!(last_done, "plan update closed the current group");
            state.ship_pending = true;
        }
        self.store.save(state)?;
        self.record(
            state,
            &format!(
                "plan updated from {count} message(s): {} added, {} removed",
                splice.added, splice.removed
            ),
        );
        self.emit(
            state,
            EventType::PlanUpdated,
            json!({
                "reason": "mailbox",
                "messages": count,
                "added": splice.added,
                "removed": splice.removed,
                "tasks_total": state.plan.len(),
                "current_task_index": state.current_task_index,
            }),
        );
        Ok(None)
    }

    /// One agent session with local retries for retryable failures.
    pub(crate) fn run_session(&self, state: &mut RunState, request: &AgentRequest) -> Result<Session> {
        let attempts = self.config.agent.max_retries + 1;
        for attempt in 1..=attempts {
            if self.interrupted() {
                return Ok(Session::Halt(Halt::new(RunStatus::Paused, "interrupted")));
            }
            state.session_count += 1;
            let session = state.session_count;
            self.store.save(state)?;
            self.record(
                state,
                &format!("session {session} started ({}, {}, attempt {attempt})", request.phase(), request.label),
            );
            self.emit(
                state,
                EventType::SessionStarted,
                json!({
                    "session": session,
                    "phase": request.phase().as_str(),
                    "label": request.label,
                    "model": request.profile.model,
                    "attempt": attempt,
                }),
            );

            let result = self.agent.run(request);

            let (ok, error_kind) = match &result {
                Ok(_) => (true, None),
                Err(err) => (false, Some(err.kind())),
            };
            self.record(
                state,
                &format!(
                    "session {session} completed ({})",
                    if ok { "ok" } else { error_kind.unwrap_or("error") }
                ),
            );
            self.emit(
                state,
                EventType::SessionCompleted,
                json!({
                    "session": session,
                    "phase": request.phase().as_str(),
                    "label": request.label,
                    "success": ok,
                    "error": error_kind,
                }),
            );

            match result {
                Ok(output) => return Ok(Session::Done(output)),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.config.agent.retry_delay(attempt);
                    warn!(attempt, attempts, err = %err, label = %request.label, delay_ms = delay.as_millis() as u64, "agent session failed, retrying");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Ok(Session::Halt(self.escalate(state, &err))),
            }
        }
        Ok(Session::Halt(Halt::new(RunStatus::Blocked, "agent retries exhausted")))
    }

    fn escalate(&self, state: &mut RunState, err: &AgentError) -> Halt {
        let status = if err.is_retryable() {
            RunStatus::Blocked
        } else {
            RunStatus::Failed
        };
        error!(err = %err, kind = err.kind(), status = %status, "agent session escalated");
        let reason = err.to_string();
        state.last_error = Some(reason.clone());
        Halt::new(status, reason)
    }

    /// Validated status change; emits `status.changed` when it is a change.
    pub(crate) fn transition(&self, state: &mut RunState, next: RunStatus, reason: &str) -> Result<()> {
        let previous = state.status;
        if state.set_status(next)? {
            info!(from = %previous, to = %next, reason, "status changed");
            self.record(state, &format!("status {previous} -> {next}: {reason}"));
            self.emit(
                state,
                EventType::StatusChanged,
                json!({ "previous": previous, "status": next, "reason": reason }),
            );
        }
        Ok(())
    }

    fn finish(&self, state: &mut RunState, halt: Halt) -> Result<RunStatus> {
        // `planning` has no edge to `blocked`; park it as `paused` instead.
        let target = if state.status.can_transition_to(halt.status) {
            halt.status
        } else if halt.status == RunStatus::Blocked {
            RunStatus::Paused
        } else {
            RunStatus::Failed
        };
        self.transition(state, target, &halt.reason)?;
        self.store.save(state)?;

        info!(status = %state.status, sessions = state.session_count, "run stopped");
        self.record(state, &format!("run ended: {} ({})", state.status, halt.reason));
        self.emit(
            state,
            EventType::RunCompleted,
            json!({
                "status": state.status,
                "reason": halt.reason,
                "tasks_completed": state.plan.completed_count(),
                "tasks_total": state.plan.len(),
                "sessions": state.session_count,
                "prs_created": state.prs_created,
                "prs_merged": state.prs_merged,
            }),
        );

        if state.status == RunStatus::Success || halt.cleanup {
            self.store.clean_run_files()?;
        }
        Ok(state.status)
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, state: &RunState, event_type: EventType, data: Value) {
        self.events
            .emit(WebhookEvent::new(event_type, &state.run_id, data));
    }

    pub(crate) fn record(&self, state: &RunState, message: &str) {
        RunLog::new(self.store.paths(), &state.run_id).record(message);
    }
}

fn task_data(index: usize, task: &Task) -> Value {
    json!({
        "task_index": index,
        "description": task.description,
        "complexity": task.complexity.as_str(),
        "group": task.group,
    })
}
