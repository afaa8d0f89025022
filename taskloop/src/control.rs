//! Control surface operations against a state dir.
//!
//! While an orchestrator holds the run lock, `state.json` belongs to it: pause,
//! stop and options updates are queued in `control.json` and applied at its
//! next checkpoint. Without a lock holder they are applied directly through
//! the transition table.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::merge::Priority;
use crate::core::status::RunStatus;
use crate::io::mailbox::{MailboxStatus, MailboxStore};
use crate::io::run_log::RunLog;
use crate::io::run_state::{OptionsUpdate, RunOptions, RunState};
use crate::io::state_store::{ControlCommand, LockConflict, StateStore};

/// Sender recorded for messages attached to `resume`.
pub const RESUME_SENDER: &str = "operator";

/// How a control command took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum ControlOutcome {
    /// Recorded for the active orchestrator's next checkpoint.
    Queued,
    /// Written to `state.json`; the run now has this status.
    Applied(RunStatus),
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub status: RunStatus,
    pub active: bool,
    pub goal: String,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub current_task_index: usize,
    pub current_task: Option<String>,
    pub workflow_stage: Option<String>,
    pub session_count: u32,
    pub current_pr: Option<u64>,
    pub prs_created: u32,
    pub prs_merged: u32,
    pub last_error: Option<String>,
    pub options: RunOptions,
    pub mailbox: MailboxStatus,
}

pub fn init(
    store: &StateStore,
    goal: &str,
    options: RunOptions,
    initial_plan: Option<&str>,
    force: bool,
) -> Result<RunState> {
    store.init(goal, options, initial_plan, force)
}

pub fn status(store: &StateStore) -> Result<StatusReport> {
    let state = store.load()?;
    let mailbox = MailboxStore::new(store.paths()).status()?;
    Ok(StatusReport {
        run_id: state.run_id.clone(),
        status: state.status,
        active: store.is_locked()?,
        goal: state.goal.clone(),
        tasks_total: state.plan.len(),
        tasks_completed: state.plan.completed_count(),
        current_task_index: state.current_task_index,
        current_task: state.current_task().map(|t| t.description.clone()),
        workflow_stage: state.workflow_stage.map(|s| s.as_str().to_string()),
        session_count: state.session_count,
        current_pr: state.current_pr,
        prs_created: state.prs_created,
        prs_merged: state.prs_merged,
        last_error: state.last_error.clone(),
        options: state.options.clone(),
        mailbox,
    })
}

pub fn stop(store: &StateStore, reason: Option<String>, cleanup: bool) -> Result<ControlOutcome> {
    if store.is_locked()? {
        store.enqueue_control(ControlCommand::Stop { reason, cleanup })?;
        info!(cleanup, "stop queued for the active run");
        return Ok(ControlOutcome::Queued);
    }
    let status = apply_directly(store, RunStatus::Stopped, reason.as_deref().unwrap_or("stop requested"))?;
    if cleanup {
        store.clean_run_files()?;
    }
    Ok(ControlOutcome::Applied(status))
}

pub fn pause(store: &StateStore, reason: Option<String>) -> Result<ControlOutcome> {
    if store.is_locked()? {
        store.enqueue_control(ControlCommand::Pause { reason })?;
        info!("pause queued for the active run");
        return Ok(ControlOutcome::Queued);
    }
    let status = apply_directly(store, RunStatus::Paused, reason.as_deref().unwrap_or("pause requested"))?;
    Ok(ControlOutcome::Applied(status))
}

/// Prepare a run to be driven again. Returns the state to hand to the
/// orchestrator. An optional message lands in the mailbox with high priority.
pub fn resume(store: &StateStore, reason: Option<&str>, message: Option<&str>) -> Result<RunState> {
    if store.is_locked()? {
        return Err(LockConflict {
            state_dir: store.paths().root().to_path_buf(),
            lock_path: store.paths().lock(),
        }
        .into());
    }
    let mut state = store.load()?;
    match state.status {
        RunStatus::Paused | RunStatus::Blocked => {
            let previous = state.status;
            state.set_status(RunStatus::Working)?;
            state.last_error = None;
            store.save(&mut state)?;
            RunLog::new(store.paths(), &state.run_id).record(&format!(
                "resumed from {previous}: {}",
                reason.unwrap_or("resume requested")
            ));
            info!(from = %previous, "run resumed");
        }
        // Left behind by a crashed or killed process.
        RunStatus::Planning | RunStatus::Working => {
            debug!(status = %state.status, "resuming interrupted run");
        }
        other => bail!("run {} is {other} and cannot be resumed", state.run_id),
    }

    if let Some(text) = message {
        MailboxStore::new(store.paths()).send(text, RESUME_SENDER, Priority::High, BTreeMap::new())?;
    }
    Ok(state)
}

pub fn update_config(store: &StateStore, update: OptionsUpdate) -> Result<ControlOutcome> {
    if update.is_empty() {
        bail!("no options given");
    }
    let mut state = store.load()?;
    // Reject bad values before queueing them.
    state.options.clone().apply(&update)?;
    if store.is_locked()? {
        store.enqueue_control(ControlCommand::UpdateOptions { update })?;
        return Ok(ControlOutcome::Queued);
    }
    state.options.apply(&update)?;
    store.save(&mut state)?;
    info!("run options updated");
    Ok(ControlOutcome::Applied(state.status))
}

/// Remove run files, keeping logs and configuration.
pub fn clean(store: &StateStore) -> Result<()> {
    if store.is_locked()? {
        return Err(LockConflict {
            state_dir: store.paths().root().to_path_buf(),
            lock_path: store.paths().lock(),
        }
        .into());
    }
    store.clean_run_files()
}

fn apply_directly(store: &StateStore, next: RunStatus, reason: &str) -> Result<RunStatus> {
    let mut state = store.load()?;
    let previous = state.status;
    state.set_status(next)?;
    store.save(&mut state)?;
    RunLog::new(store.paths(), &state.run_id).record(&format!("status {previous} -> {next}: {reason}"));
    info!(from = %previous, to = %next, reason, "status changed by control command");
    Ok(state.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::TransitionError;

    fn store_with_run(dir: &std::path::Path) -> StateStore {
        let store = StateStore::new(dir.join(".taskloop"));
        store
            .init("Ship it", RunOptions::default(), Some("- [ ] A\n"), false)
            .expect("init");
        store
    }

    #[test]
    fn pause_then_resume_without_active_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with_run(temp.path());

        assert_eq!(
            pause(&store, Some("lunch".into())).expect("pause"),
            ControlOutcome::Applied(RunStatus::Paused)
        );
        let state = resume(&store, None, Some("use tabs")).expect("resume");
        assert_eq!(state.status, RunStatus::Working);

        let report = status(&store).expect("status");
        assert_eq!(report.status, RunStatus::Working);
        assert_eq!(report.mailbox.count, 1);
        assert_eq!(report.mailbox.previews[0].priority, Priority::High);
        assert_eq!(report.mailbox.previews[0].sender, RESUME_SENDER);
    }

    #[test]
    fn commands_are_queued_while_locked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with_run(temp.path());
        let _lock = store.acquire_lock().expect("lock");

        assert_eq!(stop(&store, None, false).expect("stop"), ControlOutcome::Queued);
        let update = OptionsUpdate {
            max_prs: Some(2),
            ..OptionsUpdate::default()
        };
        assert_eq!(update_config(&store, update).expect("update"), ControlOutcome::Queued);
        assert_eq!(store.load().expect("load").status, RunStatus::Planning);
        assert_eq!(store.drain_control().expect("drain").len(), 2);
        assert!(resume(&store, None, None).is_err());
    }

    #[test]
    fn stopped_run_cannot_resume() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with_run(temp.path());
        stop(&store, Some("done for now".into()), false).expect("stop");
        let err = resume(&store, None, None).unwrap_err();
        assert!(err.to_string().contains("cannot be resumed"));
        let err = pause(&store, None).unwrap_err();
        assert!(err.downcast_ref::<TransitionError>().is_some());
    }

    #[test]
    fn invalid_update_is_rejected_before_queueing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with_run(temp.path());
        assert!(update_config(&store, OptionsUpdate::default()).is_err());
        let _lock = store.acquire_lock().expect("lock");
        let update = OptionsUpdate {
            auto_merge: Some(false),
            ..OptionsUpdate::default()
        };
        update_config(&store, update).expect("queue");
        assert!(store.drain_control().expect("drain").len() == 1);
    }

    #[test]
    fn stop_with_cleanup_keeps_logs_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with_run(temp.path());
        stop(&store, None, true).expect("stop");
        assert!(!store.exists());
        assert!(store.paths().logs_dir().exists());
    }
}
