//! Durable, single-writer store for one run's state directory.
//!
//! Layout under the state dir:
//!
//! ```text
//! goal.txt  criteria.txt  plan.md  state.json  progress.md  context.md
//! mailbox.json  control.json  config.toml  webhooks.json
//! logs/run-{run_id}.log
//! pr-{n}/ci/{job}/{1,2,...}.log   pr-{n}/comments/*
//! ```
//!
//! Only the orchestrator holding `.lock` writes `state.json` while a run is
//! active. Other processes queue commands in `control.json`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::Plan;
use crate::io::fs::{FileLockGuard, open_lock_file, read_json, read_optional, write_atomic, write_json};
use crate::io::run_state::{OptionsUpdate, RunOptions, RunState};

/// Run logs kept by [`StateStore::rotate_logs`].
pub const KEEP_RUN_LOGS: usize = 10;

/// Attempts at the run lock before reporting a conflict. A status query
/// holds it shared for a moment, which must not fail a starting run.
const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Entries surviving a successful run's cleanup.
const PRESERVED: &[&str] = &[
    "logs",
    "config.toml",
    "webhooks.json",
    "webhook_deliveries.jsonl",
    ".lock",
];

/// Another process already holds the run lock.
#[derive(Debug, Error)]
#[error("run in {} is already active in another process (lock {} held)", .state_dir.display(), .lock_path.display())]
pub struct LockConflict {
    pub state_dir: PathBuf,
    pub lock_path: PathBuf,
}

/// Exclusive ownership of a state dir. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(err = %err, path = %self.path.display(), "failed to release run lock");
        }
    }
}

/// A command recorded for the orchestrator to apply at its next checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Pause { reason: Option<String> },
    Stop { reason: Option<String>, cleanup: bool },
    UpdateOptions { update: OptionsUpdate },
}

/// Well-known paths inside a state dir.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn goal(&self) -> PathBuf {
        self.root.join("goal.txt")
    }
    pub fn criteria(&self) -> PathBuf {
        self.root.join("criteria.txt")
    }
    pub fn plan(&self) -> PathBuf {
        self.root.join("plan.md")
    }
    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }
    pub fn progress(&self) -> PathBuf {
        self.root.join("progress.md")
    }
    pub fn context(&self) -> PathBuf {
        self.root.join("context.md")
    }
    pub fn lock(&self) -> PathBuf {
        self.root.join(".lock")
    }
    pub fn control(&self) -> PathBuf {
        self.root.join("control.json")
    }
    pub fn control_lock(&self) -> PathBuf {
        self.root.join("control.lock")
    }
    pub fn mailbox(&self) -> PathBuf {
        self.root.join("mailbox.json")
    }
    pub fn mailbox_lock(&self) -> PathBuf {
        self.root.join("mailbox.lock")
    }
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }
    pub fn webhooks(&self) -> PathBuf {
        self.root.join("webhooks.json")
    }
    pub fn webhook_deliveries(&self) -> PathBuf {
        self.root.join("webhook_deliveries.jsonl")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
    pub fn run_log(&self, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("run-{run_id}.log"))
    }
    pub fn agent_dir(&self) -> PathBuf {
        self.root.join("agent")
    }
    pub fn pr_dir(&self, pr: u64) -> PathBuf {
        self.root.join(format!("pr-{pr}"))
    }
}

/// Service wrapping every read and write of the run record.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: StatePaths,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: StatePaths::new(root),
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn exists(&self) -> bool {
        self.paths.state().exists()
    }

    /// Create a fresh run. Refuses to replace a non-terminal run unless
    /// `force` is set.
    #[instrument(skip_all, fields(state_dir = %self.paths.root().display(), force))]
    pub fn init(
        &self,
        goal: &str,
        options: RunOptions,
        initial_plan: Option<&str>,
        force: bool,
    ) -> Result<RunState> {
        if goal.trim().is_empty() {
            return Err(anyhow!("goal must not be empty"));
        }
        options.validate()?;
        if self.exists() {
            let existing = self.load().context("load existing run")?;
            if !existing.status.is_terminal() && !force {
                return Err(anyhow!(
                    "run {} is still {} (use --force to replace it)",
                    existing.run_id,
                    existing.status
                ));
            }
            if self.is_locked()? {
                return Err(LockConflict {
                    state_dir: self.paths.root().to_path_buf(),
                    lock_path: self.paths.lock(),
                }
                .into());
            }
            self.clean_run_files()?;
        }

        fs::create_dir_all(self.paths.root())
            .with_context(|| format!("create state dir {}", self.paths.root().display()))?;
        let run_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let mut state = RunState::new(run_id, goal.trim(), options);
        if let Some(markdown) = initial_plan {
            state.plan = Plan::parse(markdown);
            if state.plan.is_empty() {
                return Err(anyhow!("initial plan contains no tasks"));
            }
        }
        self.save(&mut state)?;
        write_atomic(&self.paths.context(), "")?;
        info!(run_id = %state.run_id, tasks = state.plan.len(), "run initialized");
        Ok(state)
    }

    /// Load `state.json` plus the goal, criteria and plan files.
    pub fn load(&self) -> Result<RunState> {
        let path = self.paths.state();
        if !path.exists() {
            return Err(anyhow!(
                "no run found in {} (run `taskloop init` first)",
                self.paths.root().display()
            ));
        }
        debug!(path = %path.display(), "loading run state");
        let mut state: RunState = read_json(&path)?;
        state.goal = read_optional(&self.paths.goal())?.trim().to_string();
        state.criteria = read_optional(&self.paths.criteria())?.trim().to_string();
        state.plan = Plan::parse(&read_optional(&self.paths.plan())?);
        debug!(run_id = %state.run_id, status = %state.status, index = state.current_task_index, "run state loaded");
        Ok(state)
    }

    /// Persist every part of the run record and refresh `progress.md`.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.updated_at = Utc::now();
        debug!(run_id = %state.run_id, status = %state.status, index = state.current_task_index, "writing run state");
        write_atomic(&self.paths.goal(), &format!("{}\n", state.goal))?;
        write_atomic(&self.paths.criteria(), &state.criteria)?;
        write_atomic(&self.paths.plan(), &state.plan.render())?;
        write_atomic(&self.paths.progress(), &state.progress_summary())?;
        write_json(&self.paths.state(), state)
    }

    /// Take the run's exclusive lock, retrying briefly before giving up.
    pub fn acquire_lock(&self) -> Result<RunLock> {
        let path = self.paths.lock();
        let file = open_lock_file(&path)?;
        for attempt in 1..=LOCK_ATTEMPTS {
            if file.try_lock_exclusive().is_ok() {
                debug!(path = %path.display(), attempt, "run lock acquired");
                return Ok(RunLock { file, path });
            }
            if attempt < LOCK_ATTEMPTS {
                thread::sleep(LOCK_RETRY_DELAY);
            }
        }
        warn!(path = %path.display(), "run lock already held");
        Err(LockConflict {
            state_dir: self.paths.root().to_path_buf(),
            lock_path: path,
        }
        .into())
    }

    /// Whether some process currently holds the run lock.
    ///
    /// Checks with a shared lock so two concurrent queries never see each
    /// other as the owner.
    pub fn is_locked(&self) -> Result<bool> {
        let path = self.paths.lock();
        if !path.exists() {
            return Ok(false);
        }
        let file = open_lock_file(&path)?;
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    pub fn read_context(&self) -> Result<String> {
        read_optional(&self.paths.context())
    }

    /// Append a learning to `context.md`.
    pub fn append_context(&self, entry: &str) -> Result<()> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Ok(());
        }
        let mut contents = self.read_context()?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(entry);
        contents.push('\n');
        write_atomic(&self.paths.context(), &contents)
    }

    /// Record a command for the active orchestrator.
    pub fn enqueue_control(&self, command: ControlCommand) -> Result<()> {
        let _guard = FileLockGuard::acquire(&self.paths.control_lock())?;
        let mut queue = self.read_control_queue()?;
        debug!(?command, queued = queue.len(), "queueing control command");
        queue.push(command);
        write_json(&self.paths.control(), &queue)
    }

    /// Take every queued command, oldest first.
    pub fn drain_control(&self) -> Result<Vec<ControlCommand>> {
        let _guard = FileLockGuard::acquire(&self.paths.control_lock())?;
        let queue = self.read_control_queue()?;
        if !queue.is_empty() {
            write_json(&self.paths.control(), &Vec::<ControlCommand>::new())?;
        }
        Ok(queue)
    }

    fn read_control_queue(&self) -> Result<Vec<ControlCommand>> {
        let path = self.paths.control();
        if !path.exists() {
            return Ok(Vec::new());
        }
        match read_json(&path) {
            Ok(queue) => Ok(queue),
            Err(err) => {
                warn!(err = %err, "discarding unreadable control queue");
                Ok(Vec::new())
            }
        }
    }

    /// Keep only the newest `keep` run logs (by file name, which sorts by run id).
    pub fn rotate_logs(&self, keep: usize) -> Result<usize> {
        let dir = self.paths.logs_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut logs: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with("run-") && n.ends_with(".log"))
            })
            .collect();
        if logs.len() <= keep {
            return Ok(0);
        }
        logs.sort();
        let excess = logs.len() - keep;
        for path in &logs[..excess] {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        }
        debug!(removed = excess, "rotated run logs");
        Ok(excess)
    }

    /// Drop everything except logs and project/subscriber config. Runs after
    /// `success`, on `stop --cleanup`, `clean` and `init --force`.
    pub fn clean_run_files(&self) -> Result<()> {
        let keep = PRESERVED;
        let root = self.paths.root();
        if !root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(root).with_context(|| format!("list {}", root.display()))? {
            let entry = entry.with_context(|| format!("list {}", root.display()))?;
            let name = entry.file_name();
            if keep.iter().any(|k| name == **k) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .with_context(|| format!("remove {}", path.display()))?;
        }
        info!(state_dir = %root.display(), "state directory cleaned");
        Ok(())
    }
}
