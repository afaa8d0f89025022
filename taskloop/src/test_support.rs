//! Test doubles for the orchestrator seams.
//!
//! Every double records what it was asked to do so tests can assert on the
//! calls, and answers from a script instead of touching processes or the
//! network.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::agent_error::AgentError;
use crate::core::ci::CiJob;
use crate::core::events::{EventType, WebhookEvent};
use crate::io::agent::{Agent, AgentOutput, AgentRequest};
use crate::io::config::{MergeMethod, TaskloopConfig};
use crate::io::git::{RebaseOutcome, Vcs};
use crate::io::host::{
    ChecksState, CodeHost, PrRef, PrState, PrStatus, ReviewComment, ReviewDecision,
};
use crate::io::run_state::{RunOptions, RunState};
use crate::io::state_store::StateStore;
use crate::io::webhooks::{DeliveryRequest, EventSink, WebhookTransport};

type Hook = Box<dyn Fn(&AgentRequest) + Send + Sync>;

/// Config tuned for tests: no poll sleeps, short budgets.
pub fn test_config() -> TaskloopConfig {
    let mut config = TaskloopConfig::default();
    config.pr.poll_interval_secs = 0;
    config.pr.max_polls = 20;
    config.agent.retry_backoff_base_ms = 0;
    config.agent.retry_backoff_max_ms = 0;
    config.webhooks.backoff_base_ms = 1;
    config.webhooks.backoff_max_ms = 5;
    config
}

/// A state dir in a fresh temp directory with an initialized run.
pub struct TestRun {
    pub dir: tempfile::TempDir,
    pub store: StateStore,
}

impl TestRun {
    /// Initialize a run with `plan` as its initial checkbox plan.
    pub fn with_plan(goal: &str, plan: &str, options: RunOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join(".taskloop"));
        store.init(goal, options, Some(plan), false).expect("init run");
        Self { dir, store }
    }

    /// Initialize a run that still needs planning.
    pub fn unplanned(goal: &str, options: RunOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join(".taskloop"));
        store.init(goal, options, None, false).expect("init run");
        Self { dir, store }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state(&self) -> RunState {
        self.store.load().expect("load state")
    }
}

/// Agent answering from a queue of scripted results.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentOutput, AgentError>>>,
    requests: Mutex<Vec<AgentRequest>>,
    hook: Option<Hook>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<Result<AgentOutput, AgentError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Run `hook` at the start of every session, before the scripted answer
    /// is returned. Lets tests act "during" a session.
    pub fn with_hook(mut self, hook: impl Fn(&AgentRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.label).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(hook) = &self.hook {
            hook(request);
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Fatal(format!("script exhausted at {}", request.label))))
    }
}

/// Git double on branch `feature` that records every call.
pub struct FakeVcs {
    branch: String,
    rebases: Mutex<VecDeque<RebaseOutcome>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self::on_branch("feature")
    }
}

impl FakeVcs {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            rebases: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes returned by successive `rebase_onto`/`rebase_continue`
    /// calls. Clean once exhausted.
    pub fn script_rebases(&self, outcomes: Vec<RebaseOutcome>) {
        self.rebases.lock().expect("rebases lock").extend(outcomes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn next_rebase(&self) -> RebaseOutcome {
        self.rebases
            .lock()
            .expect("rebases lock")
            .pop_front()
            .unwrap_or(RebaseOutcome::Clean)
    }
}

impl Vcs for FakeVcs {
    fn current_branch(&self) -> Result<String> {
        Ok(self.branch.clone())
    }

    fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.record(format!("fetch {remote} {branch}"));
        Ok(())
    }

    fn rebase_onto(&self, upstream: &str) -> Result<RebaseOutcome> {
        self.record(format!("rebase {upstream}"));
        Ok(self.next_rebase())
    }

    fn rebase_continue(&self) -> Result<RebaseOutcome> {
        self.record("rebase --continue".to_string());
        Ok(self.next_rebase())
    }

    fn rebase_abort(&self) -> Result<()> {
        self.record("rebase --abort".to_string());
        Ok(())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.record(format!("push {remote} {branch}"));
        Ok(())
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        self.record(format!("commit {message}"));
        Ok(true)
    }
}

#[derive(Default)]
struct HostState {
    next_pr: u64,
    created: Vec<(String, String, String)>,
    statuses: VecDeque<Result<PrStatus>>,
    merged: Vec<(u64, MergeMethod)>,
    run_jobs: HashMap<u64, Vec<CiJob>>,
    job_logs: HashMap<u64, String>,
    fetched_logs: Vec<u64>,
    comments: Vec<ReviewComment>,
}

/// Code host double. PRs are numbered from 1. Once the scripted statuses
/// run out a PR reports green and approved, or merged after `merge`.
#[derive(Default)]
pub struct FakeCodeHost {
    inner: Mutex<HostState>,
}

impl FakeCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: PrStatus) {
        self.lock().statuses.push_back(Ok(status));
    }

    pub fn push_status_error(&self, message: &str) {
        self.lock().statuses.push_back(Err(anyhow!(message.to_string())));
    }

    pub fn set_run_jobs(&self, run_id: u64, jobs: Vec<CiJob>) {
        self.lock().run_jobs.insert(run_id, jobs);
    }

    pub fn set_job_log(&self, job_id: u64, log: &str) {
        self.lock().job_logs.insert(job_id, log.to_string());
    }

    pub fn set_comments(&self, comments: Vec<ReviewComment>) {
        self.lock().comments = comments;
    }

    pub fn fetched_logs(&self) -> Vec<u64> {
        self.lock().fetched_logs.clone()
    }

    /// `(branch, base, title)` of every created PR.
    pub fn created(&self) -> Vec<(String, String, String)> {
        self.lock().created.clone()
    }

    pub fn merged(&self) -> Vec<(u64, MergeMethod)> {
        self.lock().merged.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.inner.lock().expect("host lock")
    }
}

/// Status of an open PR with the given checks and review decision.
pub fn open_status(checks: ChecksState, review: ReviewDecision, failed_run_ids: Vec<u64>) -> PrStatus {
    PrStatus {
        state: PrState::Open,
        checks,
        review,
        failed_run_ids,
    }
}

impl CodeHost for FakeCodeHost {
    fn find_open_pr(&self, _branch: &str) -> Result<Option<PrRef>> {
        Ok(None)
    }

    fn create_pr(&self, branch: &str, base: &str, title: &str, _body: &str) -> Result<PrRef> {
        let mut inner = self.lock();
        inner.next_pr += 1;
        let number = inner.next_pr;
        inner
            .created
            .push((branch.to_string(), base.to_string(), title.to_string()));
        Ok(PrRef {
            number,
            url: format!("https://git.test/acme/app/pull/{number}"),
        })
    }

    fn pr_status(&self, pr: u64) -> Result<PrStatus> {
        let mut inner = self.lock();
        if let Some(next) = inner.statuses.pop_front() {
            return next;
        }
        let state = if inner.merged.iter().any(|(n, _)| *n == pr) {
            PrState::Merged
        } else {
            PrState::Open
        };
        Ok(PrStatus {
            state,
            ..open_status(ChecksState::Passed, ReviewDecision::Approved, Vec::new())
        })
    }

    fn run_jobs(&self, run_id: u64) -> Result<Vec<CiJob>> {
        Ok(self.lock().run_jobs.get(&run_id).cloned().unwrap_or_default())
    }

    fn job_log(&self, job_id: u64) -> Result<String> {
        let mut inner = self.lock();
        inner.fetched_logs.push(job_id);
        inner
            .job_logs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| anyhow!("log for job {job_id} not found"))
    }

    fn review_comments(&self, _pr: u64) -> Result<Vec<ReviewComment>> {
        Ok(self.lock().comments.clone())
    }

    fn merge(&self, pr: u64, method: MergeMethod) -> Result<()> {
        self.lock().merged.push((pr, method));
        Ok(())
    }
}

/// Sink keeping every emitted event in order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WebhookEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.event_types().into_iter().filter(|t| *t == event_type).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: WebhookEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

/// Transport answering from scripted status codes (200 once exhausted).
#[derive(Default)]
pub struct RecordingTransport {
    codes: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl RecordingTransport {
    pub fn with_codes(codes: Vec<u16>) -> Self {
        Self {
            codes: Mutex::new(codes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl WebhookTransport for RecordingTransport {
    fn post(&self, request: &DeliveryRequest) -> Result<u16> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        Ok(self
            .codes
            .lock()
            .expect("codes lock")
            .pop_front()
            .unwrap_or(200))
    }
}
