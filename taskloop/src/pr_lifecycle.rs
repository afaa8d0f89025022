//! Shipping a finished task group: rebase, push, open the PR, watch CI and
//! reviews, fix, merge.
//!
//! Stages only move forward through [`WorkflowStage`]'s table, apart from the
//! `ci_failed -> waiting_ci` fix loop. A merged PR is final: it is never
//! polled or fixed again.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use anyhow::{Context, Result};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::Budget;
use crate::core::ci::{chunk_log, failed_jobs};
use crate::core::events::EventType;
use crate::core::plan::Complexity;
use crate::core::profile::Phase;
use crate::core::status::{RunStatus, TransitionError, WorkflowStage};
use crate::io::agent::{AgentRequest, AgentStatus};
use crate::io::git::RebaseOutcome;
use crate::io::host::{ChecksState, CodeHost, PrState, ReviewComment, ReviewDecision};
use crate::io::pr_store::{JobChunks, PrArtifacts};
use crate::io::prompt::FixInputs;
use crate::io::run_state::RunState;
use crate::orchestrator::{Halt, Orchestrator, Session};

/// Conflict-resolution sessions allowed for one rebase.
const MAX_CONFLICT_ROUNDS: u32 = 3;
/// Consecutive failed status queries tolerated while polling.
const MAX_POLL_ERRORS: u32 = 3;

/// Logs could not be downloaded for any failed job.
#[derive(Debug, Error)]
#[error("PR #{pr}: could not download logs for any failed CI job ({})", .failures.join("; "))]
pub struct CiLogError {
    pub pr: u64,
    pub failures: Vec<String>,
}

/// Feedback bundle for one open pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrContext {
    pub pr_number: u64,
    pub stage: WorkflowStage,
    /// Failed job name -> its log split into bounded chunks.
    pub ci_failures: BTreeMap<String, Vec<String>>,
    /// Chunk files on disk, in job order.
    pub chunk_files: Vec<JobChunks>,
    pub review_comments: Vec<ReviewComment>,
}

impl PrContext {
    pub fn new(pr_number: u64) -> Self {
        Self {
            pr_number,
            stage: WorkflowStage::PrCreated,
            ci_failures: BTreeMap::new(),
            chunk_files: Vec::new(),
            review_comments: Vec::new(),
        }
    }

    /// Context for a PR picked up again after a restart.
    pub fn resume(pr_number: u64) -> Self {
        Self {
            stage: WorkflowStage::WaitingCi,
            ..Self::new(pr_number)
        }
    }

    pub fn advance(&mut self, next: WorkflowStage) -> Result<(), TransitionError> {
        if self.stage == WorkflowStage::Merged && next != WorkflowStage::Merged {
            return Err(TransitionError::PrMerged {
                pr: self.pr_number,
                to: next,
            });
        }
        self.stage = self.stage.advance(next)?;
        Ok(())
    }

    /// A merge observed on the host is final whatever stage we were in.
    pub fn mark_merged(&mut self) {
        self.stage = WorkflowStage::Merged;
    }

    pub fn clear_feedback(&mut self) {
        self.ci_failures.clear();
        self.chunk_files.clear();
        self.review_comments.clear();
    }
}

/// Download, chunk and store the logs of the failed jobs in `run_ids`.
///
/// Cancelled and successful jobs are ignored. Individual download failures
/// are tolerated; losing every log is a [`CiLogError`].
#[instrument(skip_all, fields(pr = ctx.pr_number))]
pub fn collect_ci_failures(
    host: &dyn CodeHost,
    artifacts: &PrArtifacts,
    ctx: &mut PrContext,
    run_ids: &[u64],
    chunk_chars: usize,
) -> Result<()> {
    artifacts.reset_ci()?;
    ctx.ci_failures.clear();
    ctx.chunk_files.clear();

    let mut failures = Vec::new();
    let mut attempted = 0usize;
    for &run_id in run_ids {
        let jobs = host
            .run_jobs(run_id)
            .with_context(|| format!("list jobs of workflow run {run_id}"))?;
        for job in failed_jobs(&jobs) {
            attempted += 1;
            match host.job_log(job.id) {
                Ok(log) => {
                    let chunks = chunk_log(&log, chunk_chars);
                    let files = artifacts.write_job_chunks(&job.name, &chunks)?;
                    debug!(job = %job.name, chunks = chunks.len(), "collected job log");
                    ctx.ci_failures.insert(job.name.clone(), chunks);
                    ctx.chunk_files.push(files);
                }
                Err(err) => {
                    warn!(job = %job.name, err = %err, "failed to download job log");
                    failures.push(format!("{}: {err:#}", job.name));
                }
            }
        }
    }

    if ctx.ci_failures.is_empty() {
        if attempted == 0 {
            failures.push("no failed jobs found in the failing runs".to_string());
        }
        return Err(CiLogError {
            pr: ctx.pr_number,
            failures,
        }
        .into());
    }
    Ok(())
}

enum Opened {
    Pr(PrContext),
    Halt(Halt),
}

impl Orchestrator<'_> {
    /// Drive the current group's PR to merge. `None` means the group shipped
    /// and the loop continues.
    #[instrument(skip_all, fields(pr = ?state.current_pr))]
    pub(crate) fn ship(&self, state: &mut RunState) -> Result<Option<Halt>> {
        let mut ctx = match state.current_pr {
            Some(pr) => {
                info!(pr, "resuming PR lifecycle");
                state.workflow_stage = Some(WorkflowStage::WaitingCi);
                self.store.save(state)?;
                PrContext::resume(pr)
            }
            None => {
                let mut ctx = match self.open_pr(state)? {
                    Opened::Pr(ctx) => ctx,
                    Opened::Halt(halt) => return Ok(Some(halt)),
                };
                self.set_stage(state, &mut ctx, WorkflowStage::WaitingCi)?;
                if state.options.pause_on_pr {
                    return Ok(Some(Halt::new(
                        RunStatus::Paused,
                        format!("PR #{} opened; paused for review", ctx.pr_number),
                    )));
                }
                ctx
            }
        };
        self.watch(state, &mut ctx)
    }

    fn open_pr(&self, state: &mut RunState) -> Result<Opened> {
        let remote = self.config.git.remote.clone();
        let target = self.config.git.target_branch.clone();
        let branch = self.vcs.current_branch()?;
        if branch == target {
            let reason = format!("working branch is the target branch '{target}'; refusing to open a PR");
            state.last_error = Some(reason.clone());
            return Ok(Opened::Halt(Halt::new(RunStatus::Blocked, reason)));
        }

        let existing = self.host.find_open_pr(&branch)?;
        if existing.is_none()
            && let Some(max) = state.options.max_prs
            && state.prs_created >= max
        {
            info!(max, "PR limit reached before opening the next PR");
            return Ok(Opened::Halt(Halt::new(
                RunStatus::Paused,
                format!("PR limit reached ({max})"),
            )));
        }

        self.vcs.commit_all("chore: commit remaining changes")?;
        self.vcs.fetch(&remote, &target)?;
        if let Some(halt) = self.rebase(state, &format!("{remote}/{target}"))? {
            return Ok(Opened::Halt(halt));
        }
        self.vcs.push(&remote, &branch)?;

        let (pr, created) = match existing {
            Some(existing) => {
                info!(pr = existing.number, "reusing open PR for branch");
                (existing, false)
            }
            None => {
                let (title, body) = pr_text(state);
                (self.host.create_pr(&branch, &target, &title, &body)?, true)
            }
        };

        state.current_pr = Some(pr.number);
        if created {
            state.prs_created += 1;
        }
        let ctx = PrContext::new(pr.number);
        state.workflow_stage = Some(
            state
                .workflow_stage
                .unwrap_or(WorkflowStage::Working)
                .advance(WorkflowStage::PrCreated)?,
        );
        self.store.save(state)?;

        self.record(state, &format!("PR #{} ready at {}", pr.number, pr.url));
        if created {
            self.emit(
                state,
                EventType::PrCreated,
                json!({
                    "pr_number": pr.number,
                    "url": pr.url,
                    "branch": branch,
                    "base": target,
                }),
            );
        }
        Ok(Opened::Pr(ctx))
    }

    /// Rebase onto `upstream`, handing conflicts to the agent.
    fn rebase(&self, state: &mut RunState, upstream: &str) -> Result<Option<Halt>> {
        let mut outcome = self.vcs.rebase_onto(upstream)?;
        let mut rounds = 0u32;
        while let RebaseOutcome::Conflicts(files) = outcome {
            rounds += 1;
            if rounds > MAX_CONFLICT_ROUNDS {
                self.vcs.rebase_abort()?;
                let reason = format!("rebase onto {upstream} still conflicts after {MAX_CONFLICT_ROUNDS} resolution attempts");
                state.last_error = Some(reason.clone());
                return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
            }
            if let Some(halt) = self.session_limit(state) {
                self.vcs.rebase_abort()?;
                return Ok(Some(halt));
            }
            warn!(files = files.len(), round = rounds, "rebase conflicts, asking agent to resolve");
            self.record(state, &format!("rebase conflicts in {} file(s)", files.len()));

            let request = AgentRequest {
                profile: self.profiles.resolve(Phase::Working, Complexity::DebuggingQa),
                prompt: self.prompts.pr_fix(&FixInputs {
                    pr: state.current_pr,
                    goal: &state.goal,
                    target_branch: &self.config.git.target_branch,
                    conflicts: &files,
                    ..FixInputs::default()
                })?,
                label: format!("rebase-{rounds}"),
            };
            match self.run_session(state, &request)? {
                Session::Done(output) if output.status == AgentStatus::Done => {}
                Session::Done(output) => {
                    self.vcs.rebase_abort()?;
                    state.last_error = Some(output.summary.clone());
                    return Ok(Some(Halt::new(RunStatus::Blocked, output.summary)));
                }
                Session::Halt(halt) => {
                    self.vcs.rebase_abort()?;
                    return Ok(Some(halt));
                }
            }
            outcome = self.vcs.rebase_continue()?;
        }
        Ok(None)
    }

    fn watch(&self, state: &mut RunState, ctx: &mut PrContext) -> Result<Option<Halt>> {
        let pr = ctx.pr_number;
        let max_polls = self.config.pr.max_polls;
        let mut polls = Budget::new("CI poll", max_polls);
        let mut fixes = Budget::new("PR fix", self.config.pr.max_fix_attempts);
        let mut poll_errors = 0u32;
        let mut announced_green = false;
        let mut addressed: BTreeSet<String> = BTreeSet::new();

        loop {
            if let Some(halt) = self.apply_control(state)? {
                return Ok(Some(halt));
            }
            if self.interrupted() {
                return Ok(Some(Halt::new(RunStatus::Paused, "interrupted")));
            }
            if polls.spend().is_err() {
                let reason = format!("PR #{pr}: checks did not settle after {max_polls} polls");
                state.last_error = Some(reason.clone());
                return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
            }

            let status = match self.host.pr_status(pr) {
                Ok(status) => {
                    poll_errors = 0;
                    status
                }
                Err(err) => {
                    poll_errors += 1;
                    if poll_errors >= MAX_POLL_ERRORS {
                        return Err(err.context(format!("query status of PR #{pr}")));
                    }
                    warn!(pr, err = %err, attempt = poll_errors, "PR status query failed");
                    self.wait_poll_interval();
                    continue;
                }
            };
            debug!(pr, state = ?status.state, checks = ?status.checks, review = ?status.review, "polled PR");

            match status.state {
                PrState::Merged => {
                    info!(pr, "PR already merged, treating group as shipped");
                    return self.complete_merge(state, ctx, false);
                }
                PrState::Closed => {
                    state.current_pr = None;
                    let reason = format!("PR #{pr} was closed without merging");
                    state.last_error = Some(reason.clone());
                    return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
                }
                PrState::Open => {}
            }

            match status.checks {
                ChecksState::Pending => {}
                ChecksState::Failed => {
                    announced_green = false;
                    if let Some(halt) =
                        self.fix_round(state, ctx, &mut fixes, Some(status.failed_run_ids.as_slice()))?
                    {
                        return Ok(Some(halt));
                    }
                }
                ChecksState::Passed | ChecksState::NoChecks => {
                    if !announced_green {
                        announced_green = true;
                        self.record(state, &format!("PR #{pr}: checks passed"));
                        self.emit(
                            state,
                            EventType::CiPassed,
                            json!({
                                "pr_number": pr,
                                "checks": if status.checks == ChecksState::NoChecks { "none" } else { "passed" },
                            }),
                        );
                    }

                    if self.config.pr.require_approval {
                        if ctx.stage == WorkflowStage::WaitingCi {
                            self.set_stage(state, ctx, WorkflowStage::WaitingReviews)?;
                        }
                        match status.review {
                            ReviewDecision::Approved => {}
                            ReviewDecision::ChangesRequested => {
                                let comments = self.fetch_comments(pr);
                                if comments.iter().any(|c| !addressed.contains(&c.id)) {
                                    addressed.extend(comments.iter().map(|c| c.id.clone()));
                                    announced_green = false;
                                    if let Some(halt) = self.fix_round(state, ctx, &mut fixes, None)? {
                                        return Ok(Some(halt));
                                    }
                                }
                                self.wait_poll_interval();
                                continue;
                            }
                            ReviewDecision::ReviewRequired | ReviewDecision::None => {
                                self.wait_poll_interval();
                                continue;
                            }
                        }
                    }

                    self.set_stage(state, ctx, WorkflowStage::ReadyToMerge)?;
                    if !state.options.auto_merge {
                        return Ok(Some(Halt::new(
                            RunStatus::Paused,
                            format!("PR #{pr} is ready to merge; waiting for a manual merge"),
                        )));
                    }
                    self.host.merge(pr, self.config.pr.merge_method)?;
                    return self.complete_merge(state, ctx, true);
                }
            }
            self.wait_poll_interval();
        }
    }

    /// One combined fix session for CI failures (when `failed_runs` is set)
    /// and pending review comments.
    fn fix_round(
        &self,
        state: &mut RunState,
        ctx: &mut PrContext,
        fixes: &mut Budget,
        failed_runs: Option<&[u64]>,
    ) -> Result<Option<Halt>> {
        let pr = ctx.pr_number;
        if let Some(halt) = self.session_limit(state) {
            return Ok(Some(halt));
        }
        let attempt = match fixes.spend() {
            Ok(attempt) => attempt,
            Err(err) => {
                let reason = format!("PR #{pr}: {err}");
                state.last_error = Some(reason.clone());
                return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
            }
        };
        let artifacts = PrArtifacts::new(self.store.paths(), pr);

        match failed_runs {
            Some(run_ids) => {
                let next = if ctx.stage == WorkflowStage::WaitingReviews {
                    WorkflowStage::AddressingReviews
                } else {
                    WorkflowStage::CiFailed
                };
                self.set_stage(state, ctx, next)?;
                let collected = collect_ci_failures(
                    self.host,
                    &artifacts,
                    ctx,
                    run_ids,
                    self.config.pr.ci_log_chunk_chars,
                );
                self.record(state, &format!("PR #{pr}: CI failed ({} job(s) with logs)", ctx.ci_failures.len()));
                self.emit(
                    state,
                    EventType::CiFailed,
                    json!({
                        "pr_number": pr,
                        "run_ids": run_ids,
                        "failed_jobs": ctx.ci_failures.keys().collect::<Vec<_>>(),
                    }),
                );
                if let Err(err) = collected {
                    if err.downcast_ref::<CiLogError>().is_some() {
                        let reason = format!("{err:#}");
                        state.last_error = Some(reason.clone());
                        return Ok(Some(Halt::new(RunStatus::Blocked, reason)));
                    }
                    return Err(err);
                }
            }
            None => {
                ctx.ci_failures.clear();
                ctx.chunk_files.clear();
                self.set_stage(state, ctx, WorkflowStage::AddressingReviews)?;
            }
        }

        ctx.review_comments = self.fetch_comments(pr);
        artifacts.write_comments(&ctx.review_comments)?;

        let request = AgentRequest {
            profile: self.profiles.resolve(Phase::Working, Complexity::DebuggingQa),
            prompt: self.prompts.pr_fix(&FixInputs {
                pr: Some(pr),
                goal: &state.goal,
                target_branch: &self.config.git.target_branch,
                conflicts: &[],
                ci_jobs: &ctx.chunk_files,
                comments: &ctx.review_comments,
            })?,
            label: format!("pr-{pr}-fix-{attempt}"),
        };
        match self.run_session(state, &request)? {
            Session::Done(output) if output.status == AgentStatus::Done => {
                info!(pr, attempt, summary = %output.summary, "fix session finished");
            }
            Session::Done(output) => {
                state.last_error = Some(output.summary.clone());
                return Ok(Some(Halt::new(RunStatus::Blocked, output.summary)));
            }
            Session::Halt(halt) => return Ok(Some(halt)),
        }

        self.vcs
            .commit_all(&format!("fix: address CI and review feedback on PR #{pr}"))?;
        let branch = self.vcs.current_branch()?;
        self.vcs.push(&self.config.git.remote, &branch)?;
        ctx.clear_feedback();
        self.set_stage(state, ctx, WorkflowStage::WaitingCi)?;
        Ok(None)
    }

    fn complete_merge(
        &self,
        state: &mut RunState,
        ctx: &mut PrContext,
        merged_here: bool,
    ) -> Result<Option<Halt>> {
        let pr = ctx.pr_number;
        ctx.mark_merged();
        state.prs_merged += 1;
        state.current_pr = None;
        state.ship_pending = false;
        state.unshipped_work = false;
        state.workflow_stage = Some(WorkflowStage::Merged.advance(WorkflowStage::Working)?);
        self.store.save(state)?;

        info!(pr, merged_here, "PR merged");
        self.record(state, &format!("PR #{pr} merged"));
        self.emit(
            state,
            EventType::PrMerged,
            json!({
                "pr_number": pr,
                "merged_by_taskloop": merged_here,
                "merge_method": self.config.pr.merge_method.as_flag().trim_start_matches("--"),
            }),
        );
        Ok(None)
    }

    fn set_stage(&self, state: &mut RunState, ctx: &mut PrContext, next: WorkflowStage) -> Result<()> {
        let previous = ctx.stage;
        ctx.advance(next)?;
        if previous != next {
            debug!(pr = ctx.pr_number, from = %previous, to = %next, "workflow stage changed");
            self.record(state, &format!("PR #{}: {previous} -> {next}", ctx.pr_number));
        }
        state.workflow_stage = Some(next);
        self.store.save(state)
    }

    fn fetch_comments(&self, pr: u64) -> Vec<ReviewComment> {
        match self.host.review_comments(pr) {
            Ok(comments) => comments,
            Err(err) => {
                warn!(pr, err = %err, "failed to fetch review comments");
                Vec::new()
            }
        }
    }

    fn wait_poll_interval(&self) {
        let interval = self.config.pr.poll_interval();
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
}

fn pr_text(state: &RunState) -> (String, String) {
    let index = state.current_task_index.min(state.plan.len().saturating_sub(1));
    let tasks: Vec<_> = state
        .plan
        .group_indices(index)
        .into_iter()
        .filter_map(|i| state.plan.get(i))
        .collect();
    let title = match state.plan.get(index) {
        Some(task) => task.group.clone().unwrap_or_else(|| task.description.clone()),
        None => state.goal.lines().next().unwrap_or("taskloop changes").to_string(),
    };
    let mut body = format!("## Goal\n\n{}\n\n## Tasks\n\n", state.goal.trim());
    for task in tasks {
        let mark = if task.completed { "x" } else { " " };
        body.push_str(&format!("- [{mark}] {}\n", task.description));
    }
    (title, body)
}
