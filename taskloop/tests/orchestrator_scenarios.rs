//! End-to-end runs of the work loop against scripted doubles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskloop::control::{self, ControlOutcome};
use taskloop::core::agent_error::AgentError;
use taskloop::core::ci::CiJob;
use taskloop::core::events::EventType;
use taskloop::core::merge::Priority;
use taskloop::core::status::RunStatus;
use taskloop::exit_codes;
use taskloop::io::agent::{AgentOutput, Verification};
use taskloop::io::git::RebaseOutcome;
use taskloop::io::host::{ChecksState, PrState, PrStatus, ReviewComment, ReviewDecision};
use taskloop::io::mailbox::MailboxStore;
use taskloop::io::run_state::RunOptions;
use taskloop::io::state_store::LockConflict;
use taskloop::io::webhooks::NullSink;
use taskloop::orchestrator::Orchestrator;
use taskloop::test_support::{
    FakeCodeHost, FakeVcs, RecordingSink, ScriptedAgent, TestRun, open_status, test_config,
};

fn pass() -> Result<AgentOutput, AgentError> {
    Ok(AgentOutput::done("criteria met").with_verification(Verification::Pass))
}

fn done(summary: &str) -> Result<AgentOutput, AgentError> {
    Ok(AgentOutput::done(summary))
}

/// Verifies retryable failures are retried locally and every attempt counts
/// as a session.
#[test]
fn timeouts_are_retried_until_the_task_succeeds() {
    let run = TestRun::with_plan("Ship A and B", "- [ ] A\n- [ ] B\n", RunOptions::default());
    let agent = ScriptedAgent::new(vec![
        done("did A"),
        Err(AgentError::Timeout { secs: 1800 }),
        Err(AgentError::Timeout { secs: 1800 }),
        done("did B"),
        pass(),
    ]);
    let (vcs, host, sink) = (FakeVcs::default(), FakeCodeHost::new(), RecordingSink::default());
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &vcs, &host, &sink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(exit_codes::for_status(status), exit_codes::SUCCESS);
    assert_eq!(state.session_count, 5);
    assert_eq!(agent.labels(), vec!["task-1", "task-2", "task-2", "task-2", "verify-1"]);
    assert_eq!(state.plan.completed_count(), 2);
    assert_eq!((state.prs_created, state.prs_merged), (1, 1));
    assert_eq!(host.created()[0].1, "main");
    assert!(!run.store.exists(), "run files are cleaned after success");
    assert!(run.store.paths().run_log(&state.run_id).exists());

    let types = sink.event_types();
    assert_eq!(types.first(), Some(&EventType::RunStarted));
    assert_eq!(types.last(), Some(&EventType::RunCompleted));
    assert_eq!(sink.count(EventType::SessionStarted), 5);
    assert_eq!(sink.count(EventType::PrCreated), 1);
    assert_eq!(sink.count(EventType::PrMerged), 1);
    assert!(sink.events().iter().all(|e| e.data["run_id"] == state.run_id.as_str()));
}

#[test]
fn held_lock_is_a_conflict() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let _lock = run.store.acquire_lock().expect("lock");
    let agent = ScriptedAgent::new(vec![]);
    let mut state = run.state();

    let err = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .unwrap_err();
    assert!(err.downcast_ref::<LockConflict>().is_some());
    assert!(agent.requests().is_empty());
    assert_eq!(run.state().status, RunStatus::Planning);
}

/// Verifies a second orchestrator started while the first is mid-session
/// fails fast and leaves the active run alone.
#[test]
fn second_orchestrator_during_a_session_fails_fast() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let conflict = Arc::new(Mutex::new(None));
    let store = run.store.clone();
    let seen = Arc::clone(&conflict);
    let agent = ScriptedAgent::new(vec![done("did A"), pass()]).with_hook(move |request| {
        if request.label != "task-1" {
            return;
        }
        let mut second = store.load().expect("load");
        let idle = ScriptedAgent::new(vec![]);
        let result = Orchestrator::new(&store, &idle, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
            .run(&mut second);
        let is_conflict = result.is_err_and(|err| err.downcast_ref::<LockConflict>().is_some());
        *seen.lock().expect("seen") = Some(is_conflict);
    });
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");
    assert_eq!(status, RunStatus::Success);
    assert_eq!(*conflict.lock().expect("conflict"), Some(true));
}

/// Verifies a stop issued while an agent session is in flight waits for the
/// checkpoint: the task still completes.
#[test]
fn stop_during_session_applies_at_checkpoint() {
    let run = TestRun::with_plan("goal", "- [ ] A\n- [ ] B\n", RunOptions::default());
    let store = run.store.clone();
    let agent = ScriptedAgent::new(vec![done("did A"), done("did B"), pass()]).with_hook(move |request| {
        if request.label == "task-1" {
            let outcome = control::stop(&store, Some("operator stop".into()), false).expect("stop");
            assert_eq!(outcome, ControlOutcome::Queued);
        }
    });
    let sink = RecordingSink::default();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &sink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Stopped);
    assert_eq!(exit_codes::for_status(status), exit_codes::INTERRUPTED);
    assert_eq!(agent.labels(), vec!["task-1"]);
    let saved = run.state();
    assert_eq!(saved.status, RunStatus::Stopped);
    assert!(saved.plan.tasks[0].completed);
    assert!(!saved.plan.tasks[1].completed);
    assert_eq!(saved.current_task_index, 1);
    assert!(run.store.drain_control().expect("drain").is_empty());
    assert!(sink.count(EventType::TaskCompleted) == 1);
}

/// Verifies only failed jobs are downloaded and handed to the fix session.
#[test]
fn failed_ci_jobs_are_chunked_and_fixed() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let host = FakeCodeHost::new();
    host.push_status(open_status(ChecksState::Pending, ReviewDecision::None, vec![]));
    host.push_status(open_status(ChecksState::Failed, ReviewDecision::None, vec![77]));
    host.set_run_jobs(
        77,
        vec![
            CiJob { id: 1, name: "lint".into(), conclusion: Some("failure".into()) },
            CiJob { id: 2, name: "test".into(), conclusion: Some("failure".into()) },
            CiJob { id: 3, name: "deploy".into(), conclusion: Some("cancelled".into()) },
        ],
    );
    host.set_job_log(1, "clippy: unused variable\n");
    host.set_job_log(2, "assertion failed\n");
    let agent = ScriptedAgent::new(vec![done("did A"), done("fixed lint and test"), pass()]);
    let vcs = FakeVcs::default();
    let sink = RecordingSink::default();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &vcs, &host, &sink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(host.fetched_logs(), vec![1, 2]);
    assert_eq!(agent.labels(), vec!["task-1", "pr-1-fix-1", "verify-1"]);
    let fix_prompt = &agent.requests()[1].prompt;
    assert!(fix_prompt.contains("pr-1/ci/lint/1.log"));
    assert!(fix_prompt.contains("pr-1/ci/test/1.log"));
    assert!(!fix_prompt.contains("deploy"));
    assert!(vcs.calls().iter().any(|c| c == "push origin feature"));

    let types = sink.event_types();
    let failed = types.iter().position(|t| *t == EventType::CiFailed).expect("ci.failed");
    let passed = types.iter().position(|t| *t == EventType::CiPassed).expect("ci.passed");
    assert!(failed < passed);
}

#[test]
fn unreadable_ci_logs_block_the_run() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let host = FakeCodeHost::new();
    host.push_status(open_status(ChecksState::Failed, ReviewDecision::None, vec![5]));
    host.set_run_jobs(5, vec![CiJob { id: 9, name: "test".into(), conclusion: Some("failure".into()) }]);
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Blocked);
    assert_eq!(exit_codes::for_status(status), exit_codes::BLOCKED);
    let saved = run.state();
    assert_eq!(saved.current_pr, Some(1));
    assert!(saved.last_error.expect("last error").contains("could not download logs"));
}

/// Verifies mailbox messages are merged by priority and spliced into the
/// plan without touching completed work.
#[test]
fn change_requests_regenerate_the_rest_of_the_plan() {
    let run = TestRun::with_plan("Build the API", "- [ ] Scaffold\n- [ ] Users endpoint\n", RunOptions::default());
    let paths = run.store.paths().clone();
    let agent = ScriptedAgent::new(vec![
        done("scaffolded"),
        Ok(AgentOutput::done("replanned").with_plan("- [ ] Users endpoint with auth\n- [ ] Rate limiting\n")),
        done("users"),
        done("limits"),
        pass(),
    ])
    .with_hook(move |request| {
        if request.label != "task-1" {
            return;
        }
        let mailbox = MailboxStore::new(&paths);
        for (content, priority) in [
            ("normal request", Priority::Normal),
            ("urgent request", Priority::Urgent),
            ("low request", Priority::Low),
        ] {
            mailbox
                .send(content, "ana", priority, BTreeMap::new())
                .expect("send");
        }
    });
    let sink = RecordingSink::default();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &sink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(
        agent.labels(),
        vec!["task-1", "plan-update-2", "task-2", "task-3", "verify-1"]
    );
    let prompt = &agent.requests()[1].prompt;
    let urgent = prompt.find("urgent request").expect("urgent");
    let normal = prompt.find("normal request").expect("normal");
    let low = prompt.find("low request").expect("low");
    assert!(urgent < normal && normal < low);

    let descriptions: Vec<&str> = state.plan.tasks.iter().map(|t| t.description.as_str()).collect();
    assert_eq!(descriptions, vec!["Scaffold", "Users endpoint with auth", "Rate limiting"]);
    assert!(sink.events().iter().any(|e| e.event_type == EventType::PlanUpdated && e.data["reason"] == "mailbox"));
}

#[test]
fn session_limit_pauses_at_checkpoint() {
    let options = RunOptions {
        max_sessions: Some(1),
        ..RunOptions::default()
    };
    let run = TestRun::with_plan("goal", "- [ ] A\n- [ ] B\n", options);
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Paused);
    assert_eq!(run.state().session_count, 1);

    // Raising the limit and resuming continues with the next task.
    control::update_config(
        &run.store,
        taskloop::io::run_state::OptionsUpdate {
            max_sessions: Some(0),
            ..Default::default()
        },
    )
    .expect("update");
    let mut resumed = control::resume(&run.store, None, None).expect("resume");
    let agent = ScriptedAgent::new(vec![done("did B"), pass()]);
    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut resumed)
        .expect("run again");
    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["task-2", "verify-1"]);
}

#[test]
fn credential_failure_fails_without_retrying() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let agent = ScriptedAgent::new(vec![Err(AgentError::Credential("401 unauthorized".into()))]);
    let sink = RecordingSink::default();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &sink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(agent.requests().len(), 1);
    assert!(run.state().last_error.expect("error").contains("401"));
    assert_eq!(sink.count(EventType::TaskFailed), 1);
}

#[test]
fn planning_produces_the_plan_then_runs_it() {
    let run = TestRun::unplanned("Add a health endpoint", RunOptions::default());
    let agent = ScriptedAgent::new(vec![
        Ok(AgentOutput::done("planned")
            .with_plan("- [ ] `[quick]` Add /health route\n")
            .with_criteria("GET /health returns 200")),
        done("route added"),
        pass(),
    ]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(state.criteria, "GET /health returns 200");
    let requests = agent.requests();
    assert_eq!(requests[0].label, "planning");
    assert_eq!(requests[1].profile.model, test_config().agent.models.quick);
}

/// Verifies a blocked planning session parks the run as paused.
#[test]
fn blocked_planning_pauses() {
    let run = TestRun::unplanned("Do something vague", RunOptions::default());
    let agent = ScriptedAgent::new(vec![Ok(AgentOutput::blocked("goal is ambiguous"))]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Paused);
    assert_eq!(run.state().last_error.as_deref(), Some("goal is ambiguous"));
}

#[test]
fn failed_verification_appends_remediation_tasks() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let agent = ScriptedAgent::new(vec![
        done("did A"),
        Ok(AgentOutput::done("missing docs")
            .with_verification(Verification::Fail)
            .with_remediation(vec!["`[quick]` Write docs".into()])),
        done("docs"),
        pass(),
    ]);
    let host = FakeCodeHost::new();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(state.plan.len(), 2);
    assert_eq!(state.verification_rounds, 2);
    assert_eq!(host.created().len(), 2);
}

#[test]
fn manual_merge_pauses_when_ready() {
    let options = RunOptions {
        auto_merge: false,
        ..RunOptions::default()
    };
    let run = TestRun::with_plan("goal", "- [ ] A\n", options);
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let host = FakeCodeHost::new();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Paused);
    assert!(host.merged().is_empty());
    let saved = run.state();
    assert_eq!(saved.current_pr, Some(1));
    assert_eq!(saved.workflow_stage, None);
}

/// Verifies a run started from a stale snapshot honors what is on disk.
#[test]
fn stale_state_is_reloaded_under_the_lock() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let mut stale = run.state();
    let outcome = control::pause(&run.store, Some("operator pause".into())).expect("pause");
    assert_eq!(outcome, ControlOutcome::Applied(RunStatus::Paused));
    let agent = ScriptedAgent::new(vec![done("did A"), pass()]);

    let err = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut stale)
        .unwrap_err();

    assert!(format!("{err:#}").contains("resume it first"));
    assert!(agent.requests().is_empty());
    assert_eq!(stale.status, RunStatus::Paused);
    assert_eq!(run.state().status, RunStatus::Paused);
}

/// Verifies a plan update that drops the rest of the current group still
/// ships the work already done.
#[test]
fn plan_update_dropping_the_group_tail_ships_done_work() {
    let run = TestRun::with_plan("goal", "- [ ] A\n- [ ] B\n", RunOptions::default());
    let paths = run.store.paths().clone();
    let agent = ScriptedAgent::new(vec![
        done("did A"),
        Ok(AgentOutput::done("B is no longer needed").with_plan("- [x] A\n")),
        pass(),
    ])
    .with_hook(move |request| {
        if request.label == "task-1" {
            MailboxStore::new(&paths)
                .send("drop B", "ana", Priority::Normal, BTreeMap::new())
                .expect("send");
        }
    });
    let host = FakeCodeHost::new();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["task-1", "plan-update-2", "verify-1"]);
    assert_eq!(host.created().len(), 1);
    assert_eq!(state.prs_merged, 1);
    assert!(!state.unshipped_work);
}

#[test]
fn plan_update_moving_on_to_a_new_group_ships_the_old_one_first() {
    let run = TestRun::with_plan("goal", "- [ ] A\n- [ ] B\n", RunOptions::default());
    let paths = run.store.paths().clone();
    let host = Arc::new(FakeCodeHost::new());
    let created_before_docs = Arc::new(Mutex::new(None));
    let (seen_host, seen) = (Arc::clone(&host), Arc::clone(&created_before_docs));
    let agent = ScriptedAgent::new(vec![
        done("did A"),
        Ok(AgentOutput::done("docs instead of B").with_plan("- [x] A\n\n### PR 2: Docs\n- [ ] Write docs\n")),
        done("docs"),
        pass(),
    ])
    .with_hook(move |request| match request.label.as_str() {
        "task-1" => {
            MailboxStore::new(&paths)
                .send("write docs instead of B", "ana", Priority::High, BTreeMap::new())
                .expect("send");
        }
        "task-2" => *seen.lock().expect("seen") = Some(seen_host.created().len()),
        _ => {}
    });
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), host.as_ref(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(*created_before_docs.lock().expect("created"), Some(1));
    assert_eq!(host.created().len(), 2);
}

/// Verifies retries of a failed session back off between attempts.
#[test]
fn session_retries_back_off() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let agent = ScriptedAgent::new(vec![
        Err(AgentError::Timeout { secs: 1800 }),
        Err(AgentError::Timeout { secs: 1800 }),
        done("did A"),
        pass(),
    ]);
    let mut config = test_config();
    config.agent.retry_backoff_base_ms = 20;
    config.agent.retry_backoff_max_ms = 100;
    let mut state = run.state();

    let started = Instant::now();
    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &FakeCodeHost::new(), &NullSink, config)
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["task-1", "task-1", "task-1", "verify-1"]);
    assert!(started.elapsed() >= Duration::from_millis(60));
}

/// Verifies a stop queued before the PR settles is applied while watching it.
#[test]
fn stop_is_applied_while_watching_the_pr() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let store = run.store.clone();
    let agent = ScriptedAgent::new(vec![done("did A"), pass()]).with_hook(move |request| {
        if request.label == "task-1" {
            control::stop(&store, None, false).expect("stop");
        }
    });
    let host = FakeCodeHost::new();
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Stopped);
    assert_eq!(host.created().len(), 1);
    assert!(host.merged().is_empty());
    assert_eq!(run.state().current_pr, Some(1));
}

#[test]
fn session_limit_holds_back_a_fix_round() {
    let options = RunOptions {
        max_sessions: Some(1),
        ..RunOptions::default()
    };
    let run = TestRun::with_plan("goal", "- [ ] A\n", options);
    let host = FakeCodeHost::new();
    host.push_status(open_status(ChecksState::Failed, ReviewDecision::None, vec![77]));
    host.set_run_jobs(77, vec![CiJob { id: 1, name: "test".into(), conclusion: Some("failure".into()) }]);
    host.set_job_log(1, "assertion failed\n");
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Paused);
    assert_eq!(agent.labels(), vec!["task-1"]);
    let saved = run.state();
    assert_eq!(saved.session_count, 1);
    assert_eq!(saved.current_pr, Some(1));
}

/// Verifies the PR limit is checked before anything is pushed.
#[test]
fn pr_limit_is_checked_before_opening() {
    let options = RunOptions {
        max_prs: Some(1),
        ..RunOptions::default()
    };
    let run = TestRun::with_plan("goal", "### PR 1: One\n- [ ] A\n\n### PR 2: Two\n- [ ] B\n", options);
    let host = FakeCodeHost::new();
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");
    assert_eq!(status, RunStatus::Paused);
    assert_eq!(host.created().len(), 1);

    let mut resumed = control::resume(&run.store, None, None).expect("resume");
    let agent = ScriptedAgent::new(vec![done("did B")]);
    let vcs = FakeVcs::default();
    let status = Orchestrator::new(&run.store, &agent, &vcs, &host, &NullSink, test_config())
        .run(&mut resumed)
        .expect("run again");

    assert_eq!(status, RunStatus::Paused);
    assert_eq!(agent.labels(), vec!["task-2"]);
    assert_eq!(host.created().len(), 1);
    assert!(!vcs.calls().iter().any(|c| c.starts_with("push")));
    assert!(run.state().last_error.is_none());
}

#[test]
fn rebase_conflicts_are_handed_to_the_agent() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let vcs = FakeVcs::default();
    vcs.script_rebases(vec![RebaseOutcome::Conflicts(vec!["src/lib.rs".into()]), RebaseOutcome::Clean]);
    let agent = ScriptedAgent::new(vec![done("did A"), done("kept both sides"), pass()]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &vcs, &FakeCodeHost::new(), &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["task-1", "rebase-1", "verify-1"]);
    assert!(agent.requests()[1].prompt.contains("- src/lib.rs"));
    let calls = vcs.calls();
    let resolved = calls.iter().position(|c| c == "rebase --continue").expect("continue");
    let pushed = calls.iter().position(|c| c == "push origin feature").expect("push");
    assert!(resolved < pushed);
}

/// Verifies requested changes get one fix round and the PR merges once
/// approved.
#[test]
fn requested_changes_are_fixed_before_merging() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let host = FakeCodeHost::new();
    host.push_status(open_status(ChecksState::Passed, ReviewDecision::ReviewRequired, vec![]));
    host.push_status(open_status(ChecksState::Passed, ReviewDecision::ChangesRequested, vec![]));
    host.set_comments(vec![ReviewComment {
        id: "c1".into(),
        author: "rev".into(),
        body: "rename this".into(),
        path: Some("src/a.rs".into()),
        line: Some(3),
    }]);
    let agent = ScriptedAgent::new(vec![done("did A"), done("renamed"), pass()]);
    let mut config = test_config();
    config.pr.require_approval = true;
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, config)
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["task-1", "pr-1-fix-1", "verify-1"]);
    assert!(agent.requests()[1].prompt.contains("rename this"));
    assert_eq!(host.merged().len(), 1);
}

#[test]
fn pr_merged_elsewhere_is_not_merged_again_on_resume() {
    let run = TestRun::with_plan("goal", "- [x] A\n", RunOptions::default());
    let mut saved = run.state();
    saved.current_pr = Some(7);
    saved.unshipped_work = true;
    run.store.save(&mut saved).expect("save");
    let host = FakeCodeHost::new();
    host.push_status(PrStatus {
        state: PrState::Merged,
        ..open_status(ChecksState::Passed, ReviewDecision::Approved, vec![])
    });
    let agent = ScriptedAgent::new(vec![pass()]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["verify-1"]);
    assert!(host.merged().is_empty());
    assert!(host.created().is_empty());
    assert_eq!(state.prs_merged, 1);
    assert_eq!(state.current_pr, None);
}

#[test]
fn pause_on_pr_then_resume_merges() {
    let options = RunOptions {
        pause_on_pr: true,
        ..RunOptions::default()
    };
    let run = TestRun::with_plan("goal", "- [ ] A\n", options);
    let host = FakeCodeHost::new();
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");
    assert_eq!(status, RunStatus::Paused);
    assert_eq!(run.state().current_pr, Some(1));
    assert!(host.merged().is_empty());

    let mut resumed = control::resume(&run.store, None, None).expect("resume");
    let agent = ScriptedAgent::new(vec![pass()]);
    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut resumed)
        .expect("run again");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(agent.labels(), vec!["verify-1"]);
    assert_eq!(host.created().len(), 1);
    assert_eq!(host.merged().len(), 1);
}

/// Verifies occasional status query failures are ridden out.
#[test]
fn transient_status_errors_are_tolerated() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let host = FakeCodeHost::new();
    host.push_status_error("502 bad gateway");
    host.push_status_error("502 bad gateway");
    let agent = ScriptedAgent::new(vec![done("did A"), pass()]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Success);
    assert_eq!(host.merged().len(), 1);
}

#[test]
fn repeated_status_errors_block_the_run() {
    let run = TestRun::with_plan("goal", "- [ ] A\n", RunOptions::default());
    let host = FakeCodeHost::new();
    for _ in 0..3 {
        host.push_status_error("502 bad gateway");
    }
    let agent = ScriptedAgent::new(vec![done("did A")]);
    let mut state = run.state();

    let status = Orchestrator::new(&run.store, &agent, &FakeVcs::default(), &host, &NullSink, test_config())
        .run(&mut state)
        .expect("run");

    assert_eq!(status, RunStatus::Blocked);
    let saved = run.state();
    assert_eq!(saved.current_pr, Some(1));
    assert!(saved.last_error.expect("last error").contains("query status of PR #1"));
}
