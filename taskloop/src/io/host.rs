//! Code-host adapter (pull requests, checks, CI logs, reviews).
//!
//! [`CodeHost`] is the seam; [`GhCli`] drives the GitHub CLI.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::ci::CiJob;
use crate::io::config::MergeMethod;
use crate::io::process::run_command_with_timeout;

static RUN_JOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/actions/runs/(\d+)(?:/job/(\d+))?").expect("run url regex"));

const GH_TIMEOUT: Duration = Duration::from_secs(120);
const GH_OUTPUT_LIMIT: usize = 50_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksState {
    Pending,
    Passed,
    Failed,
    /// Repository has no checks configured for this PR.
    NoChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub state: PrState,
    pub checks: ChecksState,
    pub review: ReviewDecision,
    /// Workflow runs containing failed checks, in rollup order.
    pub failed_run_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
}

/// Operations on the remote code host.
pub trait CodeHost {
    fn find_open_pr(&self, branch: &str) -> Result<Option<PrRef>>;
    fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PrRef>;
    fn pr_status(&self, pr: u64) -> Result<PrStatus>;
    /// Every job of a workflow run, including successful and cancelled ones.
    fn run_jobs(&self, run_id: u64) -> Result<Vec<CiJob>>;
    fn job_log(&self, job_id: u64) -> Result<String>;
    fn review_comments(&self, pr: u64) -> Result<Vec<ReviewComment>>;
    fn merge(&self, pr: u64, method: MergeMethod) -> Result<()>;
}

/// GitHub CLI (`gh`) backed host.
#[derive(Debug, Clone)]
pub struct GhCli {
    workdir: PathBuf,
    repo: Option<String>,
}

impl GhCli {
    pub fn new(workdir: impl Into<PathBuf>, repo: Option<String>) -> Self {
        Self {
            workdir: workdir.into(),
            repo,
        }
    }

    fn repo(&self) -> Result<String> {
        if let Some(repo) = &self.repo {
            return Ok(repo.clone());
        }
        let out = self.gh(&["repo", "view", "--json", "nameWithOwner", "-q", ".nameWithOwner"])?;
        let repo = out.trim().to_string();
        if repo.is_empty() {
            return Err(anyhow!("could not detect repository (set pr.repo)"));
        }
        Ok(repo)
    }

    fn gh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, GH_TIMEOUT, GH_OUTPUT_LIMIT)
            .with_context(|| format!("run gh {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!("gh {} timed out", args.join(" ")));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output.stdout_text())
    }

    fn gh_json(&self, args: &[&str]) -> Result<Value> {
        let out = self.gh(args)?;
        serde_json::from_str(&out).with_context(|| format!("parse gh {} output", args.join(" ")))
    }
}

impl CodeHost for GhCli {
    fn find_open_pr(&self, branch: &str) -> Result<Option<PrRef>> {
        let value = self.gh_json(&[
            "pr", "list", "--head", branch, "--state", "open", "--json", "number,url",
        ])?;
        Ok(value.as_array().and_then(|prs| prs.first()).and_then(|pr| {
            Some(PrRef {
                number: pr.get("number")?.as_u64()?,
                url: pr.get("url")?.as_str()?.to_string(),
            })
        }))
    }

    #[instrument(skip_all, fields(branch, base))]
    fn create_pr(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PrRef> {
        let out = self.gh(&[
            "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
        ])?;
        let url = out
            .lines()
            .map(str::trim)
            .rfind(|l| l.starts_with("http"))
            .ok_or_else(|| anyhow!("gh pr create printed no PR url"))?
            .to_string();
        let number = parse_pr_number(&url)?;
        debug!(number, url = %url, "pull request created");
        Ok(PrRef { number, url })
    }

    fn pr_status(&self, pr: u64) -> Result<PrStatus> {
        let number = pr.to_string();
        let value = self.gh_json(&[
            "pr",
            "view",
            &number,
            "--json",
            "state,statusCheckRollup,reviewDecision",
        ])?;
        parse_pr_status(&value)
    }

    fn run_jobs(&self, run_id: u64) -> Result<Vec<CiJob>> {
        let repo = self.repo()?;
        let value = self.gh_json(&[
            "api",
            &format!("repos/{repo}/actions/runs/{run_id}/jobs?per_page=100"),
        ])?;
        parse_jobs(&value)
    }

    fn job_log(&self, job_id: u64) -> Result<String> {
        let repo = self.repo()?;
        let log = self.gh(&["api", &format!("repos/{repo}/actions/jobs/{job_id}/logs")])?;
        if log.trim().is_empty() {
            return Err(anyhow!("empty log for job {job_id}"));
        }
        Ok(log)
    }

    fn review_comments(&self, pr: u64) -> Result<Vec<ReviewComment>> {
        let repo = self.repo()?;
        let inline = self.gh_json(&["api", &format!("repos/{repo}/pulls/{pr}/comments")])?;
        let reviews = self.gh_json(&["api", &format!("repos/{repo}/pulls/{pr}/reviews")])?;
        Ok(parse_review_comments(&inline, &reviews))
    }

    #[instrument(skip_all, fields(pr))]
    fn merge(&self, pr: u64, method: MergeMethod) -> Result<()> {
        let number = pr.to_string();
        self.gh(&["pr", "merge", &number, method.as_flag()])?;
        Ok(())
    }
}

pub fn parse_pr_number(url: &str) -> Result<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("cannot parse PR number from '{url}'"))
}

/// Fold `gh pr view --json state,statusCheckRollup,reviewDecision`.
pub fn parse_pr_status(value: &Value) -> Result<PrStatus> {
    let state = match value.get("state").and_then(Value::as_str) {
        Some("MERGED") => PrState::Merged,
        Some("CLOSED") => PrState::Closed,
        Some("OPEN") => PrState::Open,
        other => return Err(anyhow!("unexpected PR state {other:?}")),
    };
    let review = match value.get("reviewDecision").and_then(Value::as_str) {
        Some("APPROVED") => ReviewDecision::Approved,
        Some("CHANGES_REQUESTED") => ReviewDecision::ChangesRequested,
        Some("REVIEW_REQUIRED") => ReviewDecision::ReviewRequired,
        _ => ReviewDecision::None,
    };

    let checks_raw = value
        .get("statusCheckRollup")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut failed = false;
    let mut pending = false;
    let mut failed_run_ids = Vec::new();
    for check in &checks_raw {
        let conclusion = check
            .get("conclusion")
            .and_then(Value::as_str)
            .or_else(|| check.get("state").and_then(Value::as_str))
            .unwrap_or("");
        let status = check.get("status").and_then(Value::as_str).unwrap_or("COMPLETED");
        match conclusion {
            "FAILURE" | "TIMED_OUT" | "ACTION_REQUIRED" | "ERROR" | "STARTUP_FAILURE" => {
                failed = true;
                if let Some(run_id) = check
                    .get("detailsUrl")
                    .or_else(|| check.get("targetUrl"))
                    .and_then(Value::as_str)
                    .and_then(|url| RUN_JOB_RE.captures(url))
                    .and_then(|caps| caps[1].parse::<u64>().ok())
                    && !failed_run_ids.contains(&run_id)
                {
                    failed_run_ids.push(run_id);
                }
            }
            "PENDING" | "EXPECTED" => pending = true,
            _ if status != "COMPLETED" => pending = true,
            _ => {}
        }
    }
    let checks = if failed {
        ChecksState::Failed
    } else if pending {
        ChecksState::Pending
    } else if checks_raw.is_empty() {
        ChecksState::NoChecks
    } else {
        ChecksState::Passed
    };
    Ok(PrStatus {
        state,
        checks,
        review,
        failed_run_ids,
    })
}

/// Parse `actions/runs/{id}/jobs`.
pub fn parse_jobs(value: &Value) -> Result<Vec<CiJob>> {
    let jobs = value
        .get("jobs")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("jobs response missing 'jobs' array"))?;
    jobs.iter()
        .map(|job| {
            Ok(CiJob {
                id: job
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow!("job missing id"))?,
                name: job
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("job")
                    .to_string(),
                conclusion: job
                    .get("conclusion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Inline comments plus review bodies that asked for something.
pub fn parse_review_comments(inline: &Value, reviews: &Value) -> Vec<ReviewComment> {
    let login = |v: &Value| {
        v.get("user")
            .and_then(|u| u.get("login"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    let mut out = Vec::new();
    for review in reviews.as_array().into_iter().flatten() {
        let body = review.get("body").and_then(Value::as_str).unwrap_or("").trim();
        let state = review.get("state").and_then(Value::as_str).unwrap_or("");
        if body.is_empty() || state == "APPROVED" || state == "DISMISSED" {
            continue;
        }
        out.push(ReviewComment {
            id: format!("review-{}", review.get("id").and_then(Value::as_u64).unwrap_or(0)),
            author: login(review),
            body: body.to_string(),
            path: None,
            line: None,
        });
    }
    for comment in inline.as_array().into_iter().flatten() {
        let body = comment.get("body").and_then(Value::as_str).unwrap_or("").trim();
        if body.is_empty() {
            continue;
        }
        out.push(ReviewComment {
            id: format!("comment-{}", comment.get("id").and_then(Value::as_u64).unwrap_or(0)),
            author: login(comment),
            body: body.to_string(),
            path: comment.get("path").and_then(Value::as_str).map(str::to_string),
            line: comment
                .get("line")
                .or_else(|| comment.get("original_line"))
                .and_then(Value::as_u64),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_rollup_collects_run_ids() {
        let value = json!({
            "state": "OPEN",
            "reviewDecision": "",
            "statusCheckRollup": [
                {"__typename": "CheckRun", "name": "lint", "status": "COMPLETED", "conclusion": "FAILURE",
                 "detailsUrl": "https://github.com/acme/w/actions/runs/111/job/1"},
                {"__typename": "CheckRun", "name": "test", "status": "COMPLETED", "conclusion": "FAILURE",
                 "detailsUrl": "https://github.com/acme/w/actions/runs/111/job/2"},
                {"__typename": "CheckRun", "name": "deploy", "status": "COMPLETED", "conclusion": "CANCELLED",
                 "detailsUrl": "https://github.com/acme/w/actions/runs/111/job/3"}
            ]
        });
        let status = parse_pr_status(&value).expect("parse");
        assert_eq!(status.checks, ChecksState::Failed);
        assert_eq!(status.failed_run_ids, vec![111]);
        assert_eq!(status.review, ReviewDecision::None);
    }

    #[test]
    fn in_progress_checks_are_pending() {
        let value = json!({
            "state": "OPEN",
            "reviewDecision": "APPROVED",
            "statusCheckRollup": [
                {"name": "lint", "status": "COMPLETED", "conclusion": "SUCCESS"},
                {"name": "test", "status": "IN_PROGRESS", "conclusion": ""}
            ]
        });
        let status = parse_pr_status(&value).expect("parse");
        assert_eq!(status.checks, ChecksState::Pending);
        assert_eq!(status.review, ReviewDecision::Approved);
    }

    #[test]
    fn merged_pr_without_checks() {
        let value = json!({"state": "MERGED", "statusCheckRollup": []});
        let status = parse_pr_status(&value).expect("parse");
        assert_eq!(status.state, PrState::Merged);
        assert_eq!(status.checks, ChecksState::NoChecks);
    }

    #[test]
    fn parses_jobs_and_pr_urls() {
        let jobs = parse_jobs(&json!({"jobs": [
            {"id": 9, "name": "build / test", "conclusion": "failure"},
            {"id": 10, "name": "docs", "conclusion": null}
        ]}))
        .expect("jobs");
        assert_eq!(jobs[0].name, "build / test");
        assert_eq!(jobs[1].conclusion, None);
        assert_eq!(
            parse_pr_number("https://github.com/acme/w/pull/42").expect("number"),
            42
        );
    }

    #[test]
    fn review_comments_skip_approvals_and_empty_bodies() {
        let reviews = json!([
            {"id": 1, "state": "APPROVED", "body": "lgtm", "user": {"login": "a"}},
            {"id": 2, "state": "CHANGES_REQUESTED", "body": "Please rename", "user": {"login": "b"}}
        ]);
        let inline = json!([
            {"id": 3, "body": "typo here", "path": "src/lib.rs", "line": 12, "user": {"login": "c"}},
            {"id": 4, "body": "  ", "user": {"login": "d"}}
        ]);
        let comments = parse_review_comments(&inline, &reviews);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "b");
        assert_eq!(comments[1].path.as_deref(), Some("src/lib.rs"));
        assert_eq!(comments[1].line, Some(12));
    }
}
