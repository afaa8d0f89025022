//! Git adapter.
//!
//! The PR lifecycle needs a handful of branch operations; [`Vcs`] is the seam
//! and [`Git`] the subprocess-backed implementation.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

/// Result of rebasing the working branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// Rebase stopped; these paths need resolution.
    Conflicts(Vec<String>),
}

/// Branch operations used while shipping a task group.
pub trait Vcs {
    fn current_branch(&self) -> Result<String>;
    fn fetch(&self, remote: &str, branch: &str) -> Result<()>;
    fn rebase_onto(&self, upstream: &str) -> Result<RebaseOutcome>;
    /// Continue a stopped rebase after conflicts were resolved.
    fn rebase_continue(&self) -> Result<RebaseOutcome>;
    fn rebase_abort(&self) -> Result<()>;
    fn push(&self, remote: &str, branch: &str) -> Result<()>;
    /// Stage and commit leftovers. Returns whether a commit was made.
    fn commit_all(&self, message: &str) -> Result<bool>;
}

/// [`Vcs`] backed by the `git` binary, run inside the target checkout.
#[derive(Debug, Clone)]
pub struct Git {
    repo: PathBuf,
}

impl Git {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .stdout(args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Run git and return stdout, failing on a non-zero exit.
    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.spawn(args)?;
        ensure_ok(args, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            // rebase --continue must not wait on an editor
            .env("GIT_EDITOR", "true")
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))
    }

    fn rebase(&self, args: &[&str]) -> Result<RebaseOutcome> {
        let output = self.spawn(args)?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }
        let conflicts = self.lines(&["diff", "--name-only", "--diff-filter=U"])?;
        if conflicts.is_empty() {
            ensure_ok(args, &output)?;
        }
        warn!(files = conflicts.len(), "rebase stopped on conflicts");
        Ok(RebaseOutcome::Conflicts(conflicts))
    }
}

fn ensure_ok(args: &[&str], output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!("git {} exited with {}: {}", args.join(" "), output.status, stderr.trim())
}

impl Vcs for Git {
    /// Refuses a detached HEAD: there is no branch to ship.
    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let branch = self.stdout(&["symbolic-ref", "--quiet", "--short", "HEAD"]).context("HEAD is detached")?;
        let branch = branch.trim();
        debug!(branch, "on branch");
        Ok(branch.to_string())
    }

    #[instrument(skip_all, fields(remote, branch))]
    fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.stdout(&["fetch", remote, branch]).map(drop)
    }

    #[instrument(skip_all, fields(upstream))]
    fn rebase_onto(&self, upstream: &str) -> Result<RebaseOutcome> {
        self.rebase(&["rebase", upstream])
    }

    fn rebase_continue(&self) -> Result<RebaseOutcome> {
        self.stdout(&["add", "--all"])?;
        self.rebase(&["rebase", "--continue"])
    }

    fn rebase_abort(&self) -> Result<()> {
        self.stdout(&["rebase", "--abort"]).map(drop)
    }

    #[instrument(skip_all, fields(remote, branch))]
    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.stdout(&["push", "--force-with-lease", "--set-upstream", remote, branch])
            .map(drop)
    }

    #[instrument(skip_all)]
    fn commit_all(&self, message: &str) -> Result<bool> {
        self.stdout(&["add", "--all"])?;
        if self.lines(&["diff", "--cached", "--name-only"])?.is_empty() {
            debug!("worktree clean, nothing to commit");
            return Ok(false);
        }
        self.stdout(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }
}
