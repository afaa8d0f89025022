//! Per-PR artifacts under `pr-{n}/`.
//!
//! CI logs of failed jobs are split into numbered chunk files
//! (`ci/{job}/1.log`, `2.log`, ...) and review comments are written to
//! `comments/`. The fix prompt points the agent at these files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::ci::job_dir_name;
use crate::io::fs::{write_atomic, write_json};
use crate::io::host::ReviewComment;
use crate::io::state_store::StatePaths;

/// Chunk files written for one failed CI job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobChunks {
    pub name: String,
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PrArtifacts {
    dir: PathBuf,
}

impl PrArtifacts {
    pub fn new(paths: &StatePaths, pr: u64) -> Self {
        Self {
            dir: paths.pr_dir(pr),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ci_dir(&self) -> PathBuf {
        self.dir.join("ci")
    }

    pub fn comments_dir(&self) -> PathBuf {
        self.dir.join("comments")
    }

    /// Remove chunks left by an earlier failure round.
    pub fn reset_ci(&self) -> Result<()> {
        let dir = self.ci_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        Ok(())
    }

    /// Write pre-split `chunks` of one job's log as `1.log`, `2.log`, ...
    pub fn write_job_chunks(&self, job_name: &str, chunks: &[String]) -> Result<JobChunks> {
        let dir = self.ci_dir().join(job_dir_name(job_name));
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_atomic(&dir.join(".jobname"), job_name)?;

        let mut paths = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let path = dir.join(format!("{}.log", i + 1));
            write_atomic(&path, chunk)?;
            paths.push(path.display().to_string());
        }
        debug!(job = job_name, chunks = paths.len(), dir = %dir.display(), "wrote ci log chunks");
        Ok(JobChunks {
            name: job_name.to_string(),
            chunks: paths,
        })
    }

    /// Write `comments.json` and a readable `comments.md`.
    pub fn write_comments(&self, comments: &[ReviewComment]) -> Result<Option<PathBuf>> {
        if comments.is_empty() {
            return Ok(None);
        }
        let dir = self.comments_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_json(&dir.join("comments.json"), &comments)?;

        let mut md = String::from("# Review comments\n");
        for c in comments {
            md.push_str(&format!("\n## {}", c.author));
            if let Some(path) = &c.path {
                md.push_str(&format!(" on `{path}"));
                if let Some(line) = c.line {
                    md.push_str(&format!(":{line}"));
                }
                md.push('`');
            }
            md.push_str(&format!("\n\n{}\n", c.body.trim()));
        }
        let md_path = dir.join("comments.md");
        write_atomic(&md_path, &md)?;
        Ok(Some(md_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ci::chunk_log;

    #[test]
    fn job_log_chunks_concatenate_to_original() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = PrArtifacts::new(&StatePaths::new(temp.path()), 7);
        let log = "line one\nline two\nline three\n";
        let chunks = artifacts
            .write_job_chunks("build / test", &chunk_log(log, 10))
            .expect("write chunks");
        assert_eq!(chunks.chunks.len(), 3);
        let joined: String = chunks
            .chunks
            .iter()
            .map(|p| fs::read_to_string(p).expect("read chunk"))
            .collect();
        assert_eq!(joined, log);
        assert!(chunks.chunks[0].ends_with("pr-7/ci/build___test/1.log"));
        let name = fs::read_to_string(temp.path().join("pr-7/ci/build___test/.jobname")).expect("jobname");
        assert_eq!(name, "build / test");
    }

    #[test]
    fn comments_written_only_when_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = PrArtifacts::new(&StatePaths::new(temp.path()), 2);
        assert!(artifacts.write_comments(&[]).expect("write").is_none());
        let path = artifacts
            .write_comments(&[ReviewComment {
                id: "1".into(),
                author: "ana".into(),
                body: "Please add a test".into(),
                path: Some("src/lib.rs".into()),
                line: Some(12),
            }])
            .expect("write")
            .expect("path");
        let md = fs::read_to_string(path).expect("read");
        assert!(md.contains("## ana on `src/lib.rs:12`"));
        assert!(temp.path().join("pr-2/comments/comments.json").exists());
    }

    #[test]
    fn reset_removes_previous_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = PrArtifacts::new(&StatePaths::new(temp.path()), 1);
        artifacts
            .write_job_chunks("lint", &["oops".to_string()])
            .expect("write");
        artifacts.reset_ci().expect("reset");
        assert!(!artifacts.ci_dir().exists());
    }
}
