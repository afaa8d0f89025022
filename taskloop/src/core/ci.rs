//! CI job selection and log chunking.

use serde::{Deserialize, Serialize};

/// One CI job as reported by the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiJob {
    pub id: u64,
    pub name: String,
    /// `None` while the job is still running.
    pub conclusion: Option<String>,
}

impl CiJob {
    /// Failed in a way worth showing the agent. Cancelled and skipped jobs
    /// are excluded.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("failure" | "timed_out" | "action_required")
        )
    }
}

/// Jobs whose logs should be fetched, in host order.
pub fn failed_jobs(jobs: &[CiJob]) -> Vec<&CiJob> {
    jobs.iter().filter(|job| job.is_failed()).collect()
}

/// Split `log` into pieces of at most `chunk_chars` characters.
///
/// Produces `ceil(N / chunk_chars)` chunks for a log of `N` characters and
/// never splits inside a UTF-8 code point. Joining the chunks in order yields
/// the original text.
pub fn chunk_log(log: &str, chunk_chars: usize) -> Vec<String> {
    let chunk_chars = chunk_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in log.chars() {
        current.push(ch);
        count += 1;
        if count == chunk_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Directory-safe form of a job name (`"build / test"` -> `"build___test"`).
pub fn job_dir_name(job_name: &str) -> String {
    let cleaned: String = job_name
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}
