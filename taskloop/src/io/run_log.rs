//! Product log for one run (`logs/run-{run_id}.log`).
//!
//! Unlike tracing diagnostics this file is always written, regardless of
//! `RUST_LOG` or the run's `log_level`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

use crate::io::state_store::StatePaths;

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(paths: &StatePaths, run_id: &str) -> Self {
        Self {
            path: paths.run_log(run_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let line = format!("{} {}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), message.trim_end());
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    /// Like [`RunLog::append`], but a failed write only warns.
    pub fn record(&self, message: &str) {
        if let Err(err) = self.append(message) {
            warn!(err = %err, path = %self.path.display(), "failed to write run log");
        }
    }
}
