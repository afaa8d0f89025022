//! Ctrl-C handling for `taskloop run`.
//!
//! The first interrupt raises a flag the orchestrator checks between agent
//! sessions and poll intervals, so the run pauses with state saved. A second
//! interrupt exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::exit_codes;

/// Spawn the signal listener and return the flag it raises.
pub fn install() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    let raised = Arc::clone(&flag);
    thread::Builder::new()
        .name("taskloop-signals".into())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        error!(err = %err, "failed to listen for ctrl-c");
                        return;
                    }
                    if raised.swap(true, Ordering::SeqCst) {
                        warn!("second interrupt, exiting without saving");
                        std::process::exit(exit_codes::INTERRUPTED);
                    }
                    warn!("interrupt received, pausing after the current step (ctrl-c again to force)");
                }
            });
        })
        .context("spawn signal thread")?;
    debug!("interrupt handler installed");
    Ok(flag)
}
