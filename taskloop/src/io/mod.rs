//! Side-effecting adapters: state files, locks, processes, git, the code host
//! and webhook delivery.

pub mod agent;
pub mod config;
pub mod fs;
pub mod git;
pub mod host;
pub mod mailbox;
pub mod pr_store;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod run_state;
pub mod state_store;
pub mod webhooks;
