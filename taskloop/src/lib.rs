//! Unattended work loop for a coding agent.
//!
//! A run turns a goal into a checkbox plan, executes one task per agent
//! session, ships finished task groups as pull requests, and verifies the
//! result against success criteria. Operators steer it through a mailbox of
//! change requests and queued control commands; webhooks report progress.
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, transition
//!   tables, message merging, CI log chunking, signatures). No I/O.
//! - **[`io`]**: Side-effecting operations (state dir, agent process, git,
//!   code host, webhook delivery). Traits at each seam allow scripted doubles.
//!
//! [`orchestrator`] and [`pr_lifecycle`] drive a run; [`control`] implements
//! the operator commands against a state dir.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod plan_updater;
pub mod pr_lifecycle;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
