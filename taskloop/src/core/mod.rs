//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agent_error;
pub mod budget;
pub mod ci;
pub mod events;
pub mod merge;
pub mod plan;
pub mod profile;
pub mod signature;
pub mod status;
