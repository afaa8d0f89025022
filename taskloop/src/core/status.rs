//! Run status and workflow stage state machines.
//!
//! Both enums carry an explicit transition table. Every status or stage change
//! goes through [`RunStatus::transition`] / [`WorkflowStage::advance`], so an
//! illegal edge surfaces as a [`TransitionError`] instead of silently
//! corrupting persisted state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Planning,
    Working,
    Blocked,
    Paused,
    Stopped,
    Success,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Planning,
        RunStatus::Working,
        RunStatus::Blocked,
        RunStatus::Paused,
        RunStatus::Stopped,
        RunStatus::Success,
        RunStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Planning => "planning",
            RunStatus::Working => "working",
            RunStatus::Blocked => "blocked",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    /// Statuses reachable from `self` in one step.
    pub fn allowed_next(self) -> &'static [RunStatus] {
        match self {
            RunStatus::Planning => &[
                RunStatus::Working,
                RunStatus::Paused,
                RunStatus::Stopped,
                RunStatus::Failed,
            ],
            RunStatus::Working => &[
                RunStatus::Blocked,
                RunStatus::Paused,
                RunStatus::Stopped,
                RunStatus::Success,
                RunStatus::Failed,
            ],
            RunStatus::Blocked | RunStatus::Paused => &[
                RunStatus::Working,
                RunStatus::Stopped,
                RunStatus::Failed,
            ],
            RunStatus::Stopped | RunStatus::Success | RunStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        self == next || self.allowed_next().contains(&next)
    }

    /// Validate `self -> next`. Staying in the same status is always allowed.
    pub fn transition(self, next: RunStatus) -> Result<RunStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Status {
                from: self,
                to: next,
            })
        }
    }

    /// Terminal for the run id: no edge leaves these statuses.
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Statuses an explicit resume command may move back to `working`.
    pub fn is_resumable(self) -> bool {
        matches!(self, RunStatus::Blocked | RunStatus::Paused)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PR progress while a run is `working`. Also used as the stage of a single
/// PR context, where `Merged` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Working,
    PrCreated,
    WaitingCi,
    CiFailed,
    WaitingReviews,
    AddressingReviews,
    ReadyToMerge,
    Merged,
}

impl WorkflowStage {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::Working => "working",
            WorkflowStage::PrCreated => "pr_created",
            WorkflowStage::WaitingCi => "waiting_ci",
            WorkflowStage::CiFailed => "ci_failed",
            WorkflowStage::WaitingReviews => "waiting_reviews",
            WorkflowStage::AddressingReviews => "addressing_reviews",
            WorkflowStage::ReadyToMerge => "ready_to_merge",
            WorkflowStage::Merged => "merged",
        }
    }

    pub fn allowed_next(self) -> &'static [WorkflowStage] {
        match self {
            WorkflowStage::Working => &[WorkflowStage::PrCreated],
            WorkflowStage::PrCreated => &[WorkflowStage::WaitingCi],
            WorkflowStage::WaitingCi => &[
                WorkflowStage::CiFailed,
                WorkflowStage::WaitingReviews,
                WorkflowStage::ReadyToMerge,
            ],
            WorkflowStage::CiFailed => &[WorkflowStage::WaitingCi],
            WorkflowStage::WaitingReviews => &[
                WorkflowStage::AddressingReviews,
                WorkflowStage::ReadyToMerge,
            ],
            WorkflowStage::AddressingReviews => &[WorkflowStage::WaitingCi],
            WorkflowStage::ReadyToMerge => &[WorkflowStage::Merged],
            WorkflowStage::Merged => &[WorkflowStage::Working],
        }
    }

    pub fn advance(self, next: WorkflowStage) -> Result<WorkflowStage, TransitionError> {
        if self == next || self.allowed_next().contains(&next) {
            Ok(next)
        } else {
            Err(TransitionError::Stage {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status or stage edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid status transition {from} -> {to}")]
    Status { from: RunStatus, to: RunStatus },
    #[error("invalid workflow stage transition {from} -> {to}")]
    Stage {
        from: WorkflowStage,
        to: WorkflowStage,
    },
    #[error("pr #{pr} already merged; cannot move to {to}")]
    PrMerged { pr: u64, to: WorkflowStage },
}
