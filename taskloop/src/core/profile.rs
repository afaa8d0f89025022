//! `(phase, complexity) -> tool profile` resolution.
//!
//! Resolved once per agent invocation. The table itself is plain data so it
//! can be overridden from `config.toml`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::plan::Complexity;

/// What the agent is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Working,
    Verification,
    PlanUpdate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Working => "working",
            Phase::Verification => "verification",
            Phase::PlanUpdate => "plan_update",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tools and model handed to one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolProfile {
    pub phase: Phase,
    pub tools: Vec<String>,
    pub model: String,
}

/// Per-phase tool lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTools {
    pub planning: Vec<String>,
    pub working: Vec<String>,
    /// Read/verify-only; never includes editing tools.
    pub verification: Vec<String>,
    pub plan_update: Vec<String>,
}

impl Default for PhaseTools {
    fn default() -> Self {
        let read_only = ["Read", "Glob", "Grep", "Bash"];
        Self {
            planning: strings(&["Read", "Glob", "Grep", "Bash"]),
            working: strings(&[
                "Read",
                "Write",
                "Edit",
                "Bash",
                "Glob",
                "Grep",
                "TodoWrite",
            ]),
            verification: strings(&read_only),
            plan_update: strings(&["Read", "Glob", "Grep"]),
        }
    }
}

/// Per-complexity model names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityModels {
    pub quick: String,
    pub general: String,
    pub coding: String,
    pub debugging_qa: String,
}

impl Default for ComplexityModels {
    fn default() -> Self {
        Self {
            quick: "haiku".to_string(),
            general: "sonnet".to_string(),
            coding: "opus".to_string(),
            debugging_qa: "sonnet_1m".to_string(),
        }
    }
}

impl ComplexityModels {
    pub fn for_complexity(&self, complexity: Complexity) -> &str {
        match complexity {
            Complexity::Quick => &self.quick,
            Complexity::General => &self.general,
            Complexity::Coding => &self.coding,
            Complexity::DebuggingQa => &self.debugging_qa,
        }
    }
}

/// Lookup table from `(phase, complexity)` to a [`ToolProfile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTable {
    pub tools: PhaseTools,
    pub models: ComplexityModels,
}

impl ProfileTable {
    /// Planning and plan updates always run on the coding model; the other
    /// phases follow the task's complexity.
    pub fn resolve(&self, phase: Phase, complexity: Complexity) -> ToolProfile {
        let (tools, model) = match phase {
            Phase::Planning => (&self.tools.planning, self.models.coding.as_str()),
            Phase::PlanUpdate => (&self.tools.plan_update, self.models.coding.as_str()),
            Phase::Working => (
                &self.tools.working,
                self.models.for_complexity(complexity),
            ),
            Phase::Verification => (
                &self.tools.verification,
                self.models.for_complexity(complexity),
            ),
        };
        ToolProfile {
            phase,
            tools: tools.clone(),
            model: model.to_string(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_profile_follows_complexity() {
        let table = ProfileTable::default();
        assert_eq!(table.resolve(Phase::Working, Complexity::Quick).model, "haiku");
        assert_eq!(table.resolve(Phase::Working, Complexity::General).model, "sonnet");
        assert_eq!(table.resolve(Phase::Working, Complexity::Coding).model, "opus");
        assert_eq!(
            table.resolve(Phase::Working, Complexity::DebuggingQa).model,
            "sonnet_1m"
        );
    }

    #[test]
    fn planning_ignores_complexity() {
        let table = ProfileTable::default();
        let profile = table.resolve(Phase::Planning, Complexity::Quick);
        assert_eq!(profile.model, "opus");
        assert_eq!(profile.phase, Phase::Planning);
    }

    #[test]
    fn verification_profile_cannot_edit() {
        let profile = ProfileTable::default().resolve(Phase::Verification, Complexity::Coding);
        assert!(!profile.tools.iter().any(|t| t == "Write" || t == "Edit"));
    }
}
