//! Plan regeneration from merged change requests.
//!
//! The orchestrator owns the agent session; this module builds the request and
//! splices the returned plan onto the running one, keeping the completed
//! prefix intact.

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::core::plan::{Complexity, Plan, PlanSplice, splice_regenerated};
use crate::core::profile::{Phase, ProfileTable};
use crate::io::agent::{AgentOutput, AgentRequest, AgentStatus};
use crate::io::prompt::PromptBuilder;
use crate::io::run_state::RunState;

/// Agent request asking for a revised plan that honors `change_request`.
pub fn build_request(
    state: &RunState,
    change_request: &str,
    prompts: &PromptBuilder,
    profiles: &ProfileTable,
) -> Result<AgentRequest> {
    Ok(AgentRequest {
        profile: profiles.resolve(Phase::PlanUpdate, Complexity::Coding),
        prompt: prompts.plan_update(state, change_request)?,
        label: format!("plan-update-{}", state.session_count + 1),
    })
}

/// Splice the plan in `output` onto `state`. The task index moves to the
/// first pending task; criteria are replaced when the agent returns new ones.
pub fn apply_update(state: &mut RunState, output: &AgentOutput) -> Result<PlanSplice> {
    if output.status == AgentStatus::Blocked {
        bail!("plan update blocked: {}", output.summary);
    }
    let Some(markdown) = output.plan.as_deref() else {
        bail!("plan update returned no plan");
    };
    let regenerated = Plan::parse(markdown);
    debug!(tasks = regenerated.len(), "parsed regenerated plan");

    let splice = splice_regenerated(&state.plan, &regenerated);
    state.plan = splice.plan.clone();
    state.current_task_index = splice.next_index;
    if let Some(criteria) = output.criteria.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        state.criteria = criteria.to_string();
    }
    info!(
        added = splice.added,
        removed = splice.removed,
        next_index = splice.next_index,
        "plan updated from change requests"
    );
    Ok(splice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Task;
    use crate::io::run_state::RunOptions;

    fn running_state() -> RunState {
        let mut state = RunState::new("20250101-000000", "Build the API", RunOptions::default());
        state.plan = Plan::new(vec![
            Task::new("Scaffold server").completed(),
            Task::new("Add users endpoint"),
            Task::new("Add orders endpoint"),
        ]);
        state.current_task_index = 1;
        state
    }

    /// Verifies the completed prefix survives a regeneration that drops it.
    #[test]
    fn regenerated_plan_keeps_completed_prefix() {
        let mut state = running_state();
        let output = AgentOutput::done("replanned").with_plan(
            "- [ ] Add users endpoint with pagination\n- [ ] `[quick]` Add orders endpoint\n",
        );
        let splice = apply_update(&mut state, &output).expect("apply");

        assert_eq!(state.current_task_index, 1);
        assert!(state.plan.tasks[0].completed);
        assert_eq!(state.plan.tasks[0].description, "Scaffold server");
        assert_eq!(state.plan.len(), 3);
        assert_eq!(state.plan.tasks[2].complexity, Complexity::Quick);
        assert_eq!(splice.added, 1);
        assert_eq!(splice.removed, 1);
    }

    #[test]
    fn missing_plan_is_an_error() {
        let mut state = running_state();
        let before = state.plan.clone();
        assert!(apply_update(&mut state, &AgentOutput::done("nothing")).is_err());
        assert!(apply_update(&mut state, &AgentOutput::blocked("unclear").with_plan("- [ ] x")).is_err());
        assert_eq!(state.plan, before);
    }

    #[test]
    fn request_uses_plan_update_profile() {
        let state = running_state();
        let request = build_request(
            &state,
            "Also add rate limiting",
            &PromptBuilder::default(),
            &ProfileTable::default(),
        )
        .expect("request");
        assert_eq!(request.phase(), Phase::PlanUpdate);
        assert!(request.prompt.contains("Also add rate limiting"));
        assert!(request.prompt.contains("Scaffold server"));
    }
}
