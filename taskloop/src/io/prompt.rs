//! Prompt rendering for every agent phase.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go first
//! (in [`DROP_ORDER`]), then the last section is truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::io::host::ReviewComment;
use crate::io::pr_store::JobChunks;
use crate::io::run_state::RunState;

const PLANNING_TEMPLATE: &str = include_str!("prompts/planning.md");
const WORK_TEMPLATE: &str = include_str!("prompts/work.md");
const VERIFICATION_TEMPLATE: &str = include_str!("prompts/verification.md");
const PLAN_UPDATE_TEMPLATE: &str = include_str!("prompts/plan_update.md");
const PR_FIX_TEMPLATE: &str = include_str!("prompts/pr_fix.md");

/// Default prompt budget in bytes.
pub const DEFAULT_BUDGET_BYTES: usize = 200_000;

const DROP_ORDER: [&str; 5] = ["context", "plan", "criteria", "goal", "comments"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    number: usize,
    description: String,
    files: Vec<String>,
}

/// Everything a PR fix session needs.
#[derive(Debug, Clone, Default)]
pub struct FixInputs<'a> {
    /// `None` while resolving conflicts before the PR exists.
    pub pr: Option<u64>,
    pub goal: &'a str,
    pub target_branch: &'a str,
    pub conflicts: &'a [String],
    pub ci_jobs: &'a [JobChunks],
    pub comments: &'a [ReviewComment],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders phase prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_BYTES)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        for (name, source) in [
            ("planning", PLANNING_TEMPLATE),
            ("work", WORK_TEMPLATE),
            ("verification", VERIFICATION_TEMPLATE),
            ("plan_update", PLAN_UPDATE_TEMPLATE),
            ("pr_fix", PR_FIX_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn planning(&self, goal: &str, notes: &str) -> Result<String> {
        let rendered = self.env.get_template("planning")?.render(context! {
            goal => goal.trim(),
            context => non_empty(notes),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn work(&self, state: &RunState, index: usize, notes: &str) -> Result<String> {
        let task = state
            .plan
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no task at index {index}"))?;
        let task_ctx = TaskContext {
            number: index + 1,
            description: task.description.clone(),
            files: task.file_references.clone(),
        };
        let rendered = self.env.get_template("work")?.render(context! {
            task => task_ctx,
            total => state.plan.len(),
            group => task.group.as_deref(),
            goal => state.goal.trim(),
            criteria => non_empty(&state.criteria),
            plan => state.plan.render(),
            context => non_empty(notes),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn verification(&self, state: &RunState) -> Result<String> {
        let criteria = if state.criteria.trim().is_empty() {
            "The goal is fully implemented and the project's checks pass."
        } else {
            state.criteria.trim()
        };
        let rendered = self.env.get_template("verification")?.render(context! {
            criteria => criteria,
            goal => state.goal.trim(),
            plan => state.plan.render(),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn plan_update(&self, state: &RunState, requests: &str) -> Result<String> {
        let rendered = self.env.get_template("plan_update")?.render(context! {
            requests => requests,
            plan => state.plan.render(),
            goal => state.goal.trim(),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn pr_fix(&self, input: &FixInputs<'_>) -> Result<String> {
        let rendered = self.env.get_template("pr_fix")?.render(context! {
            pr => input.pr,
            goal => input.goal.trim(),
            target_branch => input.target_branch,
            conflicts => input.conflicts,
            ci_jobs => input.ci_jobs,
            comments => input.comments,
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|s| !s.is_empty())
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let marks: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in marks.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = marks
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    if total(sections) <= budget {
        return;
    }
    for key in DROP_ORDER {
        if total(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped section for budget");
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let keep = last.content.len().saturating_sub(over + 12);
        let mut cut = keep;
        while cut > 0 && !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        debug!(section = %last.key, before = last.content.len(), after = cut, "truncated section for budget");
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
    }
}
