//! Task plan model and its checkbox-markdown encoding.
//!
//! Plan format:
//!
//! ```text
//! ### PR 1: Schema changes
//!
//! - [x] `[quick]` Add column
//!   - src/schema.rs
//! - [ ] `[coding]` Backfill data
//! ```
//!
//! Task order in the document is execution order. Tasks before the first
//! group header belong to an implicit unnamed group; an `### Ungrouped`
//! header returns to it after a named group.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*\[([ xX])\]\s*(.+)$").expect("task regex"));
static COMPLEXITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)`\[(coding|quick|general|debugging-qa)\]`\s*").expect("complexity regex")
});
static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#{2,4}\s*(?:PR|Group)\s+\d+\s*:\s*(.+)$").expect("group regex")
});
const UNGROUPED_HEADER: &str = "Ungrouped";
static UNGROUPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{2,4}\s*ungrouped\s*$").expect("ungrouped regex"));

/// Complexity tag driving agent profile selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Quick,
    General,
    #[default]
    Coding,
    DebuggingQa,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Quick => "quick",
            Complexity::General => "general",
            Complexity::Coding => "coding",
            Complexity::DebuggingQa => "debugging-qa",
        }
    }

    fn parse_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "quick" => Some(Complexity::Quick),
            "general" => Some(Complexity::General),
            "coding" => Some(Complexity::Coding),
            "debugging-qa" => Some(Complexity::DebuggingQa),
            _ => None,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub completed: bool,
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_references: Vec<String>,
    /// Name of the PR group this task ships with (`None` = implicit group).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            completed: false,
            complexity: Complexity::default(),
            file_references: Vec::new(),
            group: None,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// Ordered task list. Index = execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.completed).count()
    }

    /// Length of the leading run of completed tasks.
    pub fn completed_prefix_len(&self) -> usize {
        self.tasks.iter().take_while(|t| t.completed).count()
    }

    pub fn mark_completed(&mut self, index: usize) -> bool {
        match self.tasks.get_mut(index) {
            Some(task) => {
                task.completed = true;
                true
            }
            None => false,
        }
    }

    /// Whether the task at `index` closes its PR group.
    ///
    /// With `pr_per_task` every task ships on its own; otherwise a group ships
    /// once its last task completes.
    pub fn is_group_boundary(&self, index: usize, pr_per_task: bool) -> bool {
        let Some(task) = self.tasks.get(index) else {
            return false;
        };
        if pr_per_task {
            return true;
        }
        match self.tasks.get(index + 1) {
            Some(next) => next.group != task.group,
            None => true,
        }
    }

    /// Indices of the tasks sharing the group of `index`, in order.
    pub fn group_indices(&self, index: usize) -> Vec<usize> {
        let Some(task) = self.tasks.get(index) else {
            return Vec::new();
        };
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.group == task.group)
            .map(|(i, _)| i)
            .collect()
    }

    /// Parse a checkbox-formatted plan document.
    pub fn parse(markdown: &str) -> Plan {
        let mut tasks: Vec<Task> = Vec::new();
        let mut group: Option<String> = None;
        let mut last_task_indent: Option<usize> = None;

        for raw in markdown.lines() {
            let indent = raw.len() - raw.trim_start().len();
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = GROUP_RE.captures(line) {
                group = Some(caps[1].trim().to_string());
                last_task_indent = None;
                continue;
            }
            if UNGROUPED_RE.is_match(line) {
                group = None;
                last_task_indent = None;
                continue;
            }
            if let Some(caps) = TASK_RE.captures(line) {
                let completed = caps[1].eq_ignore_ascii_case("x");
                let (complexity, description) = parse_complexity(&caps[2]);
                tasks.push(Task {
                    description,
                    completed,
                    complexity,
                    file_references: Vec::new(),
                    group: group.clone(),
                });
                last_task_indent = Some(indent);
                continue;
            }
            // Nested `- path` item under a task: file reference.
            if let (Some(task_indent), Some(path)) = (last_task_indent, line.strip_prefix("- "))
                && indent > task_indent
                && let Some(task) = tasks.last_mut()
            {
                task.file_references
                    .push(path.trim().trim_matches('`').to_string());
            }
        }

        Plan { tasks }
    }

    /// Render back to markdown. `Plan::parse(&plan.render()) == plan`.
    pub fn render(&self) -> String {
        let mut out = String::from("## Task List\n");
        let mut current_group: Option<&str> = None;
        let mut group_number = 0u32;
        let mut first = true;

        for task in &self.tasks {
            let task_group = task.group.as_deref();
            if first || task_group != current_group {
                match task_group {
                    Some(name) => {
                        group_number += 1;
                        out.push_str(&format!("\n### PR {group_number}: {name}\n"));
                    }
                    None if !first => out.push_str(&format!("\n### {UNGROUPED_HEADER}\n")),
                    None => {}
                }
                out.push('\n');
                current_group = task_group;
                first = false;
            }
            let mark = if task.completed { "x" } else { " " };
            out.push_str(&format!(
                "- [{mark}] `[{}]` {}\n",
                task.complexity, task.description
            ));
            for path in &task.file_references {
                out.push_str(&format!("  - {path}\n"));
            }
        }

        out
    }
}

/// Split a leading/embedded complexity tag off a task description.
/// Untagged tasks default to `coding`.
pub fn parse_complexity(text: &str) -> (Complexity, String) {
    match COMPLEXITY_RE.captures(text) {
        Some(caps) => {
            let complexity = Complexity::parse_tag(&caps[1]).unwrap_or_default();
            let cleaned = COMPLEXITY_RE.replace_all(text, "").trim().to_string();
            (complexity, cleaned)
        }
        None => (Complexity::default(), text.trim().to_string()),
    }
}

/// Result of splicing a regenerated plan onto a running one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSplice {
    pub plan: Plan,
    /// Index of the first not-yet-completed task in the spliced plan.
    pub next_index: usize,
    pub added: usize,
    pub removed: usize,
}

/// Keep the completed prefix of `current` and append the pending part of
/// `regenerated`.
///
/// Tasks the regenerated plan reports as completed, or that repeat a task in
/// the kept prefix, are dropped so nothing already done is scheduled twice.
pub fn splice_regenerated(current: &Plan, regenerated: &Plan) -> PlanSplice {
    let prefix_len = current.completed_prefix_len();
    let prefix = &current.tasks[..prefix_len];

    let mut tasks: Vec<Task> = prefix.to_vec();
    for task in &regenerated.tasks {
        if task.completed {
            continue;
        }
        if prefix.iter().any(|done| done.description == task.description) {
            continue;
        }
        tasks.push(task.clone());
    }

    let old_pending: Vec<&str> = current.tasks[prefix_len..]
        .iter()
        .map(|t| t.description.as_str())
        .collect();
    let new_pending: Vec<&str> = tasks[prefix_len..]
        .iter()
        .map(|t| t.description.as_str())
        .collect();
    let added = new_pending
        .iter()
        .filter(|d| !old_pending.contains(d))
        .count();
    let removed = old_pending
        .iter()
        .filter(|d| !new_pending.contains(d))
        .count();

    PlanSplice {
        plan: Plan { tasks },
        next_index: prefix_len,
        added,
        removed,
    }
}
