//! Prompt composition for the Agent Adapter.
//!
//! The engine never lets the coding agent choose its own instructions: every
//! invocation is one of a closed set of prompt kinds, each a fixed template
//! with named slots filled in by the Worker or Review Adapter. The adapter
//! composes; it does not invent.

use std::fmt::Write as _;

use at_core::types::{Task, Unit};

/// The closed set of prompts the Agent Adapter can compose.
#[derive(Debug, Clone)]
pub enum PromptKind {
    /// Phase 2: present the ready task set, let the agent pick one and
    /// implement it.
    TaskExecution { unit: UnitContext, ready_tasks: Vec<TaskSlot> },
    /// Phase 2.5: a baseline check command failed; ask the agent to fix it.
    BaselineFix { unit: UnitContext, check_name: String, output: String },
    /// Phase 3: ask the agent to author and open the PR from the plan.
    PrCreate { unit: UnitContext, base_branch: String },
    /// Review loop: reviewer left unresolved feedback; ask the agent to
    /// address it.
    PrFeedbackAddress { unit: UnitContext, pr_number: u64, comments: Vec<ReviewCommentSlot> },
    /// Merge sequence: rebase produced conflicts; ask the agent to resolve
    /// them.
    ConflictResolve { unit: UnitContext, target_branch: String, conflict_files: Vec<String> },
}

/// Unit identity carried into every prompt so the agent has orientation
/// without the Worker re-deriving it per call site.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub unit_id: String,
    pub plan_body: String,
}

impl UnitContext {
    pub fn from_unit(unit: &Unit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            plan_body: unit.plan_body.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSlot {
    pub number: u32,
    pub title: String,
    pub file_path: String,
    pub backpressure: String,
}

impl TaskSlot {
    pub fn from_task(task: &Task) -> Self {
        Self {
            number: task.number,
            title: task.title.clone(),
            file_path: task.file_path.display().to_string(),
            backpressure: task.backpressure.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewCommentSlot {
    pub author: String,
    pub body: String,
}

/// Render a [`PromptKind`] into the text handed to the agent subprocess.
pub fn render(kind: &PromptKind) -> String {
    match kind {
        PromptKind::TaskExecution { unit, ready_tasks } => task_execution_prompt(unit, ready_tasks),
        PromptKind::BaselineFix { unit, check_name, output } => {
            baseline_fix_prompt(unit, check_name, output)
        }
        PromptKind::PrCreate { unit, base_branch } => pr_create_prompt(unit, base_branch),
        PromptKind::PrFeedbackAddress { unit, pr_number, comments } => {
            pr_feedback_address_prompt(unit, *pr_number, comments)
        }
        PromptKind::ConflictResolve { unit, target_branch, conflict_files } => {
            conflict_resolve_prompt(unit, target_branch, conflict_files)
        }
    }
}

fn task_execution_prompt(unit: &UnitContext, ready_tasks: &[TaskSlot]) -> String {
    let mut out = format!(
        "You are implementing unit `{}` of an automated development run.\n\n\
         ## Implementation plan\n{}\n\n\
         ## Ready tasks\n\
         Pick exactly one of the tasks below, implement it fully, and update its\n\
         frontmatter `status` to `complete` when (and only when) it is genuinely\n\
         finished. Do not touch any other task's status field.\n\n",
        unit.unit_id, unit.plan_body
    );
    for t in ready_tasks {
        let _ = writeln!(
            out,
            "- Task {} — {}\n  file: {}\n  acceptance check: `{}`",
            t.number, t.title, t.file_path, t.backpressure
        );
    }
    let _ = write!(
        out,
        "\nYour change will be validated by running the task's acceptance check.\n\
         Make sure it passes before you report the task complete."
    );
    out
}

fn baseline_fix_prompt(unit: &UnitContext, check_name: &str, output: &str) -> String {
    format!(
        "Unit `{}` has completed all of its tasks, but the baseline check\n\
         `{check_name}` is failing. Fix the issue without changing the\n\
         behaviour implemented by the completed tasks.\n\n\
         ## Failing check output\n```\n{output}\n```\n",
        unit.unit_id
    )
}

fn pr_create_prompt(unit: &UnitContext, base_branch: &str) -> String {
    format!(
        "All tasks for unit `{}` are complete and committed. Open a pull\n\
         request from the current branch against `{base_branch}`.\n\n\
         Compose the PR title and description yourself from the implementation\n\
         plan below — summarize what changed and why, call out anything a\n\
         reviewer should pay special attention to.\n\n\
         ## Implementation plan\n{}\n",
        unit.unit_id, unit.plan_body
    )
}

fn pr_feedback_address_prompt(unit: &UnitContext, pr_number: u64, comments: &[ReviewCommentSlot]) -> String {
    let mut out = format!(
        "Pull request #{pr_number} for unit `{}` received reviewer feedback.\n\
         Address every comment below, commit the fixes, and push.\n\n\
         ## Unresolved comments\n",
        unit.unit_id
    );
    for c in comments {
        let _ = writeln!(out, "- **{}**: {}", c.author, c.body);
    }
    out
}

fn conflict_resolve_prompt(unit: &UnitContext, target_branch: &str, conflict_files: &[String]) -> String {
    let mut out = format!(
        "Rebasing unit `{}`'s branch onto `{target_branch}` produced conflicts\n\
         in the following files. Resolve each conflict, preserving the intent of\n\
         both sides where possible, then stage the resolution.\n\n\
         ## Conflicted files\n",
        unit.unit_id
    );
    for f in conflict_files {
        let _ = writeln!(out, "- {f}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> UnitContext {
        UnitContext { unit_id: "unit-a".into(), plan_body: "Build the widget.".into() }
    }

    #[test]
    fn task_execution_lists_every_ready_task() {
        let tasks = vec![
            TaskSlot { number: 1, title: "Add struct".into(), file_path: "01-task.md".into(), backpressure: "cargo test widget".into() },
            TaskSlot { number: 2, title: "Wire config".into(), file_path: "02-task.md".into(), backpressure: "cargo test config".into() },
        ];
        let rendered = render(&PromptKind::TaskExecution { unit: ctx(), ready_tasks: tasks });
        assert!(rendered.contains("Task 1 — Add struct"));
        assert!(rendered.contains("Task 2 — Wire config"));
        assert!(rendered.contains("cargo test widget"));
    }

    #[test]
    fn baseline_fix_includes_failing_output() {
        let rendered = render(&PromptKind::BaselineFix {
            unit: ctx(),
            check_name: "cargo clippy".into(),
            output: "error: unused import".into(),
        });
        assert!(rendered.contains("cargo clippy"));
        assert!(rendered.contains("unused import"));
    }

    #[test]
    fn pr_create_mentions_base_branch() {
        let rendered = render(&PromptKind::PrCreate { unit: ctx(), base_branch: "main".into() });
        assert!(rendered.contains("`main`"));
    }

    #[test]
    fn pr_feedback_address_lists_each_comment() {
        let comments = vec![
            ReviewCommentSlot { author: "alice".into(), body: "please add a test".into() },
            ReviewCommentSlot { author: "bob".into(), body: "rename this variable".into() },
        ];
        let rendered = render(&PromptKind::PrFeedbackAddress { unit: ctx(), pr_number: 42, comments });
        assert!(rendered.contains("#42"));
        assert!(rendered.contains("**alice**: please add a test"));
        assert!(rendered.contains("**bob**: rename this variable"));
    }

    #[test]
    fn conflict_resolve_lists_conflicted_files() {
        let rendered = render(&PromptKind::ConflictResolve {
            unit: ctx(),
            target_branch: "main".into(),
            conflict_files: vec!["src/lib.rs".into(), "src/main.rs".into()],
        });
        assert!(rendered.contains("src/lib.rs"));
        assert!(rendered.contains("src/main.rs"));
    }

    #[test]
    fn unit_context_carries_plan_body() {
        let unit = Unit {
            id: "unit-b".into(),
            depends_on: Default::default(),
            tasks: vec![],
            plan_path: PathBuf::from("IMPLEMENTATION_PLAN.md"),
            plan_body: "Plan text".into(),
        };
        let ctx = UnitContext::from_unit(&unit);
        assert_eq!(ctx.unit_id, "unit-b");
        assert_eq!(ctx.plan_body, "Plan text");
    }
}
