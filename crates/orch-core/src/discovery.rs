//! Walk a task-tree root, parse frontmatter, build the immutable Unit/Task
//! model, and validate it.
//!
//! Discovery is pure: no writes, no network, no subprocesses. Validation
//! errors are accumulated rather than fail-fast, and are returned alongside
//! the (possibly partial) model rather than short-circuiting construction —
//! a caller wants to see every problem in the tree at once, not one at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::frontmatter::{self, Frontmatter};
use crate::types::{Task, TaskStatus, Unit};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("{unit}: missing IMPLEMENTATION_PLAN.md")]
    MissingPlan { unit: String },
    #[error("{unit}: no task files matching NN-*.md (NN in 01..99)")]
    NoTaskFiles { unit: String },
    #[error("{unit}: IMPLEMENTATION_PLAN.md missing non-empty `unit` field, or it does not match the directory name")]
    MissingUnitField { unit: String },
    #[error("{unit}/{file}: missing required field `{field}`")]
    MissingTaskField {
        unit: String,
        file: String,
        field: String,
    },
    #[error("{unit}/{file}: `backpressure` must be non-empty")]
    EmptyBackpressure { unit: String, file: String },
    #[error("{unit}: task numbers are not contiguous from 1 (found {found:?})")]
    NonContiguousTaskNumbers { unit: String, found: Vec<u32> },
    #[error("{unit}: task {task} depends_on unknown task {dep}")]
    TaskDependsOnUnknown { unit: String, task: u32, dep: u32 },
    #[error("{unit}: task {task} depends_on itself")]
    TaskDependsOnSelf { unit: String, task: u32 },
    #[error("{unit}: cyclic intra-unit task dependency: {}", path.iter().map(u32::to_string).collect::<Vec<_>>().join(" -> "))]
    TaskDependencyCycle { unit: String, path: Vec<u32> },
    #[error("{unit}: depends_on unknown unit {dep}")]
    UnitDependsOnUnknown { unit: String, dep: String },
    #[error("cyclic unit dependency: {}", path.join(" -> "))]
    UnitDependencyCycle { path: Vec<String> },
}

/// Result of a discovery pass: the built model (possibly partial when
/// validation failed) plus the full accumulated error list.
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    pub units: Vec<Unit>,
    pub errors: Vec<DiscoveryError>,
}

impl DiscoveryResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Walk `root`'s immediate subdirectories and build the Unit/Task model.
pub fn discover(root: &Path) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();

    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                !p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return result,
    };
    dirs.sort();

    for dir in dirs {
        let unit_id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        match discover_unit(&dir, &unit_id) {
            Ok((unit, mut errs)) => {
                result.errors.append(&mut errs);
                result.units.push(unit);
            }
            Err(e) => result.errors.push(e),
        }
    }

    validate_cross_unit(&mut result);
    result
}

fn discover_unit(dir: &Path, unit_id: &str) -> Result<(Unit, Vec<DiscoveryError>), DiscoveryError> {
    let mut errors = Vec::new();

    let plan_path = dir.join("IMPLEMENTATION_PLAN.md");
    if !plan_path.exists() {
        return Err(DiscoveryError::MissingPlan {
            unit: unit_id.to_string(),
        });
    }

    let plan_text = std::fs::read_to_string(&plan_path).map_err(|_| DiscoveryError::MissingPlan {
        unit: unit_id.to_string(),
    })?;
    let plan_fm = frontmatter::parse(&plan_text).map_err(|_| DiscoveryError::MissingUnitField {
        unit: unit_id.to_string(),
    })?;

    let declared_unit = frontmatter::field_str(&plan_fm.fields, "unit").unwrap_or("");
    if declared_unit.is_empty() || declared_unit != unit_id {
        errors.push(DiscoveryError::MissingUnitField {
            unit: unit_id.to_string(),
        });
    }
    let depends_on: BTreeSet<String> =
        frontmatter::field_str_list(&plan_fm.fields, "depends_on")
            .into_iter()
            .collect();

    let mut task_files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_task_file(p))
                .collect()
        })
        .unwrap_or_default();
    task_files.sort();

    if task_files.is_empty() {
        return Err(DiscoveryError::NoTaskFiles {
            unit: unit_id.to_string(),
        });
    }

    let mut tasks = Vec::with_capacity(task_files.len());
    for file_path in &task_files {
        match parse_task(unit_id, file_path) {
            Ok((task, mut errs)) => {
                errors.append(&mut errs);
                tasks.push(task);
            }
            Err(e) => errors.push(e),
        }
    }
    tasks.sort_by_key(|t| t.number);

    validate_task_numbers(unit_id, &tasks, &mut errors);
    validate_task_deps(unit_id, &tasks, &mut errors);

    let unit = Unit {
        id: unit_id.to_string(),
        depends_on,
        tasks,
        plan_path,
        plan_body: plan_fm.body,
    };

    Ok((unit, errors))
}

fn is_task_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if !name.ends_with(".md") || name.len() < 3 {
        return false;
    }
    let prefix = &name[..2];
    if !prefix.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let n: u32 = prefix.parse().unwrap_or(0);
    (1..=99).contains(&n) && name.as_bytes().get(2) == Some(&b'-')
}

fn parse_task(unit_id: &str, file_path: &Path) -> Result<(Task, Vec<DiscoveryError>), DiscoveryError> {
    let mut errors = Vec::new();
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let text = std::fs::read_to_string(file_path).map_err(|_| DiscoveryError::MissingTaskField {
        unit: unit_id.to_string(),
        file: file_name.clone(),
        field: "task".to_string(),
    })?;
    let fm: Frontmatter = frontmatter::parse(&text).map_err(|_| DiscoveryError::MissingTaskField {
        unit: unit_id.to_string(),
        file: file_name.clone(),
        field: "task".to_string(),
    })?;

    let number = fm
        .fields
        .get("task")
        .and_then(|v| v.as_i64())
        .map(|n| n as u32);
    let status_str = frontmatter::field_str(&fm.fields, "status");
    let backpressure = frontmatter::field_str(&fm.fields, "backpressure").unwrap_or("");

    if number.is_none() {
        errors.push(DiscoveryError::MissingTaskField {
            unit: unit_id.to_string(),
            file: file_name.clone(),
            field: "task".to_string(),
        });
    }
    if status_str.is_none() {
        errors.push(DiscoveryError::MissingTaskField {
            unit: unit_id.to_string(),
            file: file_name.clone(),
            field: "status".to_string(),
        });
    }
    if backpressure.is_empty() {
        errors.push(DiscoveryError::EmptyBackpressure {
            unit: unit_id.to_string(),
            file: file_name.clone(),
        });
    }

    let status = match status_str {
        Some("pending") | None => TaskStatus::Pending,
        Some("in_progress") => TaskStatus::InProgress,
        Some("complete") => TaskStatus::Complete,
        Some("failed") => TaskStatus::Failed,
        Some(_) => TaskStatus::Pending,
    };

    let depends_on: BTreeSet<u32> = frontmatter::field_int_list(&fm.fields, "depends_on")
        .into_iter()
        .map(|n| n as u32)
        .collect();

    let title = frontmatter::field_str(&fm.fields, "title")
        .unwrap_or(&file_name)
        .to_string();

    let task = Task {
        number: number.unwrap_or(0),
        title,
        status,
        backpressure: backpressure.to_string(),
        depends_on,
        file_path: file_path.to_path_buf(),
        body: fm.body,
    };

    Ok((task, errors))
}

fn validate_task_numbers(unit_id: &str, tasks: &[Task], errors: &mut Vec<DiscoveryError>) {
    let found: Vec<u32> = tasks.iter().map(|t| t.number).collect();
    let expected: Vec<u32> = (1..=found.len() as u32).collect();
    if found != expected {
        errors.push(DiscoveryError::NonContiguousTaskNumbers {
            unit: unit_id.to_string(),
            found,
        });
    }
}

fn validate_task_deps(unit_id: &str, tasks: &[Task], errors: &mut Vec<DiscoveryError>) {
    let numbers: BTreeSet<u32> = tasks.iter().map(|t| t.number).collect();
    let mut adjacency: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();

    for task in tasks {
        for &dep in &task.depends_on {
            if dep == task.number {
                errors.push(DiscoveryError::TaskDependsOnSelf {
                    unit: unit_id.to_string(),
                    task: task.number,
                });
                continue;
            }
            if !numbers.contains(&dep) {
                errors.push(DiscoveryError::TaskDependsOnUnknown {
                    unit: unit_id.to_string(),
                    task: task.number,
                    dep,
                });
                continue;
            }
            adjacency.entry(task.number).or_default().insert(dep);
        }
    }

    if let Some(path) = detect_cycle_u32(&adjacency) {
        errors.push(DiscoveryError::TaskDependencyCycle {
            unit: unit_id.to_string(),
            path,
        });
    }
}

fn validate_cross_unit(result: &mut DiscoveryResult) {
    let ids: BTreeSet<String> = result.units.iter().map(|u| u.id.clone()).collect();
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for unit in &result.units {
        for dep in &unit.depends_on {
            if !ids.contains(dep) {
                result.errors.push(DiscoveryError::UnitDependsOnUnknown {
                    unit: unit.id.clone(),
                    dep: dep.clone(),
                });
                continue;
            }
            adjacency
                .entry(unit.id.clone())
                .or_default()
                .insert(dep.clone());
        }
    }

    if let Some(path) = detect_cycle_string(&adjacency) {
        result.errors.push(DiscoveryError::UnitDependencyCycle { path });
    }
}

/// Three-colour DFS cycle detection returning a concrete cycle path, generic
/// over `u32` node IDs (intra-unit task dependencies).
fn detect_cycle_u32(adjacency: &BTreeMap<u32, BTreeSet<u32>>) -> Option<Vec<u32>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: BTreeMap<u32, Color> = BTreeMap::new();
    let nodes: BTreeSet<u32> = adjacency
        .keys()
        .copied()
        .chain(adjacency.values().flatten().copied())
        .collect();
    for &n in &nodes {
        colors.insert(n, Color::White);
    }

    fn visit(
        node: u32,
        adjacency: &BTreeMap<u32, BTreeSet<u32>>,
        colors: &mut BTreeMap<u32, Color>,
        stack: &mut Vec<u32>,
    ) -> Option<Vec<u32>> {
        colors.insert(node, Color::Gray);
        stack.push(node);
        if let Some(neighbors) = adjacency.get(&node) {
            for &next in neighbors {
                match colors.get(&next) {
                    Some(Color::Gray) => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<u32> = stack[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Some(Color::White) | None => {
                        if let Some(cycle) = visit(next, adjacency, colors, stack) {
                            return Some(cycle);
                        }
                    }
                    Some(Color::Black) => {}
                }
            }
        }
        stack.pop();
        colors.insert(node, Color::Black);
        None
    }

    for &n in &nodes {
        if colors[&n] == Color::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(n, adjacency, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Same algorithm, over `String` node IDs (inter-unit dependencies).
pub fn detect_cycle_string(adjacency: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: BTreeMap<String, Color> = BTreeMap::new();
    let nodes: BTreeSet<String> = adjacency
        .keys()
        .cloned()
        .chain(adjacency.values().flatten().cloned())
        .collect();
    for n in &nodes {
        colors.insert(n.clone(), Color::White);
    }

    fn visit(
        node: &str,
        adjacency: &BTreeMap<String, BTreeSet<String>>,
        colors: &mut BTreeMap<String, Color>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        colors.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());
        if let Some(neighbors) = adjacency.get(node) {
            for next in neighbors {
                match colors.get(next.as_str()) {
                    Some(Color::Gray) => {
                        let start = stack.iter().position(|n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..].to_vec();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Some(Color::White) | None => {
                        if let Some(cycle) = visit(next, adjacency, colors, stack) {
                            return Some(cycle);
                        }
                    }
                    Some(Color::Black) => {}
                }
            }
        }
        stack.pop();
        colors.insert(node.to_string(), Color::Black);
        None
    }

    for n in &nodes {
        if colors[n] == Color::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(n, adjacency, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
