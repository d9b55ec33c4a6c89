//! Dependency resolution: which tasks may run next.
//!
//! Pure computation over a task set — no I/O, no side effects. This is
//! a topological readiness check, not a full DAG scheduler: cycles are
//! not rejected up front, but a graph that can make no progress is
//! reported as a stall by [`diagnose_stall`].

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::model::{Task, TaskStatus};

/// Tasks eligible to run given current statuses.
///
/// Sequential mode: `todo` tasks whose every dependency id resolves to
/// a `completed` task. Non-sequential mode: every `todo` task.
pub fn ready_tasks(tasks: &[Task], sequential: bool) -> Vec<&Task> {
    if !sequential {
        return tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Todo)
            .collect();
    }

    let by_id: HashMap<&str, &Task> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    tasks
        .iter()
        .filter(|task| {
            task.status == TaskStatus::Todo
                && task.depends_on.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
        })
        .collect()
}

/// Why a task set can make no further progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    /// (task id, dependency id) pairs where the dependency does not
    /// exist in the set — typically a typo'd or never-created forward
    /// reference
    pub missing_dependencies: Vec<(String, String)>,
    /// (task id, dependency id) pairs where the dependency reached a
    /// terminal non-completed state
    pub failed_dependencies: Vec<(String, String)>,
    /// Dependency cycles, each as the task ids on the cycle
    pub cycles: Vec<Vec<String>>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.missing_dependencies.is_empty()
            && self.failed_dependencies.is_empty()
            && self.cycles.is_empty()
    }
}

impl std::fmt::Display for StallReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for (task, dep) in &self.missing_dependencies {
            parts.push(format!("{} waits on missing {}", task, dep));
        }
        for (task, dep) in &self.failed_dependencies {
            parts.push(format!("{} waits on failed {}", task, dep));
        }
        for cycle in &self.cycles {
            parts.push(format!("cycle: {}", cycle.join(" -> ")));
        }
        if parts.is_empty() {
            parts.push("no progress possible".to_string());
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Diagnose a stalled task set.
///
/// Returns `Some` when `todo` tasks remain but none is ready in
/// sequential mode; `None` while the set can still make progress (or
/// has nothing left to do).
pub fn diagnose_stall(tasks: &[Task]) -> Option<StallReport> {
    let has_todo = tasks.iter().any(|t| t.status == TaskStatus::Todo);
    if !has_todo || !ready_tasks(tasks, true).is_empty() {
        return None;
    }

    // Something still wants to run but nothing is eligible: work out why.
    let by_id: HashMap<&str, &Task> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut missing = Vec::new();
    let mut failed = Vec::new();

    for task in tasks.iter().filter(|t| t.status == TaskStatus::Todo) {
        for dep in &task.depends_on {
            match by_id.get(dep.as_str()) {
                None => missing.push((task.id.clone(), dep.clone())),
                Some(d) if d.status.is_terminal() && d.status != TaskStatus::Completed => {
                    failed.push((task.id.clone(), dep.clone()));
                }
                Some(_) => {}
            }
        }
    }

    Some(StallReport {
        missing_dependencies: missing,
        failed_dependencies: failed,
        cycles: find_cycles(tasks),
    })
}

/// Dependency cycles among non-terminal tasks, reported as id paths.
fn find_cycles(tasks: &[Task]) -> Vec<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for task in tasks {
        let node = graph.add_node(task.id.as_str());
        nodes.insert(task.id.as_str(), node);
    }

    for task in tasks {
        let to = nodes[task.id.as_str()];
        for dep in &task.depends_on {
            if let Some(&from) = nodes.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .map(|&n| graph.find_edge(n, n).is_some())
                    .unwrap_or(false)
        })
        .map(|component| {
            component
                .into_iter()
                .map(|n| graph[n].to_string())
                .collect()
        })
        .collect()
}
