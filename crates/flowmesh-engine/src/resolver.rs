//! Dependency resolver (C4, spec.md §4.4).
//!
//! Tracks, per workflow, which tasks are waiting on which other tasks and
//! emits newly-ready task ids as dependencies complete. Cross-workflow
//! dependencies are rejected at registration (resolved Open Question,
//! SPEC_FULL.md §9): a task may only name sibling task ids from its own
//! workflow as dependencies.
//!
//! Grounded on the teacher's per-workflow sharding in
//! `engine/executor.rs` (one in-memory structure keyed by workflow id,
//! guarded independently so unrelated workflows never contend on the same
//! lock) and on the original's `dependency_graph.py`'s `deps`/`reverse`
//! double-index, which this module keeps verbatim in spirit.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use flowmesh_core::{Task, TaskId, TaskStatus, WorkflowId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolverError {
    /// Covers both a genuinely missing sibling id and a cross-workflow
    /// reference: `register` only ever sees one workflow's own task list,
    /// so a dependency naming a task from another workflow is simply
    /// absent from it too (resolved Open Question, SPEC_FULL.md §9 — both
    /// surface as `INVALID_WORKFLOW` at the document/workflow-manager
    /// layer).
    #[error("task '{0}' depends on unknown task '{1}'")]
    UnknownDependency(TaskId, TaskId),
    #[error("dependency cycle detected in workflow '{0}': {1:?}")]
    CycleDetected(WorkflowId, Vec<TaskId>),
    #[error("workflow '{0}' is already registered with the resolver")]
    AlreadyRegistered(WorkflowId),
}

/// Forward/reverse dependency indices for one workflow's task graph.
struct WorkflowIndex {
    /// task_id -> set of task ids it still waits on.
    pending_deps: HashMap<TaskId, HashSet<TaskId>>,
    /// task_id -> set of task ids that depend on it.
    reverse: HashMap<TaskId, HashSet<TaskId>>,
}

impl WorkflowIndex {
    fn from_tasks(tasks: &[Task]) -> Self {
        let mut pending_deps = HashMap::new();
        let mut reverse: HashMap<TaskId, HashSet<TaskId>> = HashMap::new();
        for task in tasks {
            pending_deps.insert(task.id.clone(), task.dependencies.iter().cloned().collect());
            reverse.entry(task.id.clone()).or_default();
            for dep in &task.dependencies {
                reverse.entry(dep.clone()).or_default().insert(task.id.clone());
            }
        }
        Self { pending_deps, reverse }
    }

    fn ready_tasks(&self) -> Vec<TaskId> {
        self.pending_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Tracks the dependency graph of every active workflow. One `Mutex` per
/// workflow (not a single global lock) so unrelated workflows never
/// contend (spec.md §5 concurrency note).
#[derive(Default)]
pub struct DependencyResolver {
    workflows: DashMap<WorkflowId, Mutex<WorkflowIndex>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow's full task set, validating that every
    /// dependency refers to a sibling task id and that the graph is
    /// acyclic. Returns the ids of tasks with no dependencies at all,
    /// ready to enqueue immediately.
    pub fn register(&self, workflow_id: &str, tasks: &[Task]) -> Result<Vec<TaskId>, ResolverError> {
        if self.workflows.contains_key(workflow_id) {
            return Err(ResolverError::AlreadyRegistered(workflow_id.to_string()));
        }

        let known: HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        for task in tasks {
            for dep in &task.dependencies {
                if !known.contains(dep) {
                    return Err(ResolverError::UnknownDependency(task.id.clone(), dep.clone()));
                }
            }
        }

        if let Some(cycle) = detect_cycle(tasks) {
            return Err(ResolverError::CycleDetected(workflow_id.to_string(), cycle));
        }

        let index = WorkflowIndex::from_tasks(tasks);
        let ready = index.ready_tasks();
        self.workflows.insert(workflow_id.to_string(), Mutex::new(index));
        Ok(ready)
    }

    /// A task completed: release everyone waiting on it and return the
    /// ids that became ready as a result (spec.md §4.4).
    pub fn on_task_completed(&self, workflow_id: &str, task_id: &str) -> Vec<TaskId> {
        let Some(entry) = self.workflows.get(workflow_id) else {
            return Vec::new();
        };
        let mut index = entry.lock();
        let Some(dependents) = index.reverse.get(task_id).cloned() else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for dependent in dependents {
            if let Some(deps) = index.pending_deps.get_mut(&dependent) {
                deps.remove(task_id);
                if deps.is_empty() {
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// A task failed terminally: every transitive dependent becomes
    /// unreachable and must be cancelled, under either error strategy
    /// (resolved Open Question, SPEC_FULL.md §9 — `continue` only spares
    /// *independent* tasks, not dependents of the failure). Returns the
    /// full transitive closure of dependents, in no particular order.
    pub fn on_task_failed(&self, workflow_id: &str, task_id: &str) -> Vec<TaskId> {
        let Some(entry) = self.workflows.get(workflow_id) else {
            return Vec::new();
        };
        let index = entry.lock();
        let mut cancelled = Vec::new();
        let mut frontier = vec![task_id.to_string()];
        let mut seen: HashSet<TaskId> = HashSet::new();
        while let Some(current) = frontier.pop() {
            let Some(dependents) = index.reverse.get(&current) else { continue };
            for dependent in dependents {
                if seen.insert(dependent.clone()) {
                    cancelled.push(dependent.clone());
                    frontier.push(dependent.clone());
                }
            }
        }
        cancelled
    }

    pub fn forget_workflow(&self, workflow_id: &str) {
        self.workflows.remove(workflow_id);
    }

    /// Rebuild a workflow's in-memory dependency index after a process
    /// restart (spec.md §8 "crash recovery"). Unlike `register`, this
    /// accounts for tasks that already have a completed `TaskResult` from
    /// before the crash: their edges are dropped from `pending_deps` up
    /// front rather than waited on again, and only tasks still in
    /// `TaskStatus::Pending` are returned as newly ready — tasks already
    /// `queued`/`executing`/`retry_scheduled` are left alone since the
    /// persisted queue/retry-schedule tables already know about them.
    /// Replaces any existing index for `workflow_id` (a second recovery
    /// pass is a no-op only because the caller does it once at startup).
    pub fn register_resumed(&self, workflow_id: &str, tasks: &[Task], completed: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut index = WorkflowIndex::from_tasks(tasks);
        for deps in index.pending_deps.values_mut() {
            deps.retain(|dep| !completed.contains(dep));
        }

        let ready = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| index.pending_deps.get(&t.id).is_none_or(|d| d.is_empty()))
            .map(|t| t.id.clone())
            .collect();

        self.workflows.insert(workflow_id.to_string(), Mutex::new(index));
        ready
    }
}

/// DFS-based cycle detection over a task list's `dependencies` edges,
/// returning one offending cycle (as an ordered id list) if found.
fn detect_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut marks: HashMap<&TaskId, Mark> = HashMap::new();
    let mut stack: Vec<TaskId> = Vec::new();

    fn visit<'a>(
        id: &'a TaskId,
        by_id: &HashMap<&'a TaskId, &'a Task>,
        marks: &mut HashMap<&'a TaskId, Mark>,
        stack: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        if let Some(Mark::Done) = marks.get(id) {
            return None;
        }
        if let Some(Mark::InProgress) = marks.get(id) {
            let start = stack.iter().position(|x| x == id).unwrap_or(0);
            let mut cycle = stack[start..].to_vec();
            cycle.push(id.clone());
            return Some(cycle);
        }
        marks.insert(id, Mark::InProgress);
        stack.push(id.clone());
        if let Some(task) = by_id.get(id) {
            for dep in &task.dependencies {
                if let Some(cycle) = visit(dep, by_id, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for task in tasks {
        if let Some(cycle) = visit(&task.id, &by_id, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_deps(id: &str, deps: &[&str]) -> Task {
        let mut task = Task::new(id, "math/v1", "add");
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        task
    }

    #[test]
    fn register_returns_only_dependency_free_tasks() {
        let resolver = DependencyResolver::new();
        let tasks = vec![task_with_deps("t1", &[]), task_with_deps("t2", &["t1"])];
        let ready = resolver.register("wf1", &tasks).unwrap();
        assert_eq!(ready, vec!["t1".to_string()]);
    }

    #[test]
    fn completing_a_task_releases_its_dependent() {
        let resolver = DependencyResolver::new();
        let tasks = vec![task_with_deps("t1", &[]), task_with_deps("t2", &["t1"])];
        resolver.register("wf1", &tasks).unwrap();
        let ready = resolver.on_task_completed("wf1", "t1");
        assert_eq!(ready, vec!["t2".to_string()]);
    }

    #[test]
    fn fan_in_waits_for_every_dependency() {
        let resolver = DependencyResolver::new();
        let tasks = vec![
            task_with_deps("t1", &[]),
            task_with_deps("t2", &[]),
            task_with_deps("t3", &["t1", "t2"]),
        ];
        resolver.register("wf1", &tasks).unwrap();
        assert!(resolver.on_task_completed("wf1", "t1").is_empty());
        assert_eq!(resolver.on_task_completed("wf1", "t2"), vec!["t3".to_string()]);
    }

    #[test]
    fn cycle_is_rejected_at_registration() {
        let resolver = DependencyResolver::new();
        let tasks = vec![task_with_deps("t1", &["t2"]), task_with_deps("t2", &["t1"])];
        let err = resolver.register("wf1", &tasks).unwrap_err();
        assert!(matches!(err, ResolverError::CycleDetected(_, _)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let resolver = DependencyResolver::new();
        let tasks = vec![task_with_deps("t1", &["ghost"])];
        let err = resolver.register("wf1", &tasks).unwrap_err();
        assert!(matches!(err, ResolverError::UnknownDependency(_, _)));
    }

    #[test]
    fn failure_cancels_the_full_transitive_closure_of_dependents() {
        let resolver = DependencyResolver::new();
        let tasks = vec![
            task_with_deps("t1", &[]),
            task_with_deps("t2", &["t1"]),
            task_with_deps("t3", &["t2"]),
            task_with_deps("t4", &[]),
        ];
        resolver.register("wf1", &tasks).unwrap();
        let mut cancelled = resolver.on_task_failed("wf1", "t1");
        cancelled.sort();
        assert_eq!(cancelled, vec!["t2".to_string(), "t3".to_string()]);
    }

    #[test]
    fn register_resumed_skips_completed_deps_and_only_readies_pending_tasks() {
        let resolver = DependencyResolver::new();
        let mut t1 = task_with_deps("t1", &[]);
        t1.status = TaskStatus::Completed;
        let mut t2 = task_with_deps("t2", &["t1"]);
        t2.status = TaskStatus::Pending;
        let mut t3 = task_with_deps("t3", &["t1"]);
        t3.status = TaskStatus::Queued;

        let completed = HashSet::from(["t1".to_string()]);
        let ready = resolver.register_resumed("wf1", &[t1, t2, t3], &completed);

        // t2 is pending with its only dep already completed: ready to
        // enqueue. t3 is already queued, so it is left alone even though
        // its dep is also satisfied.
        assert_eq!(ready, vec!["t2".to_string()]);
    }

    #[test]
    fn register_resumed_still_waits_on_uncompleted_deps() {
        let resolver = DependencyResolver::new();
        let t1 = task_with_deps("t1", &[]);
        let t2 = task_with_deps("t2", &["t1"]);
        let ready = resolver.register_resumed("wf1", &[t1, t2], &HashSet::new());
        assert_eq!(ready, vec!["t1".to_string()]);
    }
}
