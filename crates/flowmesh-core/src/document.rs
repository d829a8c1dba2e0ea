//! Workflow document parsing (spec.md §6 "Workflow document").
//!
//! The persistable YAML/JSON document shape is parsed via one `serde`
//! struct shared by both a YAML (`serde_yaml`) and JSON (`serde_json`)
//! deserializer (SPEC_FULL.md §6 ambient note); dependency names are
//! resolved to ids once, at load time, before DAG registration. A task's
//! `params` get the same treatment: any `${name.path}` substitution
//! reference naming a sibling by `name` is rewritten to name its
//! generated task id, since substitution itself only ever resolves
//! references against a results map keyed by id.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::task::{duration_seconds, BackoffStrategy, Priority, RetryConfig, Task, TaskStatus};
use crate::workflow::{ErrorStrategy, Workflow};

/// On-the-wire retry block of a task document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDocument {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, with = "duration_seconds")]
    pub base_delay: Duration,
    #[serde(default, with = "duration_seconds")]
    pub max_delay: Duration,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_jitter() -> bool {
    true
}

impl From<RetryDocument> for RetryConfig {
    fn from(doc: RetryDocument) -> Self {
        RetryConfig {
            max_attempts: doc.max_attempts,
            backoff_strategy: doc.strategy,
            base_delay: doc.base_delay,
            max_delay: if doc.max_delay.is_zero() {
                Duration::from_secs(60)
            } else {
                doc.max_delay
            },
            jitter: doc.jitter,
        }
    }
}

/// On-the-wire task document. `id` is auto-generated if absent; `timeout`
/// is in seconds; `dependencies` may name a prior task by `name` or `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub protocol: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry: Option<RetryDocument>,
}

/// On-the-wire workflow document, the canonical field set from spec.md
/// §6's YAML/JSON layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDocument>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DocumentError {
    #[error("failed to parse workflow document: {0}")]
    Parse(String),
    #[error("task '{0}' depends on unknown task name or id '{1}'")]
    UnknownDependency(String, String),
    #[error("duplicate task id '{0}' in workflow document")]
    DuplicateTaskId(String),
}

/// Rewrite the leading `TASK_ID` segment of every `${TASK_ID.path}`
/// reference in `s` through `name_to_id`, leaving anything already
/// naming a task id (or naming nothing we recognize) untouched.
/// Substitution (`flowmesh-engine::substitution`) resolves references
/// strictly by task id against a results map keyed by id, so a
/// document that refers to an upstream task by its `name` (spec.md §6:
/// "dependencies may reference prior tasks by name ... or by id") must
/// have that same name rewritten here, the same way `dependencies`
/// entries are resolved above — a hand-rolled scanner, not a regex
/// engine, mirroring `substitution.rs`'s own reference grammar.
fn remap_task_id_references(s: &str, name_to_id: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s.as_bytes()[i] == b'$' && i + 1 < s.len() && s.as_bytes()[i + 1] == b'{' {
            if let Some(rel_end) = s[i + 2..].find('}') {
                let end = i + 2 + rel_end + 1;
                let path = &s[i + 2..i + 2 + rel_end];
                if !path.is_empty() {
                    let mut parts = path.splitn(2, '.');
                    let head = parts.next().unwrap_or("");
                    let rest = parts.next();
                    let resolved_head = name_to_id.get(head).map(String::as_str).unwrap_or(head);
                    out.push_str("${");
                    out.push_str(resolved_head);
                    if let Some(rest) = rest {
                        out.push('.');
                        out.push_str(rest);
                    }
                    out.push('}');
                    i = end;
                    continue;
                }
            }
        }
        let ch = s[i..].chars().next().unwrap_or('\u{0}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Recursively rewrite every string leaf of a task document's `params`
/// through `remap_task_id_references`, leaving objects, arrays and
/// non-string scalars untouched.
fn remap_params(value: Value, name_to_id: &HashMap<String, String>) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, remap_params(v, name_to_id))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| remap_params(v, name_to_id)).collect()),
        Value::String(s) => Value::String(remap_task_id_references(&s, name_to_id)),
        other => other,
    }
}

impl WorkflowDocument {
    pub fn from_yaml(input: &str) -> Result<Self, DocumentError> {
        serde_yaml::from_str(input).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    pub fn from_json(input: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(input).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).expect("WorkflowDocument always serializes")
    }

    /// Expand this document into a `Workflow`, generating task ids where
    /// absent and resolving `dependencies` entries (task name or id) to
    /// concrete task ids.
    pub fn into_workflow(self) -> Result<Workflow, DocumentError> {
        let workflow_id = self.id.unwrap_or_else(|| Uuid::now_v7().to_string());

        // First pass: assign ids, detect duplicates, build name->id map.
        let mut name_to_id: HashMap<String, String> = HashMap::new();
        let mut assigned_ids: BTreeSet<String> = BTreeSet::new();
        let mut staged: Vec<(TaskDocument, String)> = Vec::with_capacity(self.tasks.len());
        for doc in self.tasks {
            let id = doc.id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());
            if !assigned_ids.insert(id.clone()) {
                return Err(DocumentError::DuplicateTaskId(id));
            }
            name_to_id.insert(doc.name.clone(), id.clone());
            staged.push((doc, id));
        }

        // Second pass: resolve dependency references and build Task.
        let mut tasks = Vec::with_capacity(staged.len());
        for (doc, id) in staged {
            let mut dependencies = BTreeSet::new();
            for dep_ref in &doc.dependencies {
                let resolved = name_to_id
                    .get(dep_ref)
                    .cloned()
                    .or_else(|| assigned_ids.contains(dep_ref).then(|| dep_ref.clone()))
                    .ok_or_else(|| DocumentError::UnknownDependency(doc.name.clone(), dep_ref.clone()))?;
                dependencies.insert(resolved);
            }

            let mut task = Task::new(id, doc.protocol, doc.method);
            task.name = Some(doc.name);
            task.workflow_id = Some(workflow_id.clone());
            task.params = remap_params(doc.params, &name_to_id);
            task.dependencies = dependencies;
            task.priority = doc.priority;
            task.timeout = doc.timeout.map(Duration::from_secs_f64);
            task.retry_config = doc.retry.map(RetryConfig::from).unwrap_or_default();
            task.status = TaskStatus::Pending;
            tasks.push(task);
        }

        let mut workflow = Workflow::new(workflow_id, self.name, tasks);
        workflow.description = self.description;
        workflow.error_strategy = self.error_strategy;
        workflow.max_parallel = self.max_parallel;
        workflow.tags = self.tags;
        workflow.metadata = self.metadata;
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
name: calc-then-print
tasks:
  - name: t1
    protocol: math/v1
    method: add
    params: {a: 2, b: 3}
  - name: t2
    protocol: print/v1
    method: echo
    dependencies: [t1]
    params: {text: "result=${t1.sum}"}
"#
    }

    #[test]
    fn parses_yaml_and_resolves_name_dependencies() {
        let doc = WorkflowDocument::from_yaml(sample_yaml()).unwrap();
        let workflow = doc.into_workflow().unwrap();
        assert_eq!(workflow.tasks.len(), 2);
        let t1_id = workflow.tasks[0].id.clone();
        assert_eq!(workflow.tasks[1].dependencies, BTreeSet::from([t1_id]));
    }

    #[test]
    fn params_references_by_name_are_remapped_to_the_generated_id() {
        let doc = WorkflowDocument::from_yaml(sample_yaml()).unwrap();
        let workflow = doc.into_workflow().unwrap();
        let t1_id = workflow.tasks[0].id.clone();
        assert_eq!(workflow.tasks[1].params, serde_json::json!({"text": format!("result=${{{t1_id}.sum}}")}));
    }

    #[test]
    fn whole_string_reference_by_name_is_also_remapped() {
        let yaml = r#"
name: calc-then-print
tasks:
  - name: sum
    protocol: math/v1
    method: add
    params: {a: 2, b: 40}
  - name: report
    protocol: print/v1
    method: echo
    dependencies: [sum]
    params: {text: "the sum is ${sum.sum}", items: "${sum}"}
"#;
        let doc = WorkflowDocument::from_yaml(yaml).unwrap();
        let workflow = doc.into_workflow().unwrap();
        let sum_id = workflow.tasks[0].id.clone();
        assert_eq!(
            workflow.tasks[1].params,
            serde_json::json!({
                "text": format!("the sum is ${{{sum_id}.sum}}"),
                "items": format!("${{{sum_id}}}"),
            })
        );
    }

    #[test]
    fn rejects_unknown_dependency_name() {
        let yaml = r#"
name: broken
tasks:
  - name: t1
    protocol: math/v1
    method: add
    dependencies: [nonexistent]
"#;
        let doc = WorkflowDocument::from_yaml(yaml).unwrap();
        let err = doc.into_workflow().unwrap_err();
        assert!(matches!(err, DocumentError::UnknownDependency(_, _)));
    }

    #[test]
    fn auto_generates_task_id_when_absent() {
        let doc = WorkflowDocument::from_yaml(sample_yaml()).unwrap();
        let workflow = doc.into_workflow().unwrap();
        assert!(!workflow.tasks[0].id.is_empty());
    }

    #[test]
    fn json_and_yaml_parse_to_equivalent_workflow() {
        let yaml_doc = WorkflowDocument::from_yaml(sample_yaml()).unwrap();
        let json = serde_json::to_string(&yaml_doc).unwrap();
        let json_doc = WorkflowDocument::from_json(&json).unwrap();
        assert_eq!(yaml_doc.name, json_doc.name);
        assert_eq!(yaml_doc.tasks.len(), json_doc.tasks.len());
    }

    #[test]
    fn dependency_by_explicit_id_resolves() {
        let yaml = r#"
name: by-id
tasks:
  - id: fixed-1
    name: t1
    protocol: math/v1
    method: add
  - name: t2
    protocol: math/v1
    method: add
    dependencies: [fixed-1]
"#;
        let doc = WorkflowDocument::from_yaml(yaml).unwrap();
        let workflow = doc.into_workflow().unwrap();
        assert!(workflow.tasks[1].dependencies.contains("fixed-1"));
    }
}
