//! Parameter substitution (C5, spec.md §4.5).
//!
//! Walks a task's `params` looking for `${TASK_ID.field.path}` references
//! into completed sibling results. A whole-string reference (the entire
//! string value is exactly one reference, nothing else) substitutes the
//! native JSON value; a reference embedded among other text is spliced in
//! as text. Substitution never fails: an unresolvable reference is logged
//! and left as whatever was resolved furthest along its path (or
//! untouched if nothing resolved at all), per spec.md §4.5 "fall back
//! gracefully rather than aborting the task".
//!
//! Implemented as a hand-rolled scanner rather than a regex crate, per
//! spec.md §9's explicit design note — the reference grammar is simple
//! enough that a scanner is both faster and easier to reason about at the
//! edge cases (unterminated `${`, back-to-back references).

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use flowmesh_core::{TaskId, TaskResult};

/// Find every `${...}` span in `s`. A dangling `${` with no closing `}`
/// ends the scan; an empty `${}` is not a valid reference and is skipped.
fn find_references(s: &str) -> Vec<(usize, usize, String)> {
    let mut refs = Vec::new();
    let mut i = 0;
    while i + 1 < s.len() {
        if s.as_bytes()[i] == b'$' && s.as_bytes()[i + 1] == b'{' {
            match s[i + 2..].find('}') {
                Some(rel_end) => {
                    let end = i + 2 + rel_end + 1;
                    let path = &s[i + 2..i + 2 + rel_end];
                    if !path.is_empty() {
                        refs.push((i, end, path.to_string()));
                    }
                    i = end;
                }
                None => break,
            }
        } else {
            i += 1;
        }
    }
    refs
}

enum Resolved {
    /// The full `TASK_ID.field.path` navigated successfully.
    Full(Value),
    /// Navigation stopped partway; this is the last value reached.
    Partial(Value),
    /// The task id itself is unknown, or has no completed result yet.
    Missing,
}

fn resolve_reference(path_expr: &str, results: &BTreeMap<TaskId, TaskResult>) -> Resolved {
    let mut segments = path_expr.split('.');
    let Some(task_id) = segments.next() else {
        return Resolved::Missing;
    };
    let Some(result) = results.get(task_id) else {
        return Resolved::Missing;
    };
    let Some(root) = result.result.as_ref().filter(|_| result.is_completed()) else {
        return Resolved::Missing;
    };

    let mut current = root;
    for field in segments {
        match current.get(field) {
            Some(next) => current = next,
            None => return Resolved::Partial(current.clone()),
        }
    }
    Resolved::Full(current.clone())
}

fn serialize_embedded(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn substitute_string(s: &str, results: &BTreeMap<TaskId, TaskResult>) -> Value {
    let refs = find_references(s);
    if refs.is_empty() {
        return Value::String(s.to_string());
    }

    let whole_string_reference = refs.len() == 1 && refs[0].0 == 0 && refs[0].1 == s.len();
    if whole_string_reference {
        let (_, _, path) = &refs[0];
        return match resolve_reference(path, results) {
            Resolved::Full(v) | Resolved::Partial(v) => v,
            Resolved::Missing => {
                warn!(reference = %path, "substitution reference did not resolve, leaving literal");
                Value::String(s.to_string())
            }
        };
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (start, end, path) in &refs {
        out.push_str(&s[cursor..*start]);
        match resolve_reference(path, results) {
            Resolved::Full(v) | Resolved::Partial(v) => out.push_str(&serialize_embedded(&v)),
            Resolved::Missing => {
                warn!(reference = %path, "substitution reference did not resolve, leaving literal");
                out.push_str(&s[*start..*end]);
            }
        }
        cursor = *end;
    }
    out.push_str(&s[cursor..]);
    Value::String(out)
}

/// Recursively substitute every string leaf of `params`, leaving objects,
/// arrays and non-string scalars otherwise untouched. Called on a fresh
/// clone of the task's declared params for every dispatch attempt
/// (spec.md §4.5: "substitution runs once per attempt, against whatever
/// results exist at that moment").
pub fn substitute_params(params: &Value, results: &BTreeMap<TaskId, TaskResult>) -> Value {
    match params {
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_params(v, results))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_params(v, results)).collect()),
        Value::String(s) => substitute_string(s, results),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn completed(task_id: &str, result: Value) -> (TaskId, TaskResult) {
        (task_id.to_string(), TaskResult::completed(task_id, None, result, Utc::now(), 1))
    }

    #[test]
    fn whole_string_reference_yields_native_value() {
        let results = BTreeMap::from([completed("t1", json!({"sum": 5}))]);
        let params = json!({"x": "${t1.sum}"});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"x": 5}));
    }

    #[test]
    fn embedded_reference_yields_interpolated_text() {
        let results = BTreeMap::from([completed("t1", json!({"sum": 5}))]);
        let params = json!({"text": "result=${t1.sum}"});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"text": "result=5"}));
    }

    #[test]
    fn whole_array_result_substitutes_as_native_array() {
        let results = BTreeMap::from([completed("t1", json!([1, 2, 3]))]);
        let params = json!({"items": "${t1}"});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn unresolvable_reference_is_left_untouched() {
        let results: BTreeMap<TaskId, TaskResult> = BTreeMap::new();
        let params = json!({"x": "${ghost.sum}"});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"x": "${ghost.sum}"}));
    }

    #[test]
    fn partial_path_substitutes_the_last_resolved_value() {
        let results = BTreeMap::from([completed("t1", json!({"sum": 5}))]);
        let params = json!({"x": "${t1.sum.nonexistent}"});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"x": 5}));
    }

    #[test]
    fn nested_objects_and_arrays_are_walked() {
        let results = BTreeMap::from([completed("t1", json!({"sum": 5}))]);
        let params = json!({"outer": {"inner": ["${t1.sum}", "literal"]}});
        let out = substitute_params(&params, &results);
        assert_eq!(out, json!({"outer": {"inner": [5, "literal"]}}));
    }

    proptest::proptest! {
        #[test]
        fn substitution_is_idempotent(sum in 0i64..1000) {
            let results = BTreeMap::from([completed("t1", json!({"sum": sum}))]);
            let params = json!({"text": "result=${t1.sum}", "native": "${t1.sum}"});
            let once = substitute_params(&params, &results);
            let twice = substitute_params(&once, &results);
            prop_assert_eq!(once, twice);
        }
    }
}
