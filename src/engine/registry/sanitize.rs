//! Repair of console state restored from session storage.
//!
//! Input is untrusted: it may be truncated, hand-edited, or written by an
//! older build. Parsing goes through `serde_json::Value` so one bad record
//! never discards the rest.

use serde_json::Value;

use crate::models::{ConsoleState, RunRecord};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sanitized {
    pub state: ConsoleState,
    /// Human-readable description of every repair made.
    pub repairs: Vec<String>,
}

impl Sanitized {
    pub fn changed(&self) -> bool {
        !self.repairs.is_empty()
    }
}

pub fn sanitize(raw: &str) -> Sanitized {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return Sanitized {
                state: ConsoleState::default(),
                repairs: vec![format!("discarded corrupt state: {e}")],
            }
        }
    };
    sanitize_value(value)
}

pub fn sanitize_value(value: Value) -> Sanitized {
    let mut repairs = Vec::new();
    let Value::Object(mut root) = value else {
        return Sanitized {
            state: ConsoleState::default(),
            repairs: vec!["discarded non-object state".into()],
        };
    };

    let mut state = ConsoleState {
        expanded: root.get("expanded").and_then(Value::as_bool).unwrap_or(false),
        panel_size: root.get("panelSize").and_then(as_u32),
        font_size: root.get("fontSize").and_then(as_u32),
        ..ConsoleState::default()
    };

    // Runs
    match root.remove("runs") {
        Some(Value::Object(runs)) => {
            for (key, raw) in runs {
                if key.trim().is_empty() {
                    repairs.push("dropped run with empty id".into());
                    continue;
                }
                if !raw.is_object() {
                    repairs.push(format!("dropped malformed run {key}"));
                    continue;
                }
                match serde_json::from_value::<RunRecord>(raw) {
                    Ok(mut run) => {
                        if run.run_id != key {
                            repairs.push(format!("re-keyed run {} as {}", run.run_id, key));
                            run.run_id = key.clone();
                        }
                        state.runs.insert(key, run);
                    }
                    Err(e) => repairs.push(format!("dropped malformed run {key}: {e}")),
                }
            }
        }
        None | Some(Value::Null) => {}
        Some(_) => repairs.push("discarded non-object run map".into()),
    }

    // Order
    match root.remove("runOrder") {
        Some(Value::Array(order)) => {
            for entry in order {
                match entry {
                    Value::String(id) if state.runs.contains_key(&id) => {
                        if state.run_order.contains(&id) {
                            repairs.push(format!("dropped duplicate order entry {id}"));
                        } else {
                            state.run_order.push(id);
                        }
                    }
                    Value::String(id) => repairs.push(format!("dropped orphan order entry {id}")),
                    other => repairs.push(format!("dropped invalid order entry {other}")),
                }
            }
        }
        None | Some(Value::Null) => {}
        Some(_) => repairs.push("discarded non-array run order".into()),
    }

    let mut missing: Vec<&RunRecord> = state
        .runs
        .values()
        .filter(|run| !state.run_order.contains(&run.run_id))
        .collect();
    missing.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
    let missing: Vec<String> = missing.into_iter().map(|run| run.run_id.clone()).collect();
    for id in missing {
        repairs.push(format!("appended unordered run {id}"));
        state.run_order.push(id);
    }

    // Active selection
    match root.remove("activeRunId") {
        Some(Value::String(id)) if state.runs.contains_key(&id) => state.active_run_id = Some(id),
        None | Some(Value::Null) => {}
        Some(other) => {
            state.active_run_id = state.run_order.last().cloned();
            repairs.push(format!(
                "active run {other} is not tracked, selected {}",
                state.active_run_id.as_deref().unwrap_or("none")
            ));
        }
    }

    Sanitized { state, repairs }
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunMeta, RunStatus};
    use proptest::prelude::*;
    use serde_json::json;

    fn run_json(id: &str) -> Value {
        serde_json::to_value(RunRecord::new(id, RunMeta::new("Tailor", "tailor"), RunStatus::Success, 80)).unwrap()
    }

    #[test]
    fn test_duplicate_null_and_orphan_order_entries() {
        let out = sanitize_value(json!({
            "runOrder": ["a", "a", null, "b"],
            "runs": { "a": run_json("a") },
            "activeRunId": "a"
        }));
        assert_eq!(out.state.run_order, vec!["a"]);
        assert_eq!(out.state.active_run_id.as_deref(), Some("a"));
        assert!(out.changed());
    }

    #[test]
    fn test_clean_state_is_unchanged() {
        let mut state = ConsoleState::default();
        for id in ["a", "b"] {
            state.runs.insert(id.into(), RunRecord::new(id, RunMeta::default(), RunStatus::Running, 80));
            state.run_order.push(id.into());
        }
        state.active_run_id = Some("b".into());
        state.panel_size = Some(320);

        let out = sanitize(&serde_json::to_string(&state).unwrap());
        assert!(!out.changed(), "{:?}", out.repairs);
        assert_eq!(out.state, state);
    }

    #[test]
    fn test_malformed_runs_and_dangling_active() {
        let out = sanitize_value(json!({
            "expanded": true,
            "runOrder": ["a", "b", "c"],
            "runs": {
                "a": run_json("a"),
                "b": null,
                "c": { "runId": "c", "status": 7 }
            },
            "activeRunId": "c"
        }));
        assert!(out.state.expanded);
        assert_eq!(out.state.run_order, vec!["a"]);
        assert_eq!(out.state.active_run_id.as_deref(), Some("a"));
        assert_eq!(out.state.runs.len(), 1);
    }

    #[test]
    fn test_run_id_follows_map_key_and_unordered_runs_are_appended() {
        let out = sanitize_value(json!({
            "runs": { "a": run_json("zzz") },
            "runOrder": []
        }));
        assert_eq!(out.state.runs["a"].run_id, "a");
        assert_eq!(out.state.run_order, vec!["a"]);
        assert_eq!(out.repairs.len(), 2);
    }

    #[test]
    fn test_corrupt_json_yields_default() {
        let out = sanitize("{\"runs\": {\"a\": ");
        assert!(out.changed());
        assert_eq!(out.state, ConsoleState::default());
        assert!(sanitize("[1,2]").changed());
    }

    proptest! {
        #[test]
        fn prop_order_is_unique_and_complete(
            present in proptest::collection::btree_set("[a-e]", 0..5),
            order in proptest::collection::vec(proptest::option::of("[a-g]"), 0..12),
        ) {
            let runs: serde_json::Map<String, Value> =
                present.iter().map(|id| (id.clone(), run_json(id))).collect();
            let out = sanitize_value(json!({ "runs": runs, "runOrder": order }));

            let mut seen = std::collections::HashSet::new();
            for id in &out.state.run_order {
                prop_assert!(out.state.runs.contains_key(id));
                prop_assert!(seen.insert(id.clone()));
            }
            prop_assert_eq!(out.state.run_order.len(), out.state.runs.len());
            prop_assert_eq!(out.state.runs.len(), present.len());
        }
    }
}
