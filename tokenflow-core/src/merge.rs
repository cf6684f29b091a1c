use serde_json::{Map, Value};

use crate::error::CoordinatorError;
use crate::path;
use crate::types::BranchOutput;

/// Default field read out of each branch row when a merge names no source.
pub const DEFAULT_MERGE_SOURCE: &str = "_branch.output";

/// Reduce collected branch outputs into a single value.
///
/// Records are sorted by `branch_index` (ties broken by `token_id`) before
/// the strategy applies, so the result is deterministic regardless of
/// completion order. Branches whose output was never collected (failed
/// siblings with dropped tables) simply do not appear in `records`.
pub fn apply(strategy: &str, records: &[BranchOutput]) -> Result<Value, CoordinatorError> {
    let mut sorted: Vec<&BranchOutput> = records.iter().collect();
    sorted.sort_by(|a, b| {
        a.branch_index
            .cmp(&b.branch_index)
            .then_with(|| a.token_id.cmp(&b.token_id))
    });

    match strategy {
        "append" | "collect" => Ok(Value::Array(
            sorted.iter().map(|b| b.output.clone()).collect(),
        )),
        "merge_object" => {
            let mut merged = Map::new();
            for branch in &sorted {
                match &branch.output {
                    Value::Object(fields) => {
                        for (k, v) in fields {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    other => {
                        return Err(CoordinatorError::Merge(format!(
                            "merge_object requires object outputs, branch {} produced {other}",
                            branch.branch_index
                        )));
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        "keyed_by_branch" => {
            let mut keyed = Map::new();
            for branch in &sorted {
                keyed.insert(branch.branch_index.to_string(), branch.output.clone());
            }
            Ok(Value::Object(keyed))
        }
        "last_wins" => Ok(sorted
            .last()
            .map(|b| b.output.clone())
            .unwrap_or_else(|| Value::Object(Map::new()))),
        unknown => Err(CoordinatorError::Merge(format!(
            "unknown merge strategy '{unknown}'"
        ))),
    }
}

/// Resolve the configured source field out of each raw branch row, skipping
/// rows where the field is missing.
pub fn collect_outputs(
    rows: &[(uuid::Uuid, u32, Value)],
    source: Option<&str>,
) -> Vec<BranchOutput> {
    let source = source.unwrap_or(DEFAULT_MERGE_SOURCE);
    rows.iter()
        .filter_map(|(token_id, branch_index, row)| {
            path::resolve_in(row, source).map(|value| BranchOutput {
                token_id: *token_id,
                branch_index: *branch_index,
                output: value.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn branch(index: u32, output: Value) -> BranchOutput {
        BranchOutput {
            token_id: Uuid::now_v7(),
            branch_index: index,
            output,
        }
    }

    #[test]
    fn append_preserves_index_order_not_arrival_order() {
        let records = vec![
            branch(2, json!("A")),
            branch(0, json!("B")),
            branch(1, json!("C")),
        ];
        assert_eq!(apply("append", &records).unwrap(), json!(["B", "C", "A"]));
    }

    #[test]
    fn collect_is_append_without_flattening() {
        let records = vec![branch(0, json!(["x"])), branch(1, json!(["y"]))];
        assert_eq!(
            apply("collect", &records).unwrap(),
            json!([["x"], ["y"]])
        );
    }

    #[test]
    fn singleton_laws() {
        let only = vec![branch(0, json!({"vote": "A"}))];
        assert_eq!(apply("append", &only).unwrap(), json!([{"vote": "A"}]));
        assert_eq!(apply("last_wins", &only).unwrap(), json!({"vote": "A"}));
    }

    #[test]
    fn merge_object_is_right_biased_on_collisions() {
        let records = vec![
            branch(0, json!({"k": "low", "a": 1})),
            branch(1, json!({"k": "high", "b": 2})),
        ];
        assert_eq!(
            apply("merge_object", &records).unwrap(),
            json!({"k": "high", "a": 1, "b": 2})
        );
    }

    #[test]
    fn merge_object_rejects_scalar_branches() {
        let records = vec![branch(0, json!(1))];
        assert!(matches!(
            apply("merge_object", &records),
            Err(CoordinatorError::Merge(_))
        ));
    }

    #[test]
    fn keyed_by_branch_keys_are_present_indices() {
        let records = vec![branch(0, json!("a")), branch(2, json!("c"))];
        assert_eq!(
            apply("keyed_by_branch", &records).unwrap(),
            json!({"0": "a", "2": "c"})
        );
    }

    #[test]
    fn last_wins_takes_highest_index_and_defaults_empty() {
        let records = vec![branch(1, json!("mid")), branch(4, json!("top"))];
        assert_eq!(apply("last_wins", &records).unwrap(), json!("top"));
        assert_eq!(apply("last_wins", &[]).unwrap(), json!({}));
    }

    #[test]
    fn unknown_strategy_is_a_merge_error() {
        assert!(matches!(
            apply("zip", &[]),
            Err(CoordinatorError::Merge(_))
        ));
    }

    #[test]
    fn collect_outputs_resolves_source_and_skips_missing() {
        let id0 = Uuid::now_v7();
        let id1 = Uuid::now_v7();
        let rows = vec![
            (id0, 0, json!({"_branch": {"output": {"vote": "A"}}})),
            (id1, 1, json!({})), // failed sibling: nothing collected
        ];
        let outputs = collect_outputs(&rows, Some("_branch.output.vote"));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output, json!("A"));
        let defaults = collect_outputs(&rows, None);
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].output, json!({"vote": "A"}));
    }
}
