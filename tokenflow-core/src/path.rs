use serde_json::{Map, Value};

use crate::error::CoordinatorError;
use crate::types::ContextSnapshot;

/// Root path of every run's lineage.
pub const ROOT_PATH: &str = "root";

// ─── Reads ────────────────────────────────────────────────────

/// Walk `path` ("a.b.c") inside a JSON value. `None` means missing (any
/// intermediate non-object ends the walk), distinct from a stored literal
/// null (`Some(Value::Null)`).
pub fn resolve_in<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Resolve a dotted path against the three context sections. The first
/// segment selects `input`, `state` or `output`; otherwise the lookup falls
/// back to a merged view where `output` shadows `state` shadows `input`.
pub fn resolve<'a>(ctx: &'a ContextSnapshot, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };
    match head {
        "input" => resolve_in(&ctx.input, rest),
        "state" => resolve_in(&ctx.state, rest),
        "output" => resolve_in(&ctx.output, rest),
        _ => resolve_in(&ctx.output, path)
            .or_else(|| resolve_in(&ctx.state, path))
            .or_else(|| resolve_in(&ctx.input, path)),
    }
}

// ─── Writes ───────────────────────────────────────────────────

/// Mutable context sections. `input` is read-only after initialization and
/// therefore not a valid write target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    State,
    Output,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Section::State => "state",
            Section::Output => "output",
        }
    }
}

/// Split a write target like `state.votes` into its section and inner path.
pub fn parse_target(target: &str) -> Result<(Section, &str), CoordinatorError> {
    let (head, rest) = match target.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (target, ""),
    };
    match head {
        "state" => Ok((Section::State, rest)),
        "output" => Ok((Section::Output, rest)),
        "input" => Err(CoordinatorError::Validation(format!(
            "context target '{target}' writes to the read-only input section"
        ))),
        _ => Err(CoordinatorError::Validation(format!(
            "context target '{target}' must start with 'state' or 'output'"
        ))),
    }
}

/// Set `path` inside `root` to `value`, creating intermediate objects.
/// Intermediate non-objects are replaced; an empty path replaces the root.
pub fn set_in(root: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for segment in &segments[..segments.len() - 1] {
        let map = current.as_object_mut().expect("object ensured above");
        let next = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        current = next;
    }
    let map = current.as_object_mut().expect("object ensured above");
    map.insert(segments[segments.len() - 1].to_string(), value);
}

/// Shallow right-biased merge of `patch` into `base`. Non-object patches
/// replace the base wholesale.
pub fn merge_shallow(base: &mut Value, patch: &Value) {
    match (base.is_object(), patch) {
        (true, Value::Object(fields)) => {
            let map = base.as_object_mut().expect("checked above");
            for (k, v) in fields {
                map.insert(k.clone(), v.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

// ─── Lineage paths ────────────────────────────────────────────

/// Child path on fan-out: `{parent}.{node_id}.{branch_index}`. Continuations
/// (branch_total == 1) keep the parent path unchanged; callers only invoke
/// this for real fan-outs.
pub fn extend_path(parent: &str, node_id: &str, branch_index: u32) -> String {
    format!("{parent}.{node_id}.{branch_index}")
}

/// The fan-out instance prefix shared by all siblings: the token's path with
/// its trailing `.{branch_index}` segment removed. Tokens outside a fan-out
/// (branch_total == 1) use their path as-is.
pub fn sibling_prefix(path_id: &str, branch_total: u32, branch_index: u32) -> String {
    if branch_total > 1 {
        let suffix = format!(".{branch_index}");
        if let Some(stripped) = path_id.strip_suffix(suffix.as_str()) {
            return stripped.to_string();
        }
    }
    path_id.to_string()
}

/// Fan-in identity: unique per fan-out instance and synchronizing
/// transition, stable across sibling arrivals.
pub fn fan_in_path(sibling_prefix: &str, transition_id: &str) -> String {
    format!("{sibling_prefix}:{transition_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ContextSnapshot {
        ContextSnapshot {
            input: json!({"customer": {"tier": "gold"}, "region": "emea"}),
            state: json!({"score": 85, "flags": {"checked": null}}),
            output: json!({"region": "apac"}),
        }
    }

    #[test]
    fn resolves_section_prefixed_paths() {
        let ctx = ctx();
        assert_eq!(resolve(&ctx, "input.customer.tier"), Some(&json!("gold")));
        assert_eq!(resolve(&ctx, "state.score"), Some(&json!(85)));
        assert_eq!(resolve(&ctx, "output.region"), Some(&json!("apac")));
    }

    #[test]
    fn missing_is_distinct_from_literal_null() {
        let ctx = ctx();
        assert_eq!(resolve(&ctx, "state.flags.checked"), Some(&Value::Null));
        assert_eq!(resolve(&ctx, "state.flags.nope"), None);
        // Intermediate non-object ends the walk as missing.
        assert_eq!(resolve(&ctx, "state.score.deep"), None);
    }

    #[test]
    fn unprefixed_paths_fall_back_with_output_precedence() {
        let ctx = ctx();
        assert_eq!(resolve(&ctx, "region"), Some(&json!("apac")));
        assert_eq!(resolve(&ctx, "score"), Some(&json!(85)));
        assert_eq!(resolve(&ctx, "customer.tier"), Some(&json!("gold")));
        assert_eq!(resolve(&ctx, "nowhere"), None);
    }

    #[test]
    fn set_in_creates_intermediate_objects() {
        let mut root = json!({});
        set_in(&mut root, "a.b.c", json!(1));
        assert_eq!(root, json!({"a": {"b": {"c": 1}}}));
        set_in(&mut root, "a.b.c", json!(2));
        assert_eq!(root, json!({"a": {"b": {"c": 2}}}));
        // Scalar in the middle is replaced by an object.
        set_in(&mut root, "a.b.c.d", json!(3));
        assert_eq!(root, json!({"a": {"b": {"c": {"d": 3}}}}));
    }

    #[test]
    fn parse_target_rejects_input_writes() {
        assert!(parse_target("state.votes").is_ok());
        assert!(parse_target("output").is_ok());
        assert!(parse_target("input.x").is_err());
        assert!(parse_target("votes").is_err());
    }

    #[test]
    fn merge_shallow_is_right_biased() {
        let mut base = json!({"a": 1, "b": 1});
        merge_shallow(&mut base, &json!({"b": 2, "c": 3}));
        assert_eq!(base, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn sibling_prefix_strips_only_fanout_members() {
        assert_eq!(sibling_prefix("root.judge.2", 3, 2), "root.judge");
        assert_eq!(sibling_prefix("root", 1, 0), "root");
        // Nested fan-out keeps the outer lineage.
        assert_eq!(sibling_prefix("root.a.1.b.0", 2, 0), "root.a.1.b");
    }

    #[test]
    fn path_building_round_trips() {
        let child = extend_path("root", "judge", 2);
        assert_eq!(child, "root.judge.2");
        assert_eq!(sibling_prefix(&child, 3, 2), "root.judge");
    }
}
