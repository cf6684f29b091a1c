use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::CoordinatorError;
use crate::path;
use crate::types::ContextSnapshot;

/// Recursion guard for pathological ASTs.
const MAX_EVAL_DEPTH: usize = 64;

// ─── AST ──────────────────────────────────────────────────────

/// Pre-parsed expression AST, consumed as data. Conditions and mappings are
/// both `Expr`; a null condition on a transition means `true`.
///
/// Operators cover equality, ordering, membership, length, logicals and
/// ternary. Anything the evaluator cannot type signals `EvaluationError`;
/// there is no coercion fallback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Expr {
    Literal {
        value: Value,
    },
    /// Dotted context lookup; missing paths evaluate to null.
    Path {
        path: String,
    },
    Eq {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ne {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Lt {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Le {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Gt {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ge {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Membership: item ∈ collection (array element or substring).
    In {
        item: Box<Expr>,
        collection: Box<Expr>,
    },
    /// Reverse membership, for `collection contains item` spellings.
    Contains {
        collection: Box<Expr>,
        item: Box<Expr>,
    },
    /// Length of an array, object or string.
    Len {
        of: Box<Expr>,
    },
    And {
        args: Vec<Expr>,
    },
    Or {
        args: Vec<Expr>,
    },
    Not {
        of: Box<Expr>,
    },
    /// Ternary.
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Shorthand used throughout tests and fixtures.
    pub fn path(p: impl Into<String>) -> Self {
        Expr::Path { path: p.into() }
    }

    pub fn lit(value: Value) -> Self {
        Expr::Literal { value }
    }
}

// ─── Evaluation context ───────────────────────────────────────

/// The roots visible to an expression: the three context sections, plus
/// `result` (the completing task's output) during output mapping.
#[derive(Clone, Copy, Debug)]
pub struct EvalContext<'a> {
    pub ctx: &'a ContextSnapshot,
    pub result: Option<&'a Value>,
}

impl<'a> EvalContext<'a> {
    pub fn new(ctx: &'a ContextSnapshot) -> Self {
        Self { ctx, result: None }
    }

    pub fn with_result(ctx: &'a ContextSnapshot, result: &'a Value) -> Self {
        Self {
            ctx,
            result: Some(result),
        }
    }

    fn lookup(&self, p: &str) -> Option<&'a Value> {
        if let Some(result) = self.result {
            if p == "result" {
                return Some(result);
            }
            if let Some(rest) = p.strip_prefix("result.") {
                return path::resolve_in(result, rest);
            }
        }
        path::resolve(self.ctx, p)
    }
}

// ─── Evaluation ───────────────────────────────────────────────

/// Evaluate a condition: null ≡ true, otherwise the expression's value
/// coerced to boolean. Pure: the context is never mutated.
pub fn evaluate_condition(
    condition: Option<&Expr>,
    ctx: &EvalContext<'_>,
) -> Result<bool, CoordinatorError> {
    match condition {
        None => Ok(true),
        Some(expr) => Ok(truthy(&evaluate(expr, ctx)?)),
    }
}

/// Evaluate an expression to a value.
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, CoordinatorError> {
    eval_depth(expr, ctx, 0)
}

fn eval_depth(expr: &Expr, ctx: &EvalContext<'_>, depth: usize) -> Result<Value, CoordinatorError> {
    if depth > MAX_EVAL_DEPTH {
        return Err(CoordinatorError::evaluation(format!(
            "expression nesting exceeds {MAX_EVAL_DEPTH}"
        )));
    }
    match expr {
        Expr::Literal { value } => Ok(value.clone()),

        Expr::Path { path } => Ok(ctx.lookup(path).cloned().unwrap_or(Value::Null)),

        Expr::Eq { left, right } => {
            let l = eval_depth(left, ctx, depth + 1)?;
            let r = eval_depth(right, ctx, depth + 1)?;
            Ok(Value::Bool(values_equal(&l, &r)))
        }
        Expr::Ne { left, right } => {
            let l = eval_depth(left, ctx, depth + 1)?;
            let r = eval_depth(right, ctx, depth + 1)?;
            Ok(Value::Bool(!values_equal(&l, &r)))
        }

        Expr::Lt { left, right } => ordered(left, right, ctx, depth, |o| o.is_lt()),
        Expr::Le { left, right } => ordered(left, right, ctx, depth, |o| o.is_le()),
        Expr::Gt { left, right } => ordered(left, right, ctx, depth, |o| o.is_gt()),
        Expr::Ge { left, right } => ordered(left, right, ctx, depth, |o| o.is_ge()),

        Expr::In { item, collection } => {
            let item = eval_depth(item, ctx, depth + 1)?;
            let collection = eval_depth(collection, ctx, depth + 1)?;
            member_of(&item, &collection).map(Value::Bool)
        }
        Expr::Contains { collection, item } => {
            let collection = eval_depth(collection, ctx, depth + 1)?;
            let item = eval_depth(item, ctx, depth + 1)?;
            member_of(&item, &collection).map(Value::Bool)
        }

        Expr::Len { of } => {
            let value = eval_depth(of, ctx, depth + 1)?;
            let len = match &value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                other => {
                    return Err(CoordinatorError::evaluation(format!(
                        "len of non-collection value: {other}"
                    )));
                }
            };
            Ok(Value::from(len as u64))
        }

        Expr::And { args } => {
            for arg in args {
                if !truthy(&eval_depth(arg, ctx, depth + 1)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or { args } => {
            for arg in args {
                if truthy(&eval_depth(arg, ctx, depth + 1)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Not { of } => Ok(Value::Bool(!truthy(&eval_depth(of, ctx, depth + 1)?))),

        Expr::If {
            cond,
            then,
            otherwise,
        } => {
            if truthy(&eval_depth(cond, ctx, depth + 1)?) {
                eval_depth(then, ctx, depth + 1)
            } else {
                eval_depth(otherwise, ctx, depth + 1)
            }
        }
    }
}

fn ordered(
    left: &Expr,
    right: &Expr,
    ctx: &EvalContext<'_>,
    depth: usize,
    check: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, CoordinatorError> {
    let l = eval_depth(left, ctx, depth + 1)?;
    let r = eval_depth(right, ctx, depth + 1)?;
    let ordering = match (&l, &r) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (number_as_f64(a)?, number_as_f64(b)?);
            a.partial_cmp(&b).ok_or_else(|| {
                CoordinatorError::evaluation("ordering on non-comparable numbers")
            })?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (l, r) => {
            return Err(CoordinatorError::evaluation(format!(
                "ordering requires two numbers or two strings, got {l} and {r}"
            )));
        }
    };
    Ok(Value::Bool(check(ordering)))
}

fn number_as_f64(n: &serde_json::Number) -> Result<f64, CoordinatorError> {
    n.as_f64()
        .ok_or_else(|| CoordinatorError::evaluation(format!("number out of range: {n}")))
}

/// Equality with numeric normalization so `1` and `1.0` compare equal.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => l == r,
    }
}

fn member_of(item: &Value, collection: &Value) -> Result<bool, CoordinatorError> {
    match collection {
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::String(s) => match item {
            Value::String(needle) => Ok(s.contains(needle.as_str())),
            other => Err(CoordinatorError::evaluation(format!(
                "membership in a string requires a string item, got {other}"
            ))),
        },
        other => Err(CoordinatorError::evaluation(format!(
            "membership requires an array or string collection, got {other}"
        ))),
    }
}

/// Boolean coercion: null and false are false; numbers by non-zero; strings,
/// arrays and objects by non-emptiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ─── Mappings ─────────────────────────────────────────────────

/// Evaluate a `target → expression` mapping into a flat record. Used for
/// task input assembly and final-output extraction alike.
pub fn apply_mapping(
    mapping: &BTreeMap<String, Expr>,
    ctx: &EvalContext<'_>,
) -> Result<Value, CoordinatorError> {
    let mut record = Map::new();
    for (target, expr) in mapping {
        record.insert(target.clone(), evaluate(expr, ctx)?);
    }
    Ok(Value::Object(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            input: json!({"threshold": 90, "tags": ["a", "b"]}),
            state: json!({"score": 85, "name": "alpha"}),
            output: json!({}),
        }
    }

    fn eval(expr: &Expr) -> Value {
        let ctx = snapshot();
        evaluate(expr, &EvalContext::new(&ctx)).unwrap()
    }

    #[test]
    fn null_condition_is_true() {
        let ctx = snapshot();
        assert!(evaluate_condition(None, &EvalContext::new(&ctx)).unwrap());
    }

    #[test]
    fn path_lookup_and_missing_as_null() {
        assert_eq!(eval(&Expr::path("state.score")), json!(85));
        assert_eq!(eval(&Expr::path("state.absent")), Value::Null);
    }

    #[test]
    fn equality_normalizes_numbers() {
        let expr = Expr::Eq {
            left: Box::new(Expr::lit(json!(1))),
            right: Box::new(Expr::lit(json!(1.0))),
        };
        assert_eq!(eval(&expr), json!(true));
    }

    #[test]
    fn ordering_on_numbers_and_strings() {
        let lt = Expr::Lt {
            left: Box::new(Expr::path("state.score")),
            right: Box::new(Expr::path("input.threshold")),
        };
        assert_eq!(eval(&lt), json!(true));
        let ge = Expr::Ge {
            left: Box::new(Expr::lit(json!("beta"))),
            right: Box::new(Expr::path("state.name")),
        };
        assert_eq!(eval(&ge), json!(true));
    }

    #[test]
    fn ordering_on_mixed_types_is_an_evaluation_error() {
        let expr = Expr::Lt {
            left: Box::new(Expr::lit(json!("a"))),
            right: Box::new(Expr::lit(json!(1))),
        };
        let ctx = snapshot();
        let err = evaluate(&expr, &EvalContext::new(&ctx)).unwrap_err();
        assert!(matches!(err, CoordinatorError::Evaluation(_)));
    }

    #[test]
    fn membership_and_length() {
        let within = Expr::In {
            item: Box::new(Expr::lit(json!("a"))),
            collection: Box::new(Expr::path("input.tags")),
        };
        assert_eq!(eval(&within), json!(true));
        let contains = Expr::Contains {
            collection: Box::new(Expr::lit(json!("alphabet"))),
            item: Box::new(Expr::lit(json!("pha"))),
        };
        assert_eq!(eval(&contains), json!(true));
        let len = Expr::Len {
            of: Box::new(Expr::path("input.tags")),
        };
        assert_eq!(eval(&len), json!(2));
    }

    #[test]
    fn membership_in_scalar_is_an_evaluation_error() {
        let expr = Expr::In {
            item: Box::new(Expr::lit(json!(1))),
            collection: Box::new(Expr::path("state.score")),
        };
        let ctx = snapshot();
        assert!(matches!(
            evaluate(&expr, &EvalContext::new(&ctx)),
            Err(CoordinatorError::Evaluation(_))
        ));
    }

    #[test]
    fn and_or_short_circuit_past_errors() {
        // Second arg would error (len of a number) but is never reached.
        let broken = Expr::Len {
            of: Box::new(Expr::lit(json!(5))),
        };
        let and = Expr::And {
            args: vec![Expr::lit(json!(false)), broken.clone()],
        };
        assert_eq!(eval(&and), json!(false));
        let or = Expr::Or {
            args: vec![Expr::lit(json!(true)), broken],
        };
        assert_eq!(eval(&or), json!(true));
    }

    #[test]
    fn ternary_selects_branch() {
        let expr = Expr::If {
            cond: Box::new(Expr::Ge {
                left: Box::new(Expr::path("state.score")),
                right: Box::new(Expr::path("input.threshold")),
            }),
            then: Box::new(Expr::lit(json!("pass"))),
            otherwise: Box::new(Expr::lit(json!("fail"))),
        };
        assert_eq!(eval(&expr), json!("fail"));
    }

    #[test]
    fn result_root_visible_during_output_mapping() {
        let ctx = snapshot();
        let result = json!({"vote": "A"});
        let eval_ctx = EvalContext::with_result(&ctx, &result);
        let value = evaluate(&Expr::path("result.vote"), &eval_ctx).unwrap();
        assert_eq!(value, json!("A"));
    }

    #[test]
    fn mapping_builds_record_in_target_order() {
        let ctx = snapshot();
        let mut mapping = BTreeMap::new();
        mapping.insert("score".to_string(), Expr::path("state.score"));
        mapping.insert("first_tag".to_string(), Expr::path("input.tags.0"));
        let record = apply_mapping(&mapping, &EvalContext::new(&ctx)).unwrap();
        assert_eq!(record["score"], json!(85));
        // Array indexing is not path-addressable; missing resolves to null.
        assert_eq!(record["first_tag"], Value::Null);
    }

    #[test]
    fn ast_deserializes_from_tagged_json() {
        let expr: Expr = serde_json::from_value(json!({
            "op": "ge",
            "left": {"op": "path", "path": "state.score"},
            "right": {"op": "literal", "value": 90}
        }))
        .unwrap();
        assert_eq!(eval(&expr), json!(false));
    }
}
