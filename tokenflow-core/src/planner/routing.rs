use std::collections::BTreeMap;

use crate::condition::{evaluate_condition, EvalContext};
use crate::error::CoordinatorError;
use crate::events::TraceEvent;
use crate::path;
use crate::types::{ContextSnapshot, Decision, NewToken, Plan, Token, Transition};

/// Inputs to one routing pass: a token whose node work has finished, its
/// node's outbound transitions (already sorted highest-priority first), and
/// a context snapshot.
pub struct RoutingInput<'a> {
    pub token: &'a Token,
    pub transitions: &'a [&'a Transition],
    pub ctx: &'a ContextSnapshot,
}

/// Decide the next-token creations for a finished token.
///
/// Priority tiers are tried in ascending order; the first tier with at
/// least one qualifying transition wins and all its qualifiers fire in
/// parallel. A transition at its loop cap is skipped (with an event) so a
/// lower-priority tier can take over. An empty result means no route
/// matched; the caller then checks for workflow completion.
pub fn plan_routing(input: &RoutingInput<'_>) -> Result<Plan, CoordinatorError> {
    let token = input.token;
    let eval_ctx = EvalContext::new(input.ctx);
    let mut plan = Plan::default();

    let mut matched: Vec<&Transition> = Vec::new();
    let mut matched_tier = 0;
    let mut index = 0;
    while index < input.transitions.len() && matched.is_empty() {
        let tier = input.transitions[index].priority;
        while index < input.transitions.len() && input.transitions[index].priority == tier {
            let transition = input.transitions[index];
            index += 1;
            if !evaluate_condition(transition.condition.as_ref(), &eval_ctx)? {
                continue;
            }
            if let Some(loop_config) = &transition.loop_config {
                let traversed = token
                    .iteration_counts
                    .get(&transition.id)
                    .copied()
                    .unwrap_or(0);
                if traversed >= loop_config.max_iterations {
                    plan.events.push(TraceEvent::LoopLimitReached {
                        token_id: token.id,
                        transition_id: transition.id.clone(),
                        limit: loop_config.max_iterations,
                    });
                    continue;
                }
            }
            matched.push(transition);
        }
        matched_tier = tier;
    }

    if matched.is_empty() {
        plan.events.push(TraceEvent::NoRouteMatched {
            token_id: token.id,
            node_id: token.node_id.clone(),
        });
        return Ok(plan);
    }

    // Spawn counts. A foreach over a real array spawns per element (empty
    // array ⇒ none); a missing or non-array collection degrades to 1.
    let mut spawn_counts: Vec<u32> = Vec::with_capacity(matched.len());
    for transition in &matched {
        let count = match &transition.foreach {
            Some(foreach) => match path::resolve(input.ctx, &foreach.collection) {
                Some(serde_json::Value::Array(items)) => items.len() as u32,
                _ => 1,
            },
            None => transition.spawn_count.unwrap_or(1),
        };
        spawn_counts.push(count);
    }

    // Sibling group per matched transition: explicit, else implicit
    // (`ref ?? id`) when it fans out, else inherited from the parent.
    let groups: Vec<Option<String>> = matched
        .iter()
        .zip(&spawn_counts)
        .map(|(transition, &count)| {
            if let Some(group) = &transition.sibling_group {
                Some(group.clone())
            } else if count > 1 {
                Some(
                    transition
                        .ref_id
                        .clone()
                        .unwrap_or_else(|| transition.id.clone()),
                )
            } else {
                None
            }
        })
        .collect();

    // branch_total per new group: sum of spawn counts over every matched
    // transition contributing to it.
    let mut group_totals: BTreeMap<&str, u32> = BTreeMap::new();
    for (group, &count) in groups.iter().zip(&spawn_counts) {
        if let Some(group) = group {
            *group_totals.entry(group.as_str()).or_insert(0) += count;
        }
    }

    // branch_index: one monotonic counter per group spanning all matched
    // transitions, so two transitions feeding one group yield contiguous
    // indices.
    let mut group_cursors: BTreeMap<&str, u32> = BTreeMap::new();
    let mut total_spawned = 0;

    for ((transition, &count), group) in matched.iter().zip(&spawn_counts).zip(&groups) {
        let mut iteration_counts = token.iteration_counts.clone();
        *iteration_counts.entry(transition.id.clone()).or_insert(0) += 1;

        for _ in 0..count {
            let spec = match group {
                Some(group) => {
                    let total = group_totals[group.as_str()];
                    let cursor = group_cursors.entry(group.as_str()).or_insert(0);
                    let branch_index = *cursor;
                    *cursor += 1;
                    let path_id = if total > 1 {
                        path::extend_path(&token.path_id, &token.node_id, branch_index)
                    } else {
                        token.path_id.clone()
                    };
                    NewToken {
                        node_id: transition.to.clone(),
                        parent_token_id: Some(token.id),
                        path_id,
                        sibling_group: Some(group.clone()),
                        branch_index,
                        branch_total: total,
                        iteration_counts: iteration_counts.clone(),
                        via_transition: Some(transition.id.clone()),
                    }
                }
                // Continuation: same lineage cell as the parent.
                None => NewToken {
                    node_id: transition.to.clone(),
                    parent_token_id: Some(token.id),
                    path_id: token.path_id.clone(),
                    sibling_group: token.sibling_group.clone(),
                    branch_index: token.branch_index,
                    branch_total: token.branch_total,
                    iteration_counts: iteration_counts.clone(),
                    via_transition: Some(transition.id.clone()),
                },
            };
            plan.decisions.push(Decision::CreateToken { spec });
            total_spawned += 1;
        }
    }

    plan.events.push(TraceEvent::RoutingMatched {
        token_id: token.id,
        node_id: token.node_id.clone(),
        tier: matched_tier,
        transition_ids: matched.iter().map(|t| t.id.clone()).collect(),
        spawned: total_spawned,
    });

    Ok(plan)
}
