use serde_json::Value;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::events::TraceEvent;
use crate::merge;
use crate::path;
use crate::types::{
    Decision, FanIn, FanInStatus, NewToken, OnTimeout, Plan, SyncStrategy, Synchronization,
    Timestamp, Token, TokenStatus, Transition,
};

/// How an arrival at a synchronized transition resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The token's sibling group does not match: ordinary continuation, no
    /// wait introduced.
    NotSynchronized,
    /// Parked until more siblings account for themselves.
    Waiting,
    /// This arrival names the activator; exactly one per fan-in path.
    Activated,
    /// The fan-in was already activated or timed out (late arrival).
    AlreadyResolved,
}

#[derive(Debug)]
pub struct SyncPlan {
    pub plan: Plan,
    pub outcome: SyncOutcome,
}

/// Inputs to one arrival at a synchronized transition. The caller gathers
/// the sibling cohort, the fan-in record (if any), the raw branch rows for
/// already-arrived siblings, and the fan-out origin token (the ancestor the
/// proceeding child collapses back onto).
pub struct ArrivalInput<'a> {
    pub token: &'a Token,
    pub transition: &'a Transition,
    pub sync: &'a Synchronization,
    pub siblings: &'a [Token],
    pub fan_in: Option<&'a FanIn>,
    /// `(token_id, branch_index, row)` for arrived siblings' branch tables.
    pub branch_rows: &'a [(Uuid, u32, Value)],
    pub origin: Option<&'a Token>,
    pub now: Timestamp,
}

/// A sibling is *accounted for* once it arrived at the fan-in (parked
/// waiting) or resolved elsewhere (any terminal state). Only arrivals
/// contribute outputs to a merge.
fn accounted(token: &Token, arriving_id: Uuid) -> bool {
    token.id == arriving_id
        || token.status == TokenStatus::WaitingForSiblings
        || token.status.is_terminal()
}

fn satisfied(sync: &Synchronization, siblings: &[Token], arriving_id: Uuid) -> bool {
    match sync.strategy {
        SyncStrategy::All => siblings.iter().all(|t| accounted(t, arriving_id)),
        // `any` needs a completion: a parked or completed sibling, or this
        // arrival itself (unless it is a failed token being absorbed).
        SyncStrategy::Any => siblings.iter().any(|t| {
            t.status == TokenStatus::WaitingForSiblings
                || t.status == TokenStatus::Completed
                || (t.id == arriving_id && !t.status.is_terminal())
        }),
        // Failed siblings count toward the quorum.
        SyncStrategy::MOfN(m) => {
            siblings.iter().filter(|t| accounted(t, arriving_id)).count() >= m as usize
        }
    }
}

/// The lineage cell the proceeding child collapses back onto: the fan-out
/// parent's path, with its sibling metadata when that ancestor is known.
fn collapsed_spec(
    transition: &Transition,
    activator: &Token,
    origin: Option<&Token>,
) -> NewToken {
    let prefix = path::sibling_prefix(
        &activator.path_id,
        activator.branch_total,
        activator.branch_index,
    );
    let collapsed_path = prefix
        .rsplit_once('.')
        .map(|(head, _)| head.to_string())
        .unwrap_or(prefix);
    let mut iteration_counts = activator.iteration_counts.clone();
    *iteration_counts
        .entry(transition.id.clone())
        .or_insert(0) += 1;
    let (sibling_group, branch_index, branch_total) = match origin {
        Some(origin) => (
            origin.sibling_group.clone(),
            origin.branch_index,
            origin.branch_total,
        ),
        None => (None, 0, 1),
    };
    NewToken {
        node_id: transition.to.clone(),
        parent_token_id: Some(activator.id),
        path_id: collapsed_path,
        sibling_group,
        branch_index,
        branch_total,
        iteration_counts,
        via_transition: Some(transition.id.clone()),
    }
}

/// Decide wait / activate / stand-down for a token arriving at a
/// synchronized transition.
pub fn plan_arrival(input: &ArrivalInput<'_>) -> Result<SyncPlan, CoordinatorError> {
    let token = input.token;
    let sync = input.sync;

    if token.sibling_group.as_deref() != Some(sync.sibling_group.as_str()) {
        return Ok(SyncPlan {
            plan: Plan::default(),
            outcome: SyncOutcome::NotSynchronized,
        });
    }

    let prefix = path::sibling_prefix(&token.path_id, token.branch_total, token.branch_index);
    let fan_in_path = path::fan_in_path(&prefix, &input.transition.id);
    let mut plan = Plan::default();

    // Late arrival: the race is over, stand down. This is the core
    // race-safety invariant: losers complete, clean up their branch
    // tables, and nothing else happens.
    if let Some(fan_in) = input.fan_in {
        if fan_in.status != FanInStatus::Waiting {
            plan.decisions.push(Decision::UpdateTokenStatus {
                token_id: token.id,
                status: TokenStatus::Completed,
            });
            if token.branch_total > 1 {
                let mut owners = vec![token.id];
                owners.extend(token.parent_token_id);
                plan.decisions
                    .push(Decision::DropBranchTables { token_ids: owners });
            }
            plan.events.push(TraceEvent::SyncLostRace {
                fan_in_path,
                token_id: token.id,
            });
            return Ok(SyncPlan {
                plan,
                outcome: SyncOutcome::AlreadyResolved,
            });
        }
    }

    let first_arrival_at = input
        .fan_in
        .map(|f| f.first_arrival_at)
        .unwrap_or(input.now);

    if !satisfied(sync, input.siblings, token.id) {
        if input.fan_in.is_none() {
            plan.decisions.push(Decision::CreateFanIn {
                node_id: input.transition.to.clone(),
                fan_in_path: fan_in_path.clone(),
                transition_id: input.transition.id.clone(),
                first_arrival_at: input.now,
            });
        }
        plan.decisions.push(Decision::MarkWaiting {
            token_id: token.id,
            arrived_at: input.now,
        });
        if let Some(timeout_ms) = sync.timeout_ms {
            plan.decisions.push(Decision::ScheduleAlarm {
                at: first_arrival_at + timeout_ms as Timestamp,
            });
        }
        let arrived = input
            .siblings
            .iter()
            .filter(|t| accounted(t, token.id))
            .count() as u32;
        plan.events.push(TraceEvent::SyncWaiting {
            token_id: token.id,
            fan_in_path,
            arrived,
            expected: input.siblings.len() as u32,
        });
        return Ok(SyncPlan {
            plan,
            outcome: SyncOutcome::Waiting,
        });
    }

    // Satisfied with the fan-in still open: this arrival activates. The
    // conditional store update in dispatch settles any remaining race.
    if input.fan_in.is_none() {
        plan.decisions.push(Decision::CreateFanIn {
            node_id: input.transition.to.clone(),
            fan_in_path: fan_in_path.clone(),
            transition_id: input.transition.id.clone(),
            first_arrival_at: input.now,
        });
    }
    plan.decisions.push(Decision::ActivateFanIn {
        fan_in_path: fan_in_path.clone(),
        token_id: token.id,
    });
    plan.decisions.push(Decision::UpdateTokenStatus {
        token_id: token.id,
        status: TokenStatus::Completed,
    });
    for sibling in input.siblings {
        if sibling.id != token.id && sibling.status == TokenStatus::WaitingForSiblings {
            plan.decisions.push(Decision::UpdateTokenStatus {
                token_id: sibling.id,
                status: TokenStatus::Completed,
            });
        }
    }

    if let Some(merge_config) = &sync.merge {
        let outputs =
            merge::collect_outputs(input.branch_rows, merge_config.source.as_deref());
        let merged = merge::apply(&merge_config.strategy, &outputs)?;
        plan.decisions.push(Decision::SetContext {
            target: merge_config.target.clone(),
            value: merged,
        });
    }
    // Branch tables of everyone accounted for are done, merge or not.
    // Stragglers still executing keep theirs until they arrive late.
    let mut table_owners: Vec<Uuid> = input
        .siblings
        .iter()
        .filter(|t| accounted(t, token.id))
        .map(|t| t.id)
        .collect();
    if !table_owners.contains(&token.id) {
        table_owners.push(token.id);
    }
    plan.decisions.push(Decision::DropBranchTables {
        token_ids: table_owners,
    });

    plan.decisions.push(Decision::CreateToken {
        spec: collapsed_spec(input.transition, token, input.origin),
    });
    plan.events.push(TraceEvent::SyncActivated {
        fan_in_path,
        activated_by: token.id,
    });

    Ok(SyncPlan {
        plan,
        outcome: SyncOutcome::Activated,
    })
}

/// Inputs to a timeout sweep over one waiting fan-in.
pub struct TimeoutInput<'a> {
    pub fan_in: &'a FanIn,
    pub transition: &'a Transition,
    pub sync: &'a Synchronization,
    pub siblings: &'a [Token],
    pub origin: Option<&'a Token>,
    pub now: Timestamp,
}

/// Decide what happens when the alarm fires for a waiting fan-in: not due
/// yet (re-arm), proceed with the available arrivals, or fail the run.
pub fn plan_timeout(input: &TimeoutInput<'_>) -> Result<Plan, CoordinatorError> {
    let mut plan = Plan::default();
    if input.fan_in.status != FanInStatus::Waiting {
        return Ok(plan);
    }
    let Some(timeout_ms) = input.sync.timeout_ms else {
        return Ok(plan);
    };
    let deadline = input.fan_in.first_arrival_at + timeout_ms as Timestamp;
    if input.now < deadline {
        plan.decisions.push(Decision::ScheduleAlarm { at: deadline });
        return Ok(plan);
    }

    let mut waiting: Vec<&Token> = input
        .siblings
        .iter()
        .filter(|t| t.status == TokenStatus::WaitingForSiblings)
        .collect();
    waiting.sort_by_key(|t| (t.arrived_at.unwrap_or(i64::MAX), t.id));

    let proceed = input.sync.on_timeout == OnTimeout::ProceedWithAvailable;
    let activator = if proceed { waiting.first().copied() } else { None };

    plan.decisions.push(Decision::TimeoutFanIn {
        fan_in_path: input.fan_in.fan_in_path.clone(),
        proceeding_token: activator.map(|t| t.id),
    });

    match activator {
        Some(activator) => {
            plan.decisions.push(Decision::UpdateTokenStatus {
                token_id: activator.id,
                status: TokenStatus::Completed,
            });
            for token in waiting.iter().skip(1) {
                plan.decisions.push(Decision::UpdateTokenStatus {
                    token_id: token.id,
                    status: TokenStatus::Completed,
                });
            }
            // Siblings that never arrived are out of time.
            for token in input.siblings {
                if token.status.is_active()
                    && token.status != TokenStatus::WaitingForSiblings
                {
                    plan.decisions.push(Decision::UpdateTokenStatus {
                        token_id: token.id,
                        status: TokenStatus::TimedOut,
                    });
                }
            }
            match &input.sync.merge {
                Some(merge_config) => plan.decisions.push(Decision::MergeBranches {
                    token_ids: input.siblings.iter().map(|t| t.id).collect(),
                    source: merge_config.source.clone(),
                    target: merge_config.target.clone(),
                    strategy: merge_config.strategy.clone(),
                }),
                None => plan.decisions.push(Decision::DropBranchTables {
                    token_ids: input.siblings.iter().map(|t| t.id).collect(),
                }),
            }
            plan.decisions.push(Decision::CreateToken {
                spec: collapsed_spec(input.transition, activator, input.origin),
            });
            plan.events.push(TraceEvent::SyncTimedOut {
                fan_in_path: input.fan_in.fan_in_path.clone(),
                proceeded: true,
            });
        }
        None => {
            for token in &waiting {
                plan.decisions.push(Decision::UpdateTokenStatus {
                    token_id: token.id,
                    status: TokenStatus::TimedOut,
                });
            }
            plan.decisions.push(Decision::DropBranchTables {
                token_ids: input.siblings.iter().map(|t| t.id).collect(),
            });
            plan.decisions.push(Decision::FailWorkflow {
                reason: format!(
                    "synchronization timed out at {}",
                    input.fan_in.fan_in_path
                ),
            });
            plan.events.push(TraceEvent::SyncTimedOut {
                fan_in_path: input.fan_in.fan_in_path.clone(),
                proceeded: false,
            });
        }
    }

    Ok(plan)
}
