use std::collections::BTreeMap;
use uuid::Uuid;

use crate::condition::{apply_mapping, EvalContext};
use crate::error::CoordinatorError;
use crate::events::TraceEvent;
use crate::path;
use crate::types::{ContextSnapshot, Decision, NewToken, Plan, Timestamp, WorkflowDef};

/// Root-token creation on `start`: one token at the initial node, path
/// `root`, a singleton branch cell, empty iteration counts.
pub fn plan_start(def: &WorkflowDef, run_id: Uuid) -> Plan {
    Plan {
        decisions: vec![Decision::CreateToken {
            spec: NewToken {
                node_id: def.initial_node_id.clone(),
                parent_token_id: None,
                path_id: path::ROOT_PATH.to_string(),
                sibling_group: None,
                branch_index: 0,
                branch_total: 1,
                iteration_counts: BTreeMap::new(),
                via_transition: None,
            },
        }],
        events: vec![TraceEvent::RunStarted {
            run_id,
            workflow_id: def.id.clone(),
        }],
    }
}

/// Final-output extraction once no routing fired and no active tokens
/// remain. Each output_mapping target gets its evaluated source expression;
/// with no mapping the `output` section is the workflow output as-is.
pub fn plan_completion(
    def: &WorkflowDef,
    ctx: &ContextSnapshot,
    run_id: Uuid,
    now: Timestamp,
) -> Result<Plan, CoordinatorError> {
    let output = if def.output_mapping.is_empty() {
        ctx.output.clone()
    } else {
        apply_mapping(&def.output_mapping, &EvalContext::new(ctx))?
    };
    Ok(Plan {
        decisions: vec![Decision::CompleteWorkflow { output }],
        events: vec![TraceEvent::RunCompleted { run_id, at: now }],
    })
}
