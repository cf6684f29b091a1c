use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{Timestamp, TokenStatus};

/// Trace events: the audit trail for every run, emitted fire-and-forget
/// through the trace sink. `decision.*` events come out of planning,
/// `operation.*` events out of dispatch, after the mutation they describe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TraceEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
    },
    RunCompleted {
        run_id: Uuid,
        at: Timestamp,
    },
    RunFailed {
        run_id: Uuid,
        reason: String,
    },
    RunCancelled {
        run_id: Uuid,
        reason: String,
    },
    RoutingMatched {
        token_id: Uuid,
        node_id: String,
        tier: i32,
        transition_ids: Vec<String>,
        spawned: u32,
    },
    LoopLimitReached {
        token_id: Uuid,
        transition_id: String,
        limit: u32,
    },
    NoRouteMatched {
        token_id: Uuid,
        node_id: String,
    },
    SyncWaiting {
        token_id: Uuid,
        fan_in_path: String,
        arrived: u32,
        expected: u32,
    },
    SyncActivated {
        fan_in_path: String,
        activated_by: Uuid,
    },
    SyncLostRace {
        fan_in_path: String,
        token_id: Uuid,
    },
    SyncTimedOut {
        fan_in_path: String,
        proceeded: bool,
    },
    TokensCreated {
        token_ids: Vec<Uuid>,
        node_ids: Vec<String>,
    },
    TokenStatusChanged {
        token_id: Uuid,
        status: TokenStatus,
    },
    TaskDispatched {
        token_id: Uuid,
        task_ref: String,
    },
    TaskRetried {
        token_id: Uuid,
        task_ref: String,
        attempt: u32,
    },
    SubworkflowSpawned {
        token_id: Uuid,
        subworkflow_run_id: Uuid,
    },
    ContextUpdated {
        target: String,
    },
    BranchesMerged {
        strategy: String,
        target: String,
        branches: u32,
    },
    BranchTablesDropped {
        token_ids: Vec<Uuid>,
    },
}

impl TraceEvent {
    /// Stable dotted type name on the wire. Consumers treat unknown types
    /// as opaque, so this set can grow.
    pub fn event_type(&self) -> &'static str {
        match self {
            TraceEvent::RunStarted { .. } => "decision.lifecycle.started",
            TraceEvent::RunCompleted { .. } => "decision.completion.finalized",
            TraceEvent::RunFailed { .. } => "decision.lifecycle.failed",
            TraceEvent::RunCancelled { .. } => "decision.lifecycle.cancelled",
            TraceEvent::RoutingMatched { .. } => "decision.routing.matched",
            TraceEvent::LoopLimitReached { .. } => "decision.routing.loop_limit_reached",
            TraceEvent::NoRouteMatched { .. } => "decision.routing.no_match",
            TraceEvent::SyncWaiting { .. } => "decision.synchronization.waiting",
            TraceEvent::SyncActivated { .. } => "decision.synchronization.activated",
            TraceEvent::SyncLostRace { .. } => "decision.synchronization.lost_race",
            TraceEvent::SyncTimedOut { .. } => "decision.synchronization.timed_out",
            TraceEvent::TokensCreated { .. } => "operation.tokens.created",
            TraceEvent::TokenStatusChanged { .. } => "operation.tokens.status_changed",
            TraceEvent::TaskDispatched { .. } => "operation.tokens.dispatched",
            TraceEvent::TaskRetried { .. } => "operation.tokens.retried",
            TraceEvent::SubworkflowSpawned { .. } => "operation.tokens.subworkflow_spawned",
            TraceEvent::ContextUpdated { .. } => "operation.context.updated",
            TraceEvent::BranchesMerged { .. } => "operation.context.merged",
            TraceEvent::BranchTablesDropped { .. } => "operation.context.branches_dropped",
        }
    }

    /// Wire form: `{type, payload}`.
    pub fn to_wire(&self) -> Value {
        let payload = match serde_json::to_value(self) {
            // Serialized as {"VariantName": {..fields..}}; unwrap to fields.
            Ok(Value::Object(map)) => map
                .into_iter()
                .next()
                .map(|(_, fields)| fields)
                .unwrap_or(Value::Null),
            Ok(other) => other,
            Err(_) => Value::Null,
        };
        serde_json::json!({
            "type": self.event_type(),
            "payload": payload,
        })
    }
}
