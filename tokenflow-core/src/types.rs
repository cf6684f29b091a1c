use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::condition::Expr;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Node identifier within a workflow definition.
pub type NodeId = String;

/// Transition identifier within a workflow definition.
pub type TransitionId = String;

/// Retry budget per token for retryable task failures.
pub const MAX_TASK_RETRIES: u32 = 3;

// ─── Token ────────────────────────────────────────────────────

/// Token lifecycle states. Terminal states are final: a terminal token
/// ignores further status updates, which is what makes duplicate result
/// delivery safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Dispatched,
    Executing,
    WaitingForSiblings,
    WaitingForSubworkflow,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenStatus::Completed
                | TokenStatus::Failed
                | TokenStatus::TimedOut
                | TokenStatus::Cancelled
        )
    }

    /// Active = still occupying the run (counts against workflow completion).
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Pending => "pending",
            TokenStatus::Dispatched => "dispatched",
            TokenStatus::Executing => "executing",
            TokenStatus::WaitingForSiblings => "waiting_for_siblings",
            TokenStatus::WaitingForSubworkflow => "waiting_for_subworkflow",
            TokenStatus::Completed => "completed",
            TokenStatus::Failed => "failed",
            TokenStatus::TimedOut => "timed_out",
            TokenStatus::Cancelled => "cancelled",
        }
    }
}

/// One in-flight execution position within a workflow run.
///
/// Lineage is acyclic (one parent per token) even though the graph itself
/// may contain cycles; loops are bounded by `iteration_counts`, carried
/// per-transition along the lineage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: NodeId,
    pub status: TokenStatus,
    pub parent_token_id: Option<Uuid>,
    /// Dotted lineage through fan-outs only: `root`, then
    /// `.{node_id}.{branch_index}` appended at each fan-out.
    pub path_id: String,
    pub sibling_group: Option<String>,
    pub branch_index: u32,
    pub branch_total: u32,
    /// Transition id → times traversed along this lineage.
    pub iteration_counts: BTreeMap<TransitionId, u32>,
    pub retry_count: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Set on transition into `waiting_for_siblings`, never cleared.
    pub arrived_at: Option<Timestamp>,
}

/// Creation spec for a token, produced by planning. The store id and
/// timestamps are assigned at dispatch time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewToken {
    pub node_id: NodeId,
    pub parent_token_id: Option<Uuid>,
    pub path_id: String,
    pub sibling_group: Option<String>,
    pub branch_index: u32,
    pub branch_total: u32,
    pub iteration_counts: BTreeMap<TransitionId, u32>,
    /// The transition the token entered through. `None` only for the root
    /// token; dispatch uses it to check synchronization on arrival.
    pub via_transition: Option<TransitionId>,
}

// ─── Fan-in ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInStatus {
    Waiting,
    Activated,
    TimedOut,
}

impl FanInStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FanInStatus::Waiting => "waiting",
            FanInStatus::Activated => "activated",
            FanInStatus::TimedOut => "timed_out",
        }
    }
}

/// Synchronization point record, unique per `(run_id, fan_in_path)`.
/// At most one activation per path: the uniqueness constraint settles
/// creation races, the conditional `waiting →` update settles activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FanIn {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: NodeId,
    pub fan_in_path: String,
    pub status: FanInStatus,
    pub transition_id: TransitionId,
    pub first_arrival_at: Timestamp,
    pub activated_at: Option<Timestamp>,
    pub activated_by_token_id: Option<Uuid>,
}

// ─── Workflow run status ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

// ─── Subworkflows ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubworkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubworkflowStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SubworkflowStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubworkflowStatus::Running => "running",
            SubworkflowStatus::Completed => "completed",
            SubworkflowStatus::Failed => "failed",
            SubworkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Link between a parent token and the child run it spawned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subworkflow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub parent_token_id: Uuid,
    pub subworkflow_run_id: Uuid,
    pub status: SubworkflowStatus,
    pub timeout_ms: Option<u64>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ─── Workflow definition ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Subworkflow,
    /// No task behind it: completes on arrival and routes onward in the
    /// same dispatch cycle. Used for condition-only routing hops.
    Passthrough,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub task_ref: Option<String>,
    /// Child workflow id, for `subworkflow` nodes.
    #[serde(default)]
    pub workflow_ref: Option<String>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, Expr>,
    #[serde(default)]
    pub output_mapping: BTreeMap<String, Expr>,
    /// Schema for the node's task output; drives branch table layout and
    /// output validation when present.
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Spawn one token per element of the array at `collection`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Foreach {
    pub collection: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    All,
    Any,
    MOfN(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    ProceedWithAvailable,
    Fail,
}

fn default_on_timeout() -> OnTimeout {
    OnTimeout::Fail
}

/// Branch-output merge applied when a fan-in activates. `strategy` is kept
/// as a string so an unknown strategy surfaces as a `MergeError` at merge
/// time rather than a deserialization failure at load time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Field inside each branch row; defaults to `_branch.output`.
    #[serde(default)]
    pub source: Option<String>,
    /// Context path in `state` or `output`.
    pub target: String,
    pub strategy: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Synchronization {
    pub strategy: SyncStrategy,
    pub sibling_group: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_on_timeout")]
    pub on_timeout: OnTimeout,
    #[serde(default)]
    pub merge: Option<MergeConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    #[serde(default, rename = "ref")]
    pub ref_id: Option<String>,
    pub from: NodeId,
    pub to: NodeId,
    /// Smaller = higher priority.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<Expr>,
    #[serde(default)]
    pub spawn_count: Option<u32>,
    #[serde(default)]
    pub foreach: Option<Foreach>,
    #[serde(default)]
    pub sibling_group: Option<String>,
    #[serde(default)]
    pub synchronization: Option<Synchronization>,
    #[serde(default, rename = "loop")]
    pub loop_config: Option<LoopConfig>,
}

/// Read-only per-run workflow definition, loaded once from the resource
/// catalog on cold start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    pub initial_node_id: NodeId,
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub state_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// Final-output extraction: target field → expression over the final
    /// context.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, Expr>,
}

// ─── Task wire types ──────────────────────────────────────────

/// Outbound call to the executor. `correlation` is the token id; results
/// come back through `on_task_result` keyed on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_ref: String,
    pub input: Value,
    pub correlation: Uuid,
    pub run_id: Uuid,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub step_ref: Option<String>,
    pub message: String,
    pub retryable: bool,
}

/// Outcome delivered by the executor, at least once. The wire shape is
/// `{success: true, output_data}` or `{success: false, error}`; variants are
/// discriminated by which payload field is present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskOutcome {
    Success { output_data: Value },
    Failure { error: TaskError },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SubworkflowOutcome {
    Completed { output: Value },
    Failed { message: String },
    Cancelled,
}

// ─── Context ──────────────────────────────────────────────────

/// Point-in-time view of the three context sections. Planning works off a
/// snapshot; stores own the mutable truth.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub input: Value,
    pub state: Value,
    pub output: Value,
}

/// One branch's resolved output, fed to merge strategies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchOutput {
    pub token_id: Uuid,
    pub branch_index: u32,
    pub output: Value,
}

// ─── Decisions ────────────────────────────────────────────────

/// Every state mutation the planner can request, as a tagged union.
/// Dispatch matches exhaustively; planning never touches a store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Decision {
    CreateToken {
        spec: NewToken,
    },
    UpdateTokenStatus {
        token_id: Uuid,
        status: TokenStatus,
    },
    /// `waiting_for_siblings` + `arrived_at` in one write.
    MarkWaiting {
        token_id: Uuid,
        arrived_at: Timestamp,
    },
    MarkForDispatch {
        token_id: Uuid,
        node_id: NodeId,
    },
    /// Recursive entry into synchronization planning for a stored token.
    CheckSynchronization {
        token_id: Uuid,
        transition_id: TransitionId,
    },
    CreateFanIn {
        node_id: NodeId,
        fan_in_path: String,
        transition_id: TransitionId,
        first_arrival_at: Timestamp,
    },
    /// Conditional `waiting → activated`; the named token proceeds iff the
    /// update wins. Losers are handled as late arrivals.
    ActivateFanIn {
        fan_in_path: String,
        token_id: Uuid,
    },
    /// Conditional `waiting → timed_out`. With `proceeding_token` set the
    /// timeout degrades into an activation over the available siblings.
    TimeoutFanIn {
        fan_in_path: String,
        proceeding_token: Option<Uuid>,
    },
    SetContext {
        target: String,
        value: Value,
    },
    /// Shallow-merge a task's output record into the `output` section.
    ApplyOutput {
        value: Value,
    },
    InitBranchTable {
        token_id: Uuid,
    },
    ApplyBranchOutput {
        token_id: Uuid,
        output: Value,
    },
    /// Read the sibling branch rows, reduce them with the named strategy
    /// and write the result to `target`. Tables are dropped afterwards.
    MergeBranches {
        token_ids: Vec<Uuid>,
        source: Option<String>,
        target: String,
        strategy: String,
    },
    DropBranchTables {
        token_ids: Vec<Uuid>,
    },
    ScheduleAlarm {
        at: Timestamp,
    },
    CompleteWorkflow {
        output: Value,
    },
    FailWorkflow {
        reason: String,
    },
}

/// Output of one planning call: decisions to apply in order, plus the trace
/// events describing them. Events are emitted after the mutations they
/// describe.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub decisions: Vec<Decision>,
    pub events: Vec<crate::events::TraceEvent>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty() && self.events.is_empty()
    }
}

/// Result summary returned by dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchSummary {
    pub applied: usize,
    pub tokens_created: usize,
    pub tokens_dispatched: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_final_and_inactive() {
        for status in [
            TokenStatus::Completed,
            TokenStatus::Failed,
            TokenStatus::TimedOut,
            TokenStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        for status in [
            TokenStatus::Pending,
            TokenStatus::Dispatched,
            TokenStatus::Executing,
            TokenStatus::WaitingForSiblings,
            TokenStatus::WaitingForSubworkflow,
        ] {
            assert!(!status.is_terminal());
            assert!(status.is_active());
        }
    }

    #[test]
    fn sync_strategy_serde_shapes() {
        let all: SyncStrategy = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, SyncStrategy::All);
        let m: SyncStrategy = serde_json::from_str(r#"{"m_of_n":2}"#).unwrap();
        assert_eq!(m, SyncStrategy::MOfN(2));
    }

    #[test]
    fn transition_deserializes_with_defaults() {
        let t: Transition = serde_json::from_str(
            r#"{"id":"t1","from":"a","to":"b"}"#,
        )
        .unwrap();
        assert_eq!(t.priority, 0);
        assert!(t.condition.is_none());
        assert!(t.spawn_count.is_none());
        assert!(t.loop_config.is_none());
    }

    #[test]
    fn task_outcome_wire_shape() {
        let ok: TaskOutcome =
            serde_json::from_str(r#"{"success":true,"output_data":{"x":1}}"#).unwrap();
        assert!(matches!(ok, TaskOutcome::Success { .. }));
        let err: TaskOutcome = serde_json::from_str(
            r#"{"success":false,"error":{"type":"boom","message":"m","retryable":false}}"#,
        )
        .unwrap();
        match err {
            TaskOutcome::Failure { error } => assert!(!error.retryable),
            TaskOutcome::Success { .. } => panic!("expected failure"),
        }
    }
}
