use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    ContextSnapshot, FanIn, FanInStatus, RunStatus, Subworkflow, SubworkflowStatus, Timestamp,
    Token, TokenStatus, WorkflowDef,
};

/// Persistence trait for all per-run coordinator state.
///
/// Planning and the coordinator operate exclusively through this trait,
/// enabling pluggable backends (`MemoryRunStore` for tests and POC,
/// Postgres for production). Race safety across at-least-once delivery
/// rests on three primitives here: idempotent terminal status writes,
/// `create_fan_in_if_absent`, and the conditional `finish_fan_in`.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Run status ──

    /// Create the status row (`running`) for a fresh run.
    async fn init_run(&self, run_id: Uuid, workflow_id: &str, now: Timestamp) -> Result<()>;

    async fn load_status(&self, run_id: Uuid) -> Result<Option<RunStatus>>;

    /// Guarded status write: applies only while the current status is
    /// `running`. Returns false when refused: the first terminal status
    /// wins and later attempts are no-ops.
    async fn update_status(&self, run_id: Uuid, status: RunStatus, now: Timestamp)
        -> Result<bool>;

    // ── Tokens ──

    /// Batch insert; dispatch groups consecutive token creations into one
    /// call.
    async fn insert_tokens(&self, tokens: &[Token]) -> Result<()>;

    async fn load_token(&self, run_id: Uuid, token_id: Uuid) -> Result<Option<Token>>;

    async fn load_tokens(&self, run_id: Uuid) -> Result<Vec<Token>>;

    async fn tokens_by_status(&self, run_id: Uuid, status: TokenStatus) -> Result<Vec<Token>>;

    async fn tokens_in_group(&self, run_id: Uuid, sibling_group: &str) -> Result<Vec<Token>>;

    async fn active_token_count(&self, run_id: Uuid) -> Result<usize>;

    /// Idempotent status write: terminal tokens reject updates. Returns
    /// false on the no-op, which is how duplicate results are observed.
    async fn update_token_status(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        status: TokenStatus,
        now: Timestamp,
    ) -> Result<bool>;

    /// `waiting_for_siblings` plus `arrived_at` in one write; `arrived_at`
    /// is never cleared afterwards.
    async fn mark_waiting(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        arrived_at: Timestamp,
    ) -> Result<bool>;

    /// Increment the retry counter, returning the new value.
    async fn bump_retry(&self, run_id: Uuid, token_id: Uuid, now: Timestamp) -> Result<u32>;

    // ── Fan-ins ──

    /// Insert-if-absent on `(run_id, fan_in_path)`. Returns false when the
    /// record already exists.
    async fn create_fan_in_if_absent(&self, fan_in: &FanIn) -> Result<bool>;

    async fn load_fan_in(&self, run_id: Uuid, fan_in_path: &str) -> Result<Option<FanIn>>;

    async fn waiting_fan_ins(&self, run_id: Uuid) -> Result<Vec<FanIn>>;

    /// Conditional update `waiting → activated | timed_out`, recording the
    /// proceeding token. Exactly one writer wins; losers get false and
    /// stand down.
    async fn finish_fan_in(
        &self,
        run_id: Uuid,
        fan_in_path: &str,
        status: FanInStatus,
        activated_by: Option<Uuid>,
        now: Timestamp,
    ) -> Result<bool>;

    // ── Subworkflows ──

    async fn insert_subworkflow(&self, sub: &Subworkflow) -> Result<()>;

    async fn load_subworkflow_by_child(
        &self,
        subworkflow_run_id: Uuid,
    ) -> Result<Option<Subworkflow>>;

    async fn active_subworkflows(&self, run_id: Uuid) -> Result<Vec<Subworkflow>>;

    async fn update_subworkflow_status(
        &self,
        id: Uuid,
        status: SubworkflowStatus,
        now: Timestamp,
    ) -> Result<bool>;

    // ── Context (schema-driven) ──

    /// Create the run's context storage from the workflow's schemas and
    /// write the validated input. Input is read-only afterwards.
    async fn init_context(&self, run_id: Uuid, def: &WorkflowDef, input: &Value) -> Result<()>;

    async fn read_context(&self, run_id: Uuid) -> Result<ContextSnapshot>;

    /// Validated write to a dotted target in `state` or `output`.
    async fn set_context_value(&self, run_id: Uuid, target: &str, value: &Value) -> Result<()>;

    /// Shallow-merge a task output record into the `output` section.
    async fn merge_output(&self, run_id: Uuid, value: &Value) -> Result<()>;

    // ── Branch tables ──

    /// Create `branch_output_{token_id}` storage for a fan-out member.
    async fn init_branch_table(&self, run_id: Uuid, token_id: Uuid) -> Result<()>;

    /// Record a branch's task output under `_branch.output` in its row.
    async fn write_branch_output(&self, run_id: Uuid, token_id: Uuid, output: &Value)
        -> Result<()>;

    /// Raw branch rows for the given tokens; tokens without a surviving
    /// table are simply absent from the result.
    async fn read_branch_rows(
        &self,
        run_id: Uuid,
        token_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, Value)>>;

    async fn drop_branch_tables(&self, run_id: Uuid, token_ids: &[Uuid]) -> Result<()>;
}
