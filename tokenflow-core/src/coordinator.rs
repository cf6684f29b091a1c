use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::condition::EvalContext;
use crate::definition::RunDefinition;
use crate::dispatch::Dispatcher;
use crate::events::TraceEvent;
use crate::outbound::{AlarmScheduler, SubworkflowClient, TaskExecutor, TraceSink};
use crate::planner::{plan_completion, plan_routing, plan_start, plan_timeout, RoutingInput, TimeoutInput};
use crate::store::RunStore;
use crate::types::{
    Decision, FanIn, Plan, RunStatus, SubworkflowOutcome, SubworkflowStatus, TaskError,
    TaskOutcome, Timestamp, Token, TokenStatus, MAX_TASK_RETRIES,
};

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// The outbound ports a run talks to.
#[derive(Clone)]
pub struct Ports {
    pub executor: Arc<dyn TaskExecutor>,
    pub subworkflows: Arc<dyn SubworkflowClient>,
    pub trace: Arc<dyn TraceSink>,
    pub alarms: Arc<dyn AlarmScheduler>,
}

/// Snapshot returned by `inspect`.
#[derive(Clone, Debug)]
pub struct RunInspection {
    pub run_id: Uuid,
    pub status: Option<RunStatus>,
    pub tokens: Vec<Token>,
    pub waiting_fan_ins: Vec<FanIn>,
}

/// The per-run actor. Owns one run's store state exclusively and
/// serializes every mutating entry point behind a mutex, so planning and
/// dispatch always observe a quiesced run. Concurrent runs are isolated;
/// nothing is shared in-process beyond the ports.
pub struct RunCoordinator {
    run_id: Uuid,
    def: Arc<RunDefinition>,
    store: Arc<dyn RunStore>,
    ports: Ports,
    gate: Mutex<()>,
}

impl RunCoordinator {
    pub fn new(
        run_id: Uuid,
        def: Arc<RunDefinition>,
        store: Arc<dyn RunStore>,
        ports: Ports,
    ) -> Self {
        Self {
            run_id,
            def,
            store,
            ports,
            gate: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn definition(&self) -> &Arc<RunDefinition> {
        &self.def
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            run_id: self.run_id,
            def: self.def.clone(),
            store: self.store.clone(),
            executor: self.ports.executor.clone(),
            subworkflows: self.ports.subworkflows.clone(),
            trace: self.ports.trace.clone(),
            alarms: self.ports.alarms.clone(),
        }
    }

    // ── Entry points ──

    /// Initialize stores, validate input, create the root token and run the
    /// initial dispatch. Validation failure leaves no trace of the run.
    pub async fn start(&self, input: Value) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        self.def.validate_input(&input)?;
        self.store
            .init_run(self.run_id, &self.def.def().id, now)
            .await?;
        self.store
            .init_context(self.run_id, self.def.def(), &input)
            .await?;
        let plan = plan_start(self.def.def(), self.run_id);
        self.dispatcher().apply(plan, now).await?;
        self.maybe_finalize(now).await
    }

    /// Task completion callback, delivered at least once and idempotent by
    /// token id: terminal tokens absorb duplicates as no-ops.
    pub async fn on_task_result(&self, token_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        if self.run_is_terminal().await? {
            tracing::debug!(run_id = %self.run_id, %token_id, "result after finalization ignored");
            return Ok(());
        }
        let Some(token) = self.store.load_token(self.run_id, token_id).await? else {
            tracing::warn!(run_id = %self.run_id, %token_id, "result for unknown token ignored");
            return Ok(());
        };
        if token.status.is_terminal() {
            tracing::debug!(run_id = %self.run_id, %token_id, "duplicate result ignored");
            return Ok(());
        }
        match outcome {
            TaskOutcome::Success { output_data } => {
                self.handle_success(&token, output_data, now).await?;
            }
            TaskOutcome::Failure { error } => {
                self.handle_failure(&token, error, now).await?;
            }
        }
        self.maybe_finalize(now).await
    }

    /// Child-run completion callback, idempotent by subworkflow run id.
    pub async fn on_subworkflow_result(
        &self,
        subworkflow_run_id: Uuid,
        outcome: SubworkflowOutcome,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        if self.run_is_terminal().await? {
            return Ok(());
        }
        let Some(sub) = self
            .store
            .load_subworkflow_by_child(subworkflow_run_id)
            .await?
        else {
            tracing::warn!(run_id = %self.run_id, %subworkflow_run_id, "result for unknown subworkflow ignored");
            return Ok(());
        };
        let resolved = match &outcome {
            SubworkflowOutcome::Completed { .. } => SubworkflowStatus::Completed,
            SubworkflowOutcome::Failed { .. } => SubworkflowStatus::Failed,
            SubworkflowOutcome::Cancelled => SubworkflowStatus::Cancelled,
        };
        if !self
            .store
            .update_subworkflow_status(sub.id, resolved, now)
            .await?
        {
            return Ok(());
        }
        let Some(token) = self.store.load_token(self.run_id, sub.parent_token_id).await? else {
            return Ok(());
        };
        if token.status.is_terminal() {
            return Ok(());
        }
        match outcome {
            SubworkflowOutcome::Completed { output } => {
                self.handle_success(&token, output, now).await?;
            }
            SubworkflowOutcome::Failed { message } => {
                self.handle_failure(
                    &token,
                    TaskError {
                        error_type: "subworkflow_failed".to_string(),
                        step_ref: None,
                        message,
                        retryable: false,
                    },
                    now,
                )
                .await?;
            }
            SubworkflowOutcome::Cancelled => {
                self.dispatcher()
                    .apply(
                        Plan {
                            decisions: vec![Decision::UpdateTokenStatus {
                                token_id: token.id,
                                status: TokenStatus::Cancelled,
                            }],
                            events: vec![],
                        },
                        now,
                    )
                    .await?;
            }
        }
        self.maybe_finalize(now).await
    }

    /// Alarm callback: sweep every waiting fan-in, expire the overdue ones,
    /// re-arm for the rest.
    pub async fn on_timeout_alarm(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        if self.run_is_terminal().await? {
            return Ok(());
        }
        let dispatcher = self.dispatcher();
        for fan_in in self.store.waiting_fan_ins(self.run_id).await? {
            let transition = match self.def.transition(&fan_in.transition_id) {
                Ok(transition) => transition.clone(),
                Err(err) => {
                    dispatcher
                        .apply(fail_plan(err.to_string()), now)
                        .await?;
                    continue;
                }
            };
            let Some(sync) = transition.synchronization.clone() else {
                continue;
            };
            let siblings = self
                .store
                .tokens_in_group(self.run_id, &sync.sibling_group)
                .await?;
            let earliest_waiting = siblings
                .iter()
                .filter(|t| t.status == TokenStatus::WaitingForSiblings)
                .min_by_key(|t| (t.arrived_at.unwrap_or(i64::MAX), t.id));
            let origin = match earliest_waiting {
                Some(token) => dispatcher.find_origin(token).await?,
                None => None,
            };
            let plan = match plan_timeout(&TimeoutInput {
                fan_in: &fan_in,
                transition: &transition,
                sync: &sync,
                siblings: &siblings,
                origin: origin.as_ref(),
                now,
            }) {
                Ok(plan) => plan,
                Err(err) => fail_plan(err.to_string()),
            };
            dispatcher.apply(plan, now).await?;
        }
        self.maybe_finalize(now).await
    }

    /// Cancel the run: subworkflow children first, then every non-terminal
    /// token, then the guarded status write. Safe to repeat.
    pub async fn cancel(&self, reason: Option<&str>) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        let reason = reason.unwrap_or("cancelled by caller");

        for sub in self.store.active_subworkflows(self.run_id).await? {
            if let Err(error) = self
                .ports
                .subworkflows
                .cancel(sub.subworkflow_run_id, reason)
                .await
            {
                tracing::warn!(%error, subworkflow_run_id = %sub.subworkflow_run_id, "subworkflow cancel failed");
            }
            self.store
                .update_subworkflow_status(sub.id, SubworkflowStatus::Cancelled, now)
                .await?;
        }
        for token in self.store.load_tokens(self.run_id).await? {
            if token.status.is_active() {
                self.store
                    .update_token_status(self.run_id, token.id, TokenStatus::Cancelled, now)
                    .await?;
            }
        }
        let applied = self
            .store
            .update_status(self.run_id, RunStatus::Cancelled, now)
            .await?;
        if applied {
            self.ports
                .trace
                .emit(
                    self.run_id,
                    &TraceEvent::RunCancelled {
                        run_id: self.run_id,
                        reason: reason.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Worker pulled the task: `dispatched → executing`.
    pub async fn mark_task_executing(&self, token_id: Uuid) -> Result<()> {
        let _gate = self.gate.lock().await;
        let now = now_ms();
        if let Some(token) = self.store.load_token(self.run_id, token_id).await? {
            if token.status == TokenStatus::Dispatched {
                self.store
                    .update_token_status(self.run_id, token_id, TokenStatus::Executing, now)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn inspect(&self) -> Result<RunInspection> {
        Ok(RunInspection {
            run_id: self.run_id,
            status: self.store.load_status(self.run_id).await?,
            tokens: self.store.load_tokens(self.run_id).await?,
            waiting_fan_ins: self.store.waiting_fan_ins(self.run_id).await?,
        })
    }

    // ── Result handling ──

    async fn handle_success(&self, token: &Token, output: Value, now: Timestamp) -> Result<()> {
        let node = match self.def.node(&token.node_id) {
            Ok(node) => node.clone(),
            Err(err) => {
                return self
                    .dispatcher()
                    .apply(fail_plan(err.to_string()), now)
                    .await
                    .map(|_| ());
            }
        };
        let schema_violation = node.output_schema.as_ref().and_then(|schema| {
            jsonschema::validator_for(schema)
                .ok()
                .and_then(|validator| validator.validate(&output).err().map(|e| e.to_string()))
        });
        if let Some(message) = schema_violation {
            return self
                .handle_failure(
                    token,
                    TaskError {
                        error_type: "output_validation".to_string(),
                        step_ref: Some(node.id.clone()),
                        message,
                        retryable: false,
                    },
                    now,
                )
                .await;
        }

        // Record the output, then release the token.
        let mut pre = Plan::default();
        if token.branch_total > 1 {
            pre.decisions.push(Decision::ApplyBranchOutput {
                token_id: token.id,
                output: output.clone(),
            });
        } else if !node.output_mapping.is_empty() {
            let ctx = self.store.read_context(self.run_id).await?;
            let eval_ctx = EvalContext::with_result(&ctx, &output);
            for (target, expr) in &node.output_mapping {
                match crate::condition::evaluate(expr, &eval_ctx) {
                    Ok(value) => pre.decisions.push(Decision::SetContext {
                        target: target.clone(),
                        value,
                    }),
                    Err(err) => {
                        return self
                            .dispatcher()
                            .apply(fail_plan(err.to_string()), now)
                            .await
                            .map(|_| ());
                    }
                }
            }
        } else {
            pre.decisions.push(Decision::ApplyOutput { value: output });
        }
        pre.decisions.push(Decision::UpdateTokenStatus {
            token_id: token.id,
            status: TokenStatus::Completed,
        });
        self.dispatcher().apply(pre, now).await?;

        // Route on the updated context.
        let ctx = self.store.read_context(self.run_id).await?;
        let mut routed = token.clone();
        routed.status = TokenStatus::Completed;
        let transitions = self.def.outbound_transitions(&token.node_id);
        let plan = match plan_routing(&RoutingInput {
            token: &routed,
            transitions: &transitions,
            ctx: &ctx,
        }) {
            Ok(plan) => plan,
            Err(err) => fail_plan(err.to_string()),
        };
        self.dispatcher().apply(plan, now).await?;
        Ok(())
    }

    async fn handle_failure(&self, token: &Token, error: TaskError, now: Timestamp) -> Result<()> {
        let dispatcher = self.dispatcher();
        if error.retryable && token.retry_count < MAX_TASK_RETRIES {
            let attempt = self.store.bump_retry(self.run_id, token.id, now).await?;
            let task_ref = self
                .def
                .node(&token.node_id)
                .ok()
                .and_then(|n| n.task_ref.clone())
                .unwrap_or_default();
            self.ports
                .trace
                .emit(
                    self.run_id,
                    &TraceEvent::TaskRetried {
                        token_id: token.id,
                        task_ref,
                        attempt,
                    },
                )
                .await;
            return dispatcher
                .apply(
                    Plan {
                        decisions: vec![Decision::MarkForDispatch {
                            token_id: token.id,
                            node_id: token.node_id.clone(),
                        }],
                        events: vec![],
                    },
                    now,
                )
                .await
                .map(|_| ());
        }

        dispatcher
            .apply(
                Plan {
                    decisions: vec![Decision::UpdateTokenStatus {
                        token_id: token.id,
                        status: TokenStatus::Failed,
                    }],
                    events: vec![],
                },
                now,
            )
            .await?;

        // A failure adjacent to a fan-in over the token's own sibling group
        // is absorbed by the synchronization (terminal siblings count, only
        // completed ones contribute outputs). Anything else fails the run.
        if let Some(group) = &token.sibling_group {
            let absorbing = self
                .def
                .outbound_transitions(&token.node_id)
                .into_iter()
                .find(|t| {
                    t.synchronization
                        .as_ref()
                        .is_some_and(|s| &s.sibling_group == group)
                })
                .map(|t| t.id.clone());
            if let Some(transition_id) = absorbing {
                return dispatcher
                    .apply(
                        Plan {
                            decisions: vec![Decision::CheckSynchronization {
                                token_id: token.id,
                                transition_id,
                            }],
                            events: vec![],
                        },
                        now,
                    )
                    .await
                    .map(|_| ());
            }
        }

        dispatcher
            .apply(
                fail_plan(format!(
                    "task at node '{}' failed: {}",
                    token.node_id, error.message
                )),
                now,
            )
            .await
            .map(|_| ())
    }

    // ── Finalization ──

    async fn run_is_terminal(&self) -> Result<bool> {
        Ok(self
            .store
            .load_status(self.run_id)
            .await?
            .is_some_and(RunStatus::is_terminal))
    }

    /// Finalize when nothing is left in flight: no active tokens, no active
    /// subworkflows, status still `running`.
    async fn maybe_finalize(&self, now: Timestamp) -> Result<()> {
        if self.store.load_status(self.run_id).await? != Some(RunStatus::Running) {
            return Ok(());
        }
        if self.store.active_token_count(self.run_id).await? > 0 {
            return Ok(());
        }
        if !self.store.active_subworkflows(self.run_id).await?.is_empty() {
            return Ok(());
        }
        let ctx = self.store.read_context(self.run_id).await?;
        let plan = match plan_completion(self.def.def(), &ctx, self.run_id, now) {
            Ok(plan) => plan,
            Err(err) => fail_plan(err.to_string()),
        };
        self.dispatcher().apply(plan, now).await?;
        Ok(())
    }
}

fn fail_plan(reason: String) -> Plan {
    Plan {
        decisions: vec![Decision::FailWorkflow { reason }],
        events: vec![],
    }
}
