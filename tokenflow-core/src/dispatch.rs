use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::condition::{apply_mapping, EvalContext};
use crate::definition::RunDefinition;
use crate::error::CoordinatorError;
use crate::events::TraceEvent;
use crate::merge;
use crate::outbound::{AlarmScheduler, SubworkflowClient, TaskExecutor, TraceSink};
use crate::path;
use crate::planner::{plan_arrival, plan_routing, ArrivalInput, RoutingInput, SyncOutcome};
use crate::store::RunStore;
use crate::types::{
    Decision, DispatchSummary, FanIn, FanInStatus, NewToken, NodeKind, Plan, RunStatus,
    SubworkflowStatus, TaskDispatch, Timestamp, Token, TokenStatus, Transition,
};

/// Upper bound on parent-chain walks when locating a fan-out origin.
const MAX_LINEAGE_WALK: usize = 64;

/// Ceiling on decisions processed per apply call. Cycles are bounded by
/// loop caps in well-formed definitions; this catches the malformed ones.
const MAX_DECISIONS_PER_APPLY: usize = 10_000;

/// Applies plans against the stores and the outbound ports.
///
/// Decisions are processed in list order; handlers may enqueue derived
/// decisions (node entry after token creation, synchronization arrivals,
/// routing after a passthrough). Each planning call's output forms a
/// segment: when a conditional fan-in write loses its race, the rest of
/// that segment is dropped, since the winner's plan owns the siblings.
pub struct Dispatcher {
    pub run_id: Uuid,
    pub def: Arc<RunDefinition>,
    pub store: Arc<dyn RunStore>,
    pub executor: Arc<dyn TaskExecutor>,
    pub subworkflows: Arc<dyn SubworkflowClient>,
    pub trace: Arc<dyn TraceSink>,
    pub alarms: Arc<dyn AlarmScheduler>,
}

struct Work {
    queue: VecDeque<(usize, Decision)>,
    events: Vec<(usize, TraceEvent)>,
    skipped: HashSet<usize>,
    next_segment: usize,
}

impl Work {
    fn seed(plan: Plan) -> Self {
        let mut work = Work {
            queue: VecDeque::new(),
            events: Vec::new(),
            skipped: HashSet::new(),
            next_segment: 1,
        };
        for decision in plan.decisions {
            work.queue.push_back((0, decision));
        }
        for event in plan.events {
            work.events.push((0, event));
        }
        work
    }

    fn push_plan(&mut self, plan: Plan) {
        let segment = self.next_segment;
        self.next_segment += 1;
        for decision in plan.decisions {
            self.queue.push_back((segment, decision));
        }
        for event in plan.events {
            self.events.push((segment, event));
        }
    }

    fn push(&mut self, segment: usize, decision: Decision) {
        self.queue.push_back((segment, decision));
    }
}

impl Dispatcher {
    /// Apply a plan and everything it cascades into. Store mutations come
    /// before external calls per decision; trace events for each planning
    /// segment are emitted after its mutations.
    pub async fn apply(&self, plan: Plan, now: Timestamp) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut work = Work::seed(plan);
        let mut processed = 0usize;

        while let Some((segment, decision)) = work.queue.pop_front() {
            if work.skipped.contains(&segment) {
                continue;
            }
            processed += 1;
            if processed > MAX_DECISIONS_PER_APPLY {
                anyhow::bail!(
                    "dispatch exceeded {MAX_DECISIONS_PER_APPLY} decisions for run {}",
                    self.run_id
                );
            }
            self.apply_one(segment, decision, &mut work, &mut summary, now)
                .await?;
        }

        for (segment, event) in &work.events {
            if !work.skipped.contains(segment) {
                self.trace.emit(self.run_id, event).await;
            }
        }
        Ok(summary)
    }

    async fn apply_one(
        &self,
        segment: usize,
        decision: Decision,
        work: &mut Work,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        match decision {
            Decision::CreateToken { spec } => {
                // Batch the run of consecutive creations in this segment
                // into a single store write.
                let mut specs = vec![spec];
                while let Some((next_segment, Decision::CreateToken { .. })) = work.queue.front() {
                    if *next_segment != segment {
                        break;
                    }
                    match work.queue.pop_front() {
                        Some((_, Decision::CreateToken { spec })) => specs.push(spec),
                        _ => unreachable!("front() said CreateToken"),
                    }
                }
                self.create_tokens(segment, specs, work, summary, now).await?;
            }

            Decision::UpdateTokenStatus { token_id, status } => {
                let applied = self
                    .store
                    .update_token_status(self.run_id, token_id, status, now)
                    .await?;
                summary.applied += 1;
                if applied {
                    self.trace
                        .emit(self.run_id, &TraceEvent::TokenStatusChanged { token_id, status })
                        .await;
                }
            }

            Decision::MarkWaiting {
                token_id,
                arrived_at,
            } => {
                let applied = self.store.mark_waiting(self.run_id, token_id, arrived_at).await?;
                summary.applied += 1;
                if applied {
                    self.trace
                        .emit(
                            self.run_id,
                            &TraceEvent::TokenStatusChanged {
                                token_id,
                                status: TokenStatus::WaitingForSiblings,
                            },
                        )
                        .await;
                }
            }

            Decision::MarkForDispatch { token_id, .. } => {
                self.mark_for_dispatch(segment, token_id, work, summary, now)
                    .await?;
            }

            Decision::CheckSynchronization {
                token_id,
                transition_id,
            } => {
                let Some(token) = self.store.load_token(self.run_id, token_id).await? else {
                    summary
                        .errors
                        .push(format!("synchronization check for unknown token {token_id}"));
                    return Ok(());
                };
                let transition = match self.def.transition(&transition_id) {
                    Ok(t) => t.clone(),
                    Err(err) => {
                        self.push_definition_failure(work, summary, err);
                        return Ok(());
                    }
                };
                self.check_synchronization(segment, &token, &transition, work, summary, now)
                    .await?;
            }

            Decision::CreateFanIn {
                node_id,
                fan_in_path,
                transition_id,
                first_arrival_at,
            } => {
                let fan_in = FanIn {
                    id: Uuid::now_v7(),
                    run_id: self.run_id,
                    node_id,
                    fan_in_path,
                    status: FanInStatus::Waiting,
                    transition_id,
                    first_arrival_at,
                    activated_at: None,
                    activated_by_token_id: None,
                };
                // Losing this insert to a concurrent arrival is benign.
                self.store.create_fan_in_if_absent(&fan_in).await?;
                summary.applied += 1;
            }

            Decision::ActivateFanIn {
                fan_in_path,
                token_id,
            } => {
                let won = self
                    .store
                    .finish_fan_in(
                        self.run_id,
                        &fan_in_path,
                        FanInStatus::Activated,
                        Some(token_id),
                        now,
                    )
                    .await?;
                summary.applied += 1;
                if !won {
                    // Lost the race: stand down and drop the rest of this
                    // segment. The winner's plan handles the siblings.
                    work.skipped.insert(segment);
                    self.store
                        .update_token_status(self.run_id, token_id, TokenStatus::Completed, now)
                        .await?;
                    self.trace
                        .emit(
                            self.run_id,
                            &TraceEvent::SyncLostRace {
                                fan_in_path,
                                token_id,
                            },
                        )
                        .await;
                }
            }

            Decision::TimeoutFanIn {
                fan_in_path,
                proceeding_token,
            } => {
                let won = self
                    .store
                    .finish_fan_in(
                        self.run_id,
                        &fan_in_path,
                        FanInStatus::TimedOut,
                        proceeding_token,
                        now,
                    )
                    .await?;
                summary.applied += 1;
                if !won {
                    work.skipped.insert(segment);
                }
            }

            Decision::SetContext { target, value } => {
                self.store
                    .set_context_value(self.run_id, &target, &value)
                    .await?;
                summary.applied += 1;
                self.trace
                    .emit(self.run_id, &TraceEvent::ContextUpdated { target })
                    .await;
            }

            Decision::ApplyOutput { value } => {
                self.store.merge_output(self.run_id, &value).await?;
                summary.applied += 1;
                self.trace
                    .emit(
                        self.run_id,
                        &TraceEvent::ContextUpdated {
                            target: "output".to_string(),
                        },
                    )
                    .await;
            }

            Decision::InitBranchTable { token_id } => {
                self.store.init_branch_table(self.run_id, token_id).await?;
                summary.applied += 1;
            }

            Decision::ApplyBranchOutput { token_id, output } => {
                self.store
                    .write_branch_output(self.run_id, token_id, &output)
                    .await?;
                summary.applied += 1;
            }

            Decision::MergeBranches {
                token_ids,
                source,
                target,
                strategy,
            } => {
                self.merge_branches(work, summary, &token_ids, source.as_deref(), &target, &strategy)
                    .await?;
            }

            Decision::DropBranchTables { token_ids } => {
                self.store.drop_branch_tables(self.run_id, &token_ids).await?;
                summary.applied += 1;
                self.trace
                    .emit(self.run_id, &TraceEvent::BranchTablesDropped { token_ids })
                    .await;
            }

            Decision::ScheduleAlarm { at } => {
                self.alarms.schedule(self.run_id, at).await?;
                summary.applied += 1;
            }

            Decision::CompleteWorkflow { output } => {
                let applied = self
                    .store
                    .update_status(self.run_id, RunStatus::Completed, now)
                    .await?;
                summary.applied += 1;
                if applied {
                    self.store.merge_output(self.run_id, &output).await?;
                }
            }

            Decision::FailWorkflow { reason } => {
                self.fail_workflow(summary, &reason, now).await?;
            }
        }
        Ok(())
    }

    // ── Token creation and node entry ──

    async fn create_tokens(
        &self,
        segment: usize,
        specs: Vec<NewToken>,
        work: &mut Work,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        let mut batch = Vec::with_capacity(specs.len());
        for spec in &specs {
            batch.push(Token {
                id: Uuid::now_v7(),
                run_id: self.run_id,
                node_id: spec.node_id.clone(),
                status: TokenStatus::Pending,
                parent_token_id: spec.parent_token_id,
                path_id: spec.path_id.clone(),
                sibling_group: spec.sibling_group.clone(),
                branch_index: spec.branch_index,
                branch_total: spec.branch_total,
                iteration_counts: spec.iteration_counts.clone(),
                retry_count: 0,
                created_at: now,
                updated_at: now,
                arrived_at: None,
            });
        }
        self.store
            .insert_tokens(&batch)
            .await
            .context("batched token insert")?;
        summary.applied += specs.len();
        summary.tokens_created += specs.len();
        self.trace
            .emit(
                self.run_id,
                &TraceEvent::TokensCreated {
                    token_ids: batch.iter().map(|t| t.id).collect(),
                    node_ids: batch.iter().map(|t| t.node_id.clone()).collect(),
                },
            )
            .await;

        for (token, spec) in batch.into_iter().zip(&specs) {
            if token.branch_total > 1 {
                work.push(segment, Decision::InitBranchTable { token_id: token.id });
            }
            // Synchronization is checked before any node entry when the
            // token arrived through a synchronized transition.
            let synchronized = spec
                .via_transition
                .as_ref()
                .and_then(|id| self.def.transition(id).ok())
                .is_some_and(|t| t.synchronization.is_some());
            match (&spec.via_transition, synchronized) {
                (Some(transition_id), true) => work.push(
                    segment,
                    Decision::CheckSynchronization {
                        token_id: token.id,
                        transition_id: transition_id.clone(),
                    },
                ),
                _ => self.enter_node(segment, &token, work, summary, now).await?,
            }
        }
        Ok(())
    }

    /// A token has landed on its node with synchronization out of the way:
    /// dispatch a task, spawn a subworkflow, or route straight through.
    async fn enter_node(
        &self,
        segment: usize,
        token: &Token,
        work: &mut Work,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        let node = match self.def.node(&token.node_id) {
            Ok(node) => node.clone(),
            Err(err) => {
                self.push_definition_failure(work, summary, err);
                return Ok(());
            }
        };
        match node.kind {
            NodeKind::Task => {
                work.push(
                    segment,
                    Decision::MarkForDispatch {
                        token_id: token.id,
                        node_id: token.node_id.clone(),
                    },
                );
            }
            NodeKind::Subworkflow => {
                self.spawn_subworkflow(token, &node.workflow_ref, summary, now)
                    .await?;
            }
            NodeKind::Passthrough => {
                // Completes on arrival; routing continues in this cycle.
                self.store
                    .update_token_status(self.run_id, token.id, TokenStatus::Completed, now)
                    .await?;
                self.trace
                    .emit(
                        self.run_id,
                        &TraceEvent::TokenStatusChanged {
                            token_id: token.id,
                            status: TokenStatus::Completed,
                        },
                    )
                    .await;
                let mut routed = token.clone();
                routed.status = TokenStatus::Completed;
                let ctx = self.store.read_context(self.run_id).await?;
                let transitions = self.def.outbound_transitions(&token.node_id);
                match plan_routing(&RoutingInput {
                    token: &routed,
                    transitions: &transitions,
                    ctx: &ctx,
                }) {
                    Ok(plan) => work.push_plan(plan),
                    Err(err) => self.push_planning_failure(work, summary, err),
                }
            }
        }
        Ok(())
    }

    async fn mark_for_dispatch(
        &self,
        _segment: usize,
        token_id: Uuid,
        work: &mut Work,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        let Some(token) = self.store.load_token(self.run_id, token_id).await? else {
            summary
                .errors
                .push(format!("dispatch requested for unknown token {token_id}"));
            return Ok(());
        };
        if token.status.is_terminal() {
            return Ok(());
        }
        let node = match self.def.node(&token.node_id) {
            Ok(node) => node.clone(),
            Err(err) => {
                self.push_definition_failure(work, summary, err);
                return Ok(());
            }
        };
        let Some(task_ref) = node.task_ref.clone() else {
            self.push_definition_failure(
                work,
                summary,
                CoordinatorError::definition(format!(
                    "task node '{}' has no task_ref",
                    node.id
                )),
            );
            return Ok(());
        };

        let ctx = self.store.read_context(self.run_id).await?;
        let input = if node.input_mapping.is_empty() {
            json!({
                "input": ctx.input,
                "state": ctx.state,
                "output": ctx.output,
            })
        } else {
            match apply_mapping(&node.input_mapping, &EvalContext::new(&ctx)) {
                Ok(input) => input,
                Err(err) => {
                    // An unevaluable mapping fails the token, then the run.
                    self.store
                        .update_token_status(self.run_id, token.id, TokenStatus::Failed, now)
                        .await?;
                    self.push_planning_failure(work, summary, err);
                    return Ok(());
                }
            }
        };

        // Mutation before the external call; a dup dispatch after a crash
        // is absorbed by the executor's correlation key.
        self.store
            .update_token_status(self.run_id, token.id, TokenStatus::Dispatched, now)
            .await?;
        self.executor
            .dispatch(&TaskDispatch {
                task_ref: task_ref.clone(),
                input,
                correlation: token.id,
                run_id: self.run_id,
                timeout_ms: node.timeout_ms,
            })
            .await
            .context("executor dispatch")?;
        summary.applied += 1;
        summary.tokens_dispatched += 1;
        self.trace
            .emit(
                self.run_id,
                &TraceEvent::TaskDispatched {
                    token_id: token.id,
                    task_ref,
                },
            )
            .await;
        Ok(())
    }

    async fn spawn_subworkflow(
        &self,
        token: &Token,
        workflow_ref: &Option<String>,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        let Some(workflow_ref) = workflow_ref else {
            summary.errors.push(format!(
                "subworkflow node '{}' has no workflow_ref",
                token.node_id
            ));
            return Ok(());
        };
        let node = self.def.node(&token.node_id).map(Clone::clone);
        let ctx = self.store.read_context(self.run_id).await?;
        let input = match node {
            Ok(node) if !node.input_mapping.is_empty() => {
                apply_mapping(&node.input_mapping, &EvalContext::new(&ctx))
                    .unwrap_or_else(|_| json!({}))
            }
            _ => ctx.input.clone(),
        };
        self.store
            .update_token_status(
                self.run_id,
                token.id,
                TokenStatus::WaitingForSubworkflow,
                now,
            )
            .await?;
        let subworkflow_run_id = self
            .subworkflows
            .spawn(self.run_id, token.id, workflow_ref, &input)
            .await
            .context("subworkflow spawn")?;
        self.store
            .insert_subworkflow(&crate::types::Subworkflow {
                id: Uuid::now_v7(),
                run_id: self.run_id,
                parent_token_id: token.id,
                subworkflow_run_id,
                status: SubworkflowStatus::Running,
                timeout_ms: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        summary.applied += 1;
        self.trace
            .emit(
                self.run_id,
                &TraceEvent::SubworkflowSpawned {
                    token_id: token.id,
                    subworkflow_run_id,
                },
            )
            .await;
        Ok(())
    }

    // ── Synchronization entry ──

    /// Gather the cohort state and run the arrival planner for a token at a
    /// synchronized transition.
    async fn check_synchronization(
        &self,
        segment: usize,
        token: &Token,
        transition: &Transition,
        work: &mut Work,
        summary: &mut DispatchSummary,
        now: Timestamp,
    ) -> Result<()> {
        let Some(sync) = &transition.synchronization else {
            return self.enter_node(segment, token, work, summary, now).await;
        };
        let siblings = self
            .store
            .tokens_in_group(self.run_id, &sync.sibling_group)
            .await?;
        let prefix = path::sibling_prefix(&token.path_id, token.branch_total, token.branch_index);
        let fan_in_path = path::fan_in_path(&prefix, &transition.id);
        let fan_in = self.store.load_fan_in(self.run_id, &fan_in_path).await?;
        let branch_rows = self.gather_branch_rows(&siblings).await?;
        let origin = self.find_origin(token).await?;

        let sync_plan = match plan_arrival(&ArrivalInput {
            token,
            transition,
            sync,
            siblings: &siblings,
            fan_in: fan_in.as_ref(),
            branch_rows: &branch_rows,
            origin: origin.as_ref(),
            now,
        }) {
            Ok(sync_plan) => sync_plan,
            Err(err) => {
                self.push_planning_failure(work, summary, err);
                return Ok(());
            }
        };
        match sync_plan.outcome {
            SyncOutcome::NotSynchronized => {
                self.enter_node(segment, token, work, summary, now).await
            }
            _ => {
                work.push_plan(sync_plan.plan);
                Ok(())
            }
        }
    }

    /// Branch rows for a sibling cohort, one per branch index: empty rows
    /// (tables created but never written) are dropped, and when several
    /// lineage generations share an index the newest written row wins.
    pub async fn gather_branch_rows(
        &self,
        siblings: &[Token],
    ) -> Result<Vec<(Uuid, u32, Value)>> {
        let ids: Vec<Uuid> = siblings.iter().map(|t| t.id).collect();
        let raw = self.store.read_branch_rows(self.run_id, &ids).await?;
        let mut ordered: Vec<(&Token, Value)> = Vec::new();
        for (token_id, row) in raw {
            if row.as_object().is_some_and(|m| m.is_empty()) {
                continue;
            }
            if let Some(token) = siblings.iter().find(|t| t.id == token_id) {
                ordered.push((token, row));
            }
        }
        ordered.sort_by_key(|(token, _)| (token.created_at, token.id));
        let mut by_index: std::collections::BTreeMap<u32, (Uuid, u32, Value)> =
            std::collections::BTreeMap::new();
        for (token, row) in ordered {
            by_index.insert(token.branch_index, (token.id, token.branch_index, row));
        }
        Ok(by_index.into_values().collect())
    }

    /// Walk the parent chain to the ancestor the fan-in collapses onto: the
    /// first one whose path already equals the collapsed path.
    pub async fn find_origin(&self, token: &Token) -> Result<Option<Token>> {
        let prefix = path::sibling_prefix(&token.path_id, token.branch_total, token.branch_index);
        let collapsed = prefix
            .rsplit_once('.')
            .map(|(head, _)| head.to_string())
            .unwrap_or(prefix);
        let mut cursor = token.parent_token_id;
        for _ in 0..MAX_LINEAGE_WALK {
            let Some(parent_id) = cursor else { break };
            let Some(parent) = self.store.load_token(self.run_id, parent_id).await? else {
                break;
            };
            if parent.path_id == collapsed {
                return Ok(Some(parent));
            }
            cursor = parent.parent_token_id;
        }
        Ok(None)
    }

    // ── Merge, failure, and plumbing ──

    async fn merge_branches(
        &self,
        work: &mut Work,
        summary: &mut DispatchSummary,
        token_ids: &[Uuid],
        source: Option<&str>,
        target: &str,
        strategy: &str,
    ) -> Result<()> {
        let tokens = self.store.load_tokens(self.run_id).await?;
        let cohort: Vec<Token> = tokens
            .into_iter()
            .filter(|t| token_ids.contains(&t.id))
            .collect();
        let rows = self.gather_branch_rows(&cohort).await?;
        let outputs = merge::collect_outputs(&rows, source);
        let merged = match merge::apply(strategy, &outputs) {
            Ok(merged) => merged,
            Err(err) => {
                // Unknown strategy is fatal for the run.
                self.push_planning_failure(work, summary, err);
                return Ok(());
            }
        };
        self.store
            .set_context_value(self.run_id, target, &merged)
            .await?;
        self.store.drop_branch_tables(self.run_id, token_ids).await?;
        summary.applied += 1;
        self.trace
            .emit(
                self.run_id,
                &TraceEvent::BranchesMerged {
                    strategy: strategy.to_string(),
                    target: target.to_string(),
                    branches: outputs.len() as u32,
                },
            )
            .await;
        self.trace
            .emit(
                self.run_id,
                &TraceEvent::BranchTablesDropped {
                    token_ids: token_ids.to_vec(),
                },
            )
            .await;
        Ok(())
    }

    /// Terminal failure: cancel whatever is in flight, then write the
    /// guarded status. Double finalization is a no-op by construction.
    async fn fail_workflow(
        &self,
        summary: &mut DispatchSummary,
        reason: &str,
        now: Timestamp,
    ) -> Result<()> {
        let tokens = self.store.load_tokens(self.run_id).await?;
        for token in tokens.iter().filter(|t| t.status.is_active()) {
            self.store
                .update_token_status(self.run_id, token.id, TokenStatus::Cancelled, now)
                .await?;
        }
        let applied = self
            .store
            .update_status(self.run_id, RunStatus::Failed, now)
            .await?;
        summary.applied += 1;

        // External cancellations after the store writes.
        for sub in self.store.active_subworkflows(self.run_id).await? {
            if let Err(error) = self
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
        if applied {
            self.trace
                .emit(
                    self.run_id,
                    &TraceEvent::RunFailed {
                        run_id: self.run_id,
                        reason: reason.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    fn push_definition_failure(
        &self,
        work: &mut Work,
        summary: &mut DispatchSummary,
        err: CoordinatorError,
    ) {
        summary.errors.push(err.to_string());
        work.push(
            0,
            Decision::FailWorkflow {
                reason: err.to_string(),
            },
        );
    }

    fn push_planning_failure(
        &self,
        work: &mut Work,
        summary: &mut DispatchSummary,
        err: CoordinatorError,
    ) {
        summary.errors.push(err.to_string());
        work.push(
            0,
            Decision::FailWorkflow {
                reason: err.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{MemoryAlarms, MemoryTraceSink, QueueExecutor, RecordingSubworkflows};
    use crate::store_memory::MemoryRunStore;
    use std::collections::BTreeMap;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryRunStore>,
        executor: Arc<QueueExecutor>,
        trace: Arc<MemoryTraceSink>,
    }

    fn fixture(def_json: Value) -> Fixture {
        let def = Arc::new(
            RunDefinition::load(serde_json::from_value(def_json).expect("definition json"))
                .expect("definition loads"),
        );
        let store = Arc::new(MemoryRunStore::new());
        let executor = Arc::new(QueueExecutor::new());
        let trace = Arc::new(MemoryTraceSink::new());
        let dispatcher = Dispatcher {
            run_id: Uuid::now_v7(),
            def,
            store: store.clone(),
            executor: executor.clone(),
            subworkflows: Arc::new(RecordingSubworkflows::new()),
            trace: trace.clone(),
            alarms: Arc::new(MemoryAlarms::new()),
        };
        Fixture {
            dispatcher,
            store,
            executor,
            trace,
        }
    }

    fn two_node_def() -> Value {
        json!({
            "id": "wf",
            "initial_node_id": "a",
            "nodes": [
                {"id": "a", "kind": "task", "task_ref": "task_a"},
                {"id": "b", "kind": "task", "task_ref": "task_b"},
                {"id": "m", "kind": "task", "task_ref": "task_m"}
            ],
            "transitions": [
                {"id": "t_ab", "from": "a", "to": "b", "priority": 1},
                {
                    "id": "t_join", "from": "b", "to": "m", "priority": 1,
                    "synchronization": {"strategy": "all", "sibling_group": "g"}
                }
            ]
        })
    }

    fn spec_at(node: &str) -> NewToken {
        NewToken {
            node_id: node.to_string(),
            parent_token_id: None,
            path_id: "root".to_string(),
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: BTreeMap::new(),
            via_transition: None,
        }
    }

    fn stored_token(
        run_id: Uuid,
        node: &str,
        path: &str,
        branch_index: u32,
        branch_total: u32,
        parent: Option<Uuid>,
        created_at: Timestamp,
    ) -> Token {
        Token {
            id: Uuid::now_v7(),
            run_id,
            node_id: node.to_string(),
            status: TokenStatus::Executing,
            parent_token_id: parent,
            path_id: path.to_string(),
            sibling_group: Some("g".to_string()),
            branch_index,
            branch_total,
            iteration_counts: BTreeMap::new(),
            retry_count: 0,
            created_at,
            updated_at: created_at,
            arrived_at: None,
        }
    }

    async fn init_context(fx: &Fixture) {
        let run_id = fx.dispatcher.run_id;
        fx.store.init_run(run_id, "wf", 0).await.unwrap();
        fx.store
            .init_context(run_id, fx.dispatcher.def.def(), &json!({}))
            .await
            .unwrap();
    }

    async fn created_events(fx: &Fixture) -> Vec<Vec<Uuid>> {
        fx.trace
            .events(fx.dispatcher.run_id)
            .await
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::TokensCreated { token_ids, .. } => Some(token_ids),
                _ => None,
            })
            .collect()
    }

    /// A run of consecutive creations lands in one store write: one
    /// TokensCreated event carrying all three ids, and each token still
    /// enters its node.
    #[tokio::test]
    async fn consecutive_token_creations_batch_into_one_insert() {
        let fx = fixture(two_node_def());
        init_context(&fx).await;

        let plan = Plan {
            decisions: vec![
                Decision::CreateToken { spec: spec_at("b") },
                Decision::CreateToken { spec: spec_at("b") },
                Decision::CreateToken { spec: spec_at("b") },
            ],
            events: vec![],
        };
        let summary = fx.dispatcher.apply(plan, 10).await.unwrap();

        assert_eq!(summary.tokens_created, 3);
        assert_eq!(summary.tokens_dispatched, 3);
        let batches = created_events(&fx).await;
        assert_eq!(batches.len(), 1, "one batch, one event");
        assert_eq!(batches[0].len(), 3);
        assert_eq!(fx.executor.activate(&[], 16).await.len(), 3);
    }

    /// An interleaved decision splits the batch: two creation runs, two
    /// events.
    #[tokio::test]
    async fn non_consecutive_creations_do_not_merge() {
        let fx = fixture(two_node_def());
        init_context(&fx).await;
        let run_id = fx.dispatcher.run_id;
        let pre = stored_token(run_id, "a", "root", 0, 1, None, 5);
        fx.store.insert_tokens(&[pre.clone()]).await.unwrap();

        let plan = Plan {
            decisions: vec![
                Decision::CreateToken { spec: spec_at("b") },
                Decision::UpdateTokenStatus {
                    token_id: pre.id,
                    status: TokenStatus::Completed,
                },
                Decision::CreateToken { spec: spec_at("b") },
            ],
            events: vec![],
        };
        fx.dispatcher.apply(plan, 10).await.unwrap();

        let batches = created_events(&fx).await;
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1));
        let pre = fx.store.load_token(run_id, pre.id).await.unwrap().unwrap();
        assert_eq!(pre.status, TokenStatus::Completed);
    }

    /// One row per branch index: empty rows are dropped and the newest
    /// written row wins when two lineage generations share an index.
    #[tokio::test]
    async fn gather_branch_rows_dedupes_by_index_keeping_newest() {
        let fx = fixture(two_node_def());
        let run_id = fx.dispatcher.run_id;

        let older = stored_token(run_id, "b", "root.a.0", 0, 3, None, 100);
        let newer = stored_token(run_id, "m", "root.a.0", 0, 3, Some(older.id), 200);
        let unwritten = stored_token(run_id, "b", "root.a.1", 1, 3, None, 300);
        let tableless = stored_token(run_id, "b", "root.a.2", 2, 3, None, 400);
        let siblings = vec![older.clone(), newer.clone(), unwritten.clone(), tableless];

        for token in &siblings[..3] {
            fx.store.init_branch_table(run_id, token.id).await.unwrap();
        }
        fx.store
            .write_branch_output(run_id, older.id, &json!({"vote": "old"}))
            .await
            .unwrap();
        fx.store
            .write_branch_output(run_id, newer.id, &json!({"vote": "new"}))
            .await
            .unwrap();

        let rows = fx.dispatcher.gather_branch_rows(&siblings).await.unwrap();
        assert_eq!(rows.len(), 1);
        let (token_id, branch_index, row) = &rows[0];
        assert_eq!(*token_id, newer.id);
        assert_eq!(*branch_index, 0);
        assert_eq!(row["_branch"]["output"]["vote"], "new");
    }

    /// The lineage walk stops at the ancestor already sitting on the
    /// collapsed path; the root itself has no origin.
    #[tokio::test]
    async fn find_origin_walks_to_the_fan_out_parent() {
        let fx = fixture(two_node_def());
        let run_id = fx.dispatcher.run_id;

        let mut root = stored_token(run_id, "a", "root", 0, 1, None, 10);
        root.sibling_group = None;
        let member = stored_token(run_id, "b", "root.a.1", 1, 3, Some(root.id), 20);
        // Continuation: same lineage cell, one hop further.
        let child = stored_token(run_id, "m", "root.a.1", 1, 3, Some(member.id), 30);
        fx.store
            .insert_tokens(&[root.clone(), member.clone(), child.clone()])
            .await
            .unwrap();

        let origin = fx.dispatcher.find_origin(&child).await.unwrap().unwrap();
        assert_eq!(origin.id, root.id);
        assert_eq!(origin.path_id, "root");

        assert!(fx.dispatcher.find_origin(&root).await.unwrap().is_none());
    }

    /// A lost activation drops the rest of its segment: the token stands
    /// down as a late arrival and no proceeding token is created.
    #[tokio::test]
    async fn lost_activation_aborts_the_rest_of_the_segment() {
        let fx = fixture(two_node_def());
        init_context(&fx).await;
        let run_id = fx.dispatcher.run_id;

        let mut arriving = stored_token(run_id, "b", "root.a.0", 0, 3, None, 10);
        arriving.status = TokenStatus::Pending;
        fx.store.insert_tokens(&[arriving.clone()]).await.unwrap();
        fx.store
            .create_fan_in_if_absent(&FanIn {
                id: Uuid::now_v7(),
                run_id,
                node_id: "m".to_string(),
                fan_in_path: "root.a:t_join".to_string(),
                status: FanInStatus::Activated,
                transition_id: "t_join".to_string(),
                first_arrival_at: 5,
                activated_at: Some(8),
                activated_by_token_id: Some(Uuid::now_v7()),
            })
            .await
            .unwrap();

        let plan = Plan {
            decisions: vec![
                Decision::ActivateFanIn {
                    fan_in_path: "root.a:t_join".to_string(),
                    token_id: arriving.id,
                },
                Decision::CreateToken { spec: spec_at("m") },
            ],
            events: vec![],
        };
        let summary = fx.dispatcher.apply(plan, 20).await.unwrap();

        assert_eq!(summary.tokens_created, 0, "segment tail was skipped");
        let arriving = fx
            .store
            .load_token(run_id, arriving.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(arriving.status, TokenStatus::Completed);
        assert_eq!(fx.store.load_tokens(run_id).await.unwrap().len(), 1);
        assert!(fx
            .trace
            .events(run_id)
            .await
            .iter()
            .any(|e| e.event_type() == "decision.synchronization.lost_race"));
    }
}
