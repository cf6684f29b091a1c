use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::path;
use crate::store::RunStore;
use crate::types::{
    ContextSnapshot, FanIn, FanInStatus, RunStatus, Subworkflow, SubworkflowStatus, Timestamp,
    Token, TokenStatus, WorkflowDef,
};

/// Per-run context record with its compiled section validators.
struct RunContext {
    input: Value,
    state: Value,
    output: Value,
    state_validator: Option<Arc<Validator>>,
    output_validator: Option<Arc<Validator>>,
}

struct Inner {
    statuses: HashMap<Uuid, RunStatus>,
    tokens: HashMap<(Uuid, Uuid), Token>,
    fan_ins: HashMap<(Uuid, String), FanIn>,
    subworkflows: HashMap<Uuid, Subworkflow>,
    contexts: HashMap<Uuid, RunContext>,
    branch_rows: HashMap<(Uuid, Uuid), Value>,
}

/// In-memory implementation of `RunStore` for tests and POC runs.
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                statuses: HashMap::new(),
                tokens: HashMap::new(),
                fan_ins: HashMap::new(),
                subworkflows: HashMap::new(),
                contexts: HashMap::new(),
                branch_rows: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(schema: Option<&Value>) -> Result<Option<Arc<Validator>>> {
    match schema {
        None | Some(Value::Null) => Ok(None),
        Some(schema) => Ok(Some(Arc::new(
            jsonschema::validator_for(schema).map_err(|e| anyhow!("invalid schema: {e}"))?,
        ))),
    }
}

fn check(validator: Option<&Arc<Validator>>, value: &Value, section: &str) -> Result<()> {
    if let Some(validator) = validator {
        if let Err(error) = validator.validate(value) {
            return Err(CoordinatorError::Validation(format!(
                "{section} does not match its schema: {error}"
            ))
            .into());
        }
    }
    Ok(())
}

#[async_trait]
impl RunStore for MemoryRunStore {
    // ── Run status ──

    async fn init_run(&self, run_id: Uuid, _workflow_id: &str, _now: Timestamp) -> Result<()> {
        let mut w = self.inner.write().await;
        w.statuses.insert(run_id, RunStatus::Running);
        Ok(())
    }

    async fn load_status(&self, run_id: Uuid) -> Result<Option<RunStatus>> {
        let r = self.inner.read().await;
        Ok(r.statuses.get(&run_id).copied())
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        _now: Timestamp,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let current = w
            .statuses
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        if current.is_terminal() {
            return Ok(false);
        }
        *current = status;
        Ok(true)
    }

    // ── Tokens ──

    async fn insert_tokens(&self, tokens: &[Token]) -> Result<()> {
        let mut w = self.inner.write().await;
        for token in tokens {
            w.tokens.insert((token.run_id, token.id), token.clone());
        }
        Ok(())
    }

    async fn load_token(&self, run_id: Uuid, token_id: Uuid) -> Result<Option<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens.get(&(run_id, token_id)).cloned())
    }

    async fn load_tokens(&self, run_id: Uuid) -> Result<Vec<Token>> {
        let r = self.inner.read().await;
        let mut tokens: Vec<Token> = r
            .tokens
            .iter()
            .filter(|((rid, _), _)| *rid == run_id)
            .map(|(_, t)| t.clone())
            .collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tokens)
    }

    async fn tokens_by_status(&self, run_id: Uuid, status: TokenStatus) -> Result<Vec<Token>> {
        Ok(self
            .load_tokens(run_id)
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    async fn tokens_in_group(&self, run_id: Uuid, sibling_group: &str) -> Result<Vec<Token>> {
        Ok(self
            .load_tokens(run_id)
            .await?
            .into_iter()
            .filter(|t| t.sibling_group.as_deref() == Some(sibling_group))
            .collect())
    }

    async fn active_token_count(&self, run_id: Uuid) -> Result<usize> {
        let r = self.inner.read().await;
        Ok(r.tokens
            .iter()
            .filter(|((rid, _), t)| *rid == run_id && t.status.is_active())
            .count())
    }

    async fn update_token_status(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        status: TokenStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&(run_id, token_id))
            .ok_or_else(|| anyhow!("token not found: {token_id}"))?;
        if token.status.is_terminal() {
            return Ok(false);
        }
        token.status = status;
        token.updated_at = now;
        Ok(true)
    }

    async fn mark_waiting(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        arrived_at: Timestamp,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&(run_id, token_id))
            .ok_or_else(|| anyhow!("token not found: {token_id}"))?;
        if token.status.is_terminal() {
            return Ok(false);
        }
        token.status = TokenStatus::WaitingForSiblings;
        if token.arrived_at.is_none() {
            token.arrived_at = Some(arrived_at);
        }
        token.updated_at = arrived_at;
        Ok(true)
    }

    async fn bump_retry(&self, run_id: Uuid, token_id: Uuid, now: Timestamp) -> Result<u32> {
        let mut w = self.inner.write().await;
        let token = w
            .tokens
            .get_mut(&(run_id, token_id))
            .ok_or_else(|| anyhow!("token not found: {token_id}"))?;
        token.retry_count += 1;
        token.updated_at = now;
        Ok(token.retry_count)
    }

    // ── Fan-ins ──

    async fn create_fan_in_if_absent(&self, fan_in: &FanIn) -> Result<bool> {
        let mut w = self.inner.write().await;
        let key = (fan_in.run_id, fan_in.fan_in_path.clone());
        if w.fan_ins.contains_key(&key) {
            return Ok(false);
        }
        w.fan_ins.insert(key, fan_in.clone());
        Ok(true)
    }

    async fn load_fan_in(&self, run_id: Uuid, fan_in_path: &str) -> Result<Option<FanIn>> {
        let r = self.inner.read().await;
        Ok(r.fan_ins.get(&(run_id, fan_in_path.to_string())).cloned())
    }

    async fn waiting_fan_ins(&self, run_id: Uuid) -> Result<Vec<FanIn>> {
        let r = self.inner.read().await;
        let mut waiting: Vec<FanIn> = r
            .fan_ins
            .iter()
            .filter(|((rid, _), f)| *rid == run_id && f.status == FanInStatus::Waiting)
            .map(|(_, f)| f.clone())
            .collect();
        waiting.sort_by(|a, b| a.first_arrival_at.cmp(&b.first_arrival_at));
        Ok(waiting)
    }

    async fn finish_fan_in(
        &self,
        run_id: Uuid,
        fan_in_path: &str,
        status: FanInStatus,
        activated_by: Option<Uuid>,
        now: Timestamp,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let fan_in = w
            .fan_ins
            .get_mut(&(run_id, fan_in_path.to_string()))
            .ok_or_else(|| anyhow!("fan-in not found: {fan_in_path}"))?;
        if fan_in.status != FanInStatus::Waiting {
            return Ok(false);
        }
        fan_in.status = status;
        fan_in.activated_at = Some(now);
        fan_in.activated_by_token_id = activated_by;
        Ok(true)
    }

    // ── Subworkflows ──

    async fn insert_subworkflow(&self, sub: &Subworkflow) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subworkflows.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn load_subworkflow_by_child(
        &self,
        subworkflow_run_id: Uuid,
    ) -> Result<Option<Subworkflow>> {
        let r = self.inner.read().await;
        Ok(r.subworkflows
            .values()
            .find(|s| s.subworkflow_run_id == subworkflow_run_id)
            .cloned())
    }

    async fn active_subworkflows(&self, run_id: Uuid) -> Result<Vec<Subworkflow>> {
        let r = self.inner.read().await;
        Ok(r.subworkflows
            .values()
            .filter(|s| s.run_id == run_id && s.status.is_active())
            .cloned()
            .collect())
    }

    async fn update_subworkflow_status(
        &self,
        id: Uuid,
        status: SubworkflowStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let sub = w
            .subworkflows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("subworkflow not found: {id}"))?;
        if !sub.status.is_active() {
            return Ok(false);
        }
        sub.status = status;
        sub.updated_at = now;
        Ok(true)
    }

    // ── Context ──

    async fn init_context(&self, run_id: Uuid, def: &WorkflowDef, input: &Value) -> Result<()> {
        let input_validator = compile(def.input_schema.as_ref())?;
        check(input_validator.as_ref(), input, "input")?;
        let context = RunContext {
            input: input.clone(),
            state: Value::Object(Map::new()),
            output: Value::Object(Map::new()),
            state_validator: compile(def.state_schema.as_ref())?,
            output_validator: compile(def.output_schema.as_ref())?,
        };
        let mut w = self.inner.write().await;
        w.contexts.insert(run_id, context);
        Ok(())
    }

    async fn read_context(&self, run_id: Uuid) -> Result<ContextSnapshot> {
        let r = self.inner.read().await;
        let ctx = r
            .contexts
            .get(&run_id)
            .ok_or_else(|| anyhow!("context not initialized for run {run_id}"))?;
        Ok(ContextSnapshot {
            input: ctx.input.clone(),
            state: ctx.state.clone(),
            output: ctx.output.clone(),
        })
    }

    async fn set_context_value(&self, run_id: Uuid, target: &str, value: &Value) -> Result<()> {
        let (section, inner_path) = path::parse_target(target)?;
        let mut w = self.inner.write().await;
        let ctx = w
            .contexts
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("context not initialized for run {run_id}"))?;
        match section {
            path::Section::State => {
                let mut next = ctx.state.clone();
                path::set_in(&mut next, inner_path, value.clone());
                check(ctx.state_validator.as_ref(), &next, "state")?;
                ctx.state = next;
            }
            path::Section::Output => {
                let mut next = ctx.output.clone();
                path::set_in(&mut next, inner_path, value.clone());
                check(ctx.output_validator.as_ref(), &next, "output")?;
                ctx.output = next;
            }
        }
        Ok(())
    }

    async fn merge_output(&self, run_id: Uuid, value: &Value) -> Result<()> {
        let mut w = self.inner.write().await;
        let ctx = w
            .contexts
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("context not initialized for run {run_id}"))?;
        let mut next = ctx.output.clone();
        path::merge_shallow(&mut next, value);
        check(ctx.output_validator.as_ref(), &next, "output")?;
        ctx.output = next;
        Ok(())
    }

    // ── Branch tables ──

    async fn init_branch_table(&self, run_id: Uuid, token_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.branch_rows
            .insert((run_id, token_id), Value::Object(Map::new()));
        Ok(())
    }

    async fn write_branch_output(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        output: &Value,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let row = w
            .branch_rows
            .entry((run_id, token_id))
            .or_insert_with(|| Value::Object(Map::new()));
        path::set_in(row, "_branch.output", output.clone());
        Ok(())
    }

    async fn read_branch_rows(
        &self,
        run_id: Uuid,
        token_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, Value)>> {
        let r = self.inner.read().await;
        Ok(token_ids
            .iter()
            .filter_map(|id| {
                r.branch_rows
                    .get(&(run_id, *id))
                    .map(|row| (*id, row.clone()))
            })
            .collect())
    }

    async fn drop_branch_tables(&self, run_id: Uuid, token_ids: &[Uuid]) -> Result<()> {
        let mut w = self.inner.write().await;
        for id in token_ids {
            w.branch_rows.remove(&(run_id, *id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn make_token(run_id: Uuid, status: TokenStatus) -> Token {
        Token {
            id: Uuid::now_v7(),
            run_id,
            node_id: "n".to_string(),
            status,
            parent_token_id: None,
            path_id: "root".to_string(),
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: BTreeMap::new(),
            retry_count: 0,
            created_at: 0,
            updated_at: 0,
            arrived_at: None,
        }
    }

    fn make_fan_in(run_id: Uuid, path: &str) -> FanIn {
        FanIn {
            id: Uuid::now_v7(),
            run_id,
            node_id: "m".to_string(),
            fan_in_path: path.to_string(),
            status: FanInStatus::Waiting,
            transition_id: "t".to_string(),
            first_arrival_at: 100,
            activated_at: None,
            activated_by_token_id: None,
        }
    }

    #[tokio::test]
    async fn token_round_trip_and_group_query() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let mut a = make_token(run_id, TokenStatus::Pending);
        a.sibling_group = Some("judges".to_string());
        let b = make_token(run_id, TokenStatus::Pending);
        store.insert_tokens(&[a.clone(), b.clone()]).await.unwrap();

        let loaded = store.load_token(run_id, a.id).await.unwrap().unwrap();
        assert_eq!(loaded.sibling_group.as_deref(), Some("judges"));
        assert_eq!(store.load_tokens(run_id).await.unwrap().len(), 2);
        assert_eq!(
            store.tokens_in_group(run_id, "judges").await.unwrap().len(),
            1
        );
        assert_eq!(store.active_token_count(run_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn terminal_token_rejects_further_updates() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let token = make_token(run_id, TokenStatus::Executing);
        store.insert_tokens(&[token.clone()]).await.unwrap();

        assert!(store
            .update_token_status(run_id, token.id, TokenStatus::Completed, 10)
            .await
            .unwrap());
        // Duplicate result delivery observed as a no-op.
        assert!(!store
            .update_token_status(run_id, token.id, TokenStatus::Failed, 20)
            .await
            .unwrap());
        let loaded = store.load_token(run_id, token.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TokenStatus::Completed);
    }

    #[tokio::test]
    async fn mark_waiting_sets_arrival_once() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let token = make_token(run_id, TokenStatus::Executing);
        store.insert_tokens(&[token.clone()]).await.unwrap();

        assert!(store.mark_waiting(run_id, token.id, 50).await.unwrap());
        assert!(store.mark_waiting(run_id, token.id, 99).await.unwrap());
        let loaded = store.load_token(run_id, token.id).await.unwrap().unwrap();
        assert_eq!(loaded.arrived_at, Some(50));
    }

    #[tokio::test]
    async fn fan_in_create_is_insert_if_absent() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let fan_in = make_fan_in(run_id, "root.j:t");
        assert!(store.create_fan_in_if_absent(&fan_in).await.unwrap());
        assert!(!store.create_fan_in_if_absent(&fan_in).await.unwrap());
    }

    #[tokio::test]
    async fn fan_in_activation_has_exactly_one_winner() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let fan_in = make_fan_in(run_id, "root.j:t");
        store.create_fan_in_if_absent(&fan_in).await.unwrap();

        let winner = Uuid::now_v7();
        let loser = Uuid::now_v7();
        assert!(store
            .finish_fan_in(run_id, "root.j:t", FanInStatus::Activated, Some(winner), 10)
            .await
            .unwrap());
        assert!(!store
            .finish_fan_in(run_id, "root.j:t", FanInStatus::Activated, Some(loser), 11)
            .await
            .unwrap());

        let loaded = store.load_fan_in(run_id, "root.j:t").await.unwrap().unwrap();
        assert_eq!(loaded.activated_by_token_id, Some(winner));
        assert!(store.waiting_fan_ins(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_status_first_terminal_wins() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        store.init_run(run_id, "wf", 0).await.unwrap();

        assert!(store
            .update_status(run_id, RunStatus::Completed, 10)
            .await
            .unwrap());
        assert!(!store
            .update_status(run_id, RunStatus::Failed, 20)
            .await
            .unwrap());
        assert_eq!(
            store.load_status(run_id).await.unwrap(),
            Some(RunStatus::Completed)
        );
    }

    #[tokio::test]
    async fn context_validation_rejects_bad_input() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let def: WorkflowDef = serde_json::from_value(json!({
            "id": "wf",
            "initial_node_id": "a",
            "nodes": [{"id": "a", "kind": "task", "task_ref": "t"}],
            "transitions": [],
            "input_schema": {
                "type": "object",
                "required": ["customer_id"],
                "properties": {"customer_id": {"type": "string"}}
            }
        }))
        .unwrap();

        let err = store.init_context(run_id, &def, &json!({})).await;
        assert!(err.is_err());
        store
            .init_context(run_id, &def, &json!({"customer_id": "c-1"}))
            .await
            .unwrap();
        let ctx = store.read_context(run_id).await.unwrap();
        assert_eq!(ctx.input["customer_id"], "c-1");
    }

    #[tokio::test]
    async fn context_writes_and_output_merge() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let def: WorkflowDef = serde_json::from_value(json!({
            "id": "wf",
            "initial_node_id": "a",
            "nodes": [{"id": "a", "kind": "task", "task_ref": "t"}],
            "transitions": []
        }))
        .unwrap();
        store.init_context(run_id, &def, &json!({})).await.unwrap();

        store
            .set_context_value(run_id, "state.votes", &json!(["A", "B"]))
            .await
            .unwrap();
        store
            .merge_output(run_id, &json!({"verdict": "A"}))
            .await
            .unwrap();

        let ctx = store.read_context(run_id).await.unwrap();
        assert_eq!(ctx.state["votes"], json!(["A", "B"]));
        assert_eq!(ctx.output["verdict"], "A");

        // Input is read-only.
        assert!(store
            .set_context_value(run_id, "input.x", &json!(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn branch_table_lifecycle() {
        let store = MemoryRunStore::new();
        let run_id = Uuid::now_v7();
        let t0 = Uuid::now_v7();
        let t1 = Uuid::now_v7();

        store.init_branch_table(run_id, t0).await.unwrap();
        store.init_branch_table(run_id, t1).await.unwrap();
        store
            .write_branch_output(run_id, t0, &json!({"vote": "A"}))
            .await
            .unwrap();

        let rows = store.read_branch_rows(run_id, &[t0, t1]).await.unwrap();
        assert_eq!(rows.len(), 2);
        let (_, row0) = rows.iter().find(|(id, _)| *id == t0).unwrap();
        assert_eq!(row0["_branch"]["output"]["vote"], "A");

        store.drop_branch_tables(run_id, &[t0, t1]).await.unwrap();
        assert!(store
            .read_branch_rows(run_id, &[t0, t1])
            .await
            .unwrap()
            .is_empty());
    }
}
