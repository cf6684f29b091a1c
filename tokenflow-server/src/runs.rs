use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use tokenflow_core::coordinator::{now_ms, Ports, RunCoordinator, RunInspection};
use tokenflow_core::definition::{DefinitionCache, RunDefinition};
use tokenflow_core::events::TraceEvent;
use tokenflow_core::outbound::{
    MemoryAlarms, MemoryTraceSink, QueueExecutor, RecordingSubworkflows, StaticCatalog,
};
use tokenflow_core::store::RunStore;
use tokenflow_core::types::{SubworkflowOutcome, TaskDispatch, TaskError, TaskOutcome};

/// Process-level run registry: owns the shared store handle and the
/// in-process ports, creates one `RunCoordinator` per run and routes
/// callbacks to it. gRPC handlers delegate here.
pub struct RunManager {
    store: Arc<dyn RunStore>,
    catalog: Arc<StaticCatalog>,
    definitions: DefinitionCache,
    executor: Arc<QueueExecutor>,
    subworkflows: Arc<RecordingSubworkflows>,
    trace: Arc<MemoryTraceSink>,
    alarms: Arc<MemoryAlarms>,
    runs: RwLock<HashMap<Uuid, Arc<RunCoordinator>>>,
}

impl RunManager {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        let catalog = Arc::new(StaticCatalog::new());
        Self {
            store,
            catalog: catalog.clone(),
            definitions: DefinitionCache::new(catalog),
            executor: Arc::new(QueueExecutor::new()),
            subworkflows: Arc::new(RecordingSubworkflows::new()),
            trace: Arc::new(MemoryTraceSink::new()),
            alarms: Arc::new(MemoryAlarms::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a definition document and make it startable. Returns the
    /// workflow id plus reachability warnings.
    pub async fn register_workflow(&self, definition_json: &str) -> Result<(String, Vec<String>)> {
        let def: tokenflow_core::types::WorkflowDef = serde_json::from_str(definition_json)
            .map_err(|e| anyhow!("definition is not valid JSON: {e}"))?;
        let loaded = RunDefinition::load(def.clone())?;
        let warnings = loaded
            .unreachable_nodes()
            .into_iter()
            .map(|node| format!("node '{node}' is unreachable from the initial node"))
            .collect();
        let workflow_id = def.id.clone();
        self.catalog.register(def).await;
        Ok((workflow_id, warnings))
    }

    pub async fn start_run(
        &self,
        workflow_id: &str,
        version: Option<&str>,
        input: Value,
    ) -> Result<Uuid> {
        let def = self.definitions.get(workflow_id, version).await?;
        let run_id = Uuid::now_v7();
        let coordinator = Arc::new(RunCoordinator::new(
            run_id,
            def,
            self.store.clone(),
            Ports {
                executor: self.executor.clone(),
                subworkflows: self.subworkflows.clone(),
                trace: self.trace.clone(),
                alarms: self.alarms.clone(),
            },
        ));
        self.runs.write().await.insert(run_id, coordinator.clone());
        if let Err(error) = coordinator.start(input).await {
            self.runs.write().await.remove(&run_id);
            return Err(error);
        }
        Ok(run_id)
    }

    pub async fn run(&self, run_id: Uuid) -> Result<Arc<RunCoordinator>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| anyhow!("run not found: {run_id}"))
    }

    /// Worker pull: hand out dispatched tasks and move their tokens
    /// `dispatched → executing`.
    pub async fn activate_tasks(
        &self,
        task_refs: &[String],
        max: usize,
    ) -> Result<Vec<TaskDispatch>> {
        let batch = self.executor.activate(task_refs, max).await;
        for task in &batch {
            if let Ok(run) = self.run(task.run_id).await {
                run.mark_task_executing(task.correlation).await?;
            }
        }
        Ok(batch)
    }

    pub async fn complete_task(&self, run_id: Uuid, token_id: Uuid, output: Value) -> Result<()> {
        self.run(run_id)
            .await?
            .on_task_result(token_id, TaskOutcome::Success { output_data: output })
            .await
    }

    pub async fn fail_task(&self, run_id: Uuid, token_id: Uuid, error: TaskError) -> Result<()> {
        self.run(run_id)
            .await?
            .on_task_result(token_id, TaskOutcome::Failure { error })
            .await
    }

    pub async fn subworkflow_result(
        &self,
        run_id: Uuid,
        subworkflow_run_id: Uuid,
        outcome: SubworkflowOutcome,
    ) -> Result<()> {
        self.run(run_id)
            .await?
            .on_subworkflow_result(subworkflow_run_id, outcome)
            .await
    }

    pub async fn cancel(&self, run_id: Uuid, reason: Option<&str>) -> Result<()> {
        self.run(run_id).await?.cancel(reason).await
    }

    pub async fn inspect(&self, run_id: Uuid) -> Result<RunInspection> {
        self.run(run_id).await?.inspect().await
    }

    pub async fn trace_events(&self, run_id: Uuid) -> Vec<TraceEvent> {
        self.trace.events(run_id).await
    }

    /// Ticker body: fire `on_timeout_alarm` for every run whose earliest
    /// deadline has passed.
    pub async fn fire_due_alarms(&self) -> Result<()> {
        for run_id in self.alarms.due(now_ms()).await {
            match self.run(run_id).await {
                Ok(run) => run.on_timeout_alarm().await?,
                Err(_) => tracing::warn!(%run_id, "alarm fired for unknown run"),
            }
        }
        Ok(())
    }
}
