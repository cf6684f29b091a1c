use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::TraceEvent;
use crate::types::{TaskDispatch, Timestamp, WorkflowDef};

// ─── Executor ─────────────────────────────────────────────────

/// Outbound task dispatch. Results come back through the run actor's
/// `on_task_result`, correlated by token id.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn dispatch(&self, task: &TaskDispatch) -> Result<()>;
}

/// Queue-backed executor: dispatches land in a FIFO that workers drain
/// with a task_ref filter. The default for tests and the POC server.
pub struct QueueExecutor {
    queue: RwLock<VecDeque<TaskDispatch>>,
}

impl QueueExecutor {
    pub fn new() -> Self {
        Self {
            queue: RwLock::new(VecDeque::new()),
        }
    }

    /// Dequeue up to `max` pending tasks matching `task_refs` (empty filter
    /// matches everything).
    pub async fn activate(&self, task_refs: &[String], max: usize) -> Vec<TaskDispatch> {
        let mut queue = self.queue.write().await;
        let mut taken = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(task) = queue.pop_front() {
            if taken.len() < max && (task_refs.is_empty() || task_refs.contains(&task.task_ref)) {
                taken.push(task);
            } else {
                remaining.push_back(task);
            }
        }
        *queue = remaining;
        taken
    }

    pub async fn pending(&self) -> usize {
        self.queue.read().await.len()
    }
}

impl Default for QueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for QueueExecutor {
    async fn dispatch(&self, task: &TaskDispatch) -> Result<()> {
        self.queue.write().await.push_back(task.clone());
        Ok(())
    }
}

// ─── Subworkflows ─────────────────────────────────────────────

/// Spawning and cancelling child runs.
#[async_trait]
pub trait SubworkflowClient: Send + Sync {
    /// Start a child run; returns its run id.
    async fn spawn(
        &self,
        parent_run_id: Uuid,
        parent_token_id: Uuid,
        workflow_ref: &str,
        input: &Value,
    ) -> Result<Uuid>;

    async fn cancel(&self, subworkflow_run_id: Uuid, reason: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SpawnedChild {
    pub subworkflow_run_id: Uuid,
    pub workflow_ref: String,
    pub input: Value,
    pub cancelled: bool,
}

/// Recording stub: children are registered, never executed. Tests feed the
/// child outcome back through `on_subworkflow_result`.
pub struct RecordingSubworkflows {
    children: RwLock<Vec<SpawnedChild>>,
}

impl RecordingSubworkflows {
    pub fn new() -> Self {
        Self {
            children: RwLock::new(Vec::new()),
        }
    }

    pub async fn children(&self) -> Vec<SpawnedChild> {
        self.children.read().await.clone()
    }
}

impl Default for RecordingSubworkflows {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubworkflowClient for RecordingSubworkflows {
    async fn spawn(
        &self,
        _parent_run_id: Uuid,
        _parent_token_id: Uuid,
        workflow_ref: &str,
        input: &Value,
    ) -> Result<Uuid> {
        let subworkflow_run_id = Uuid::now_v7();
        self.children.write().await.push(SpawnedChild {
            subworkflow_run_id,
            workflow_ref: workflow_ref.to_string(),
            input: input.clone(),
            cancelled: false,
        });
        Ok(subworkflow_run_id)
    }

    async fn cancel(&self, subworkflow_run_id: Uuid, _reason: &str) -> Result<()> {
        let mut children = self.children.write().await;
        for child in children.iter_mut() {
            if child.subworkflow_run_id == subworkflow_run_id {
                child.cancelled = true;
            }
        }
        Ok(())
    }
}

// ─── Trace sink ───────────────────────────────────────────────

/// Fire-and-forget trace emission. Implementations log their own failures;
/// emission never aborts planning or dispatch.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn emit(&self, run_id: Uuid, event: &TraceEvent);
}

/// Retains the most recent events per run for read-back.
pub struct MemoryTraceSink {
    retained: RwLock<HashMap<Uuid, Vec<TraceEvent>>>,
    cap_per_run: usize,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self {
            retained: RwLock::new(HashMap::new()),
            cap_per_run: 4096,
        }
    }

    pub async fn events(&self, run_id: Uuid) -> Vec<TraceEvent> {
        self.retained
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryTraceSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn emit(&self, run_id: Uuid, event: &TraceEvent) {
        let mut retained = self.retained.write().await;
        let events = retained.entry(run_id).or_default();
        if events.len() < self.cap_per_run {
            events.push(event.clone());
        }
    }
}

/// Emits events as structured log lines only.
pub struct TracingTraceSink;

#[async_trait]
impl TraceSink for TracingTraceSink {
    async fn emit(&self, run_id: Uuid, event: &TraceEvent) {
        tracing::debug!(%run_id, event_type = event.event_type(), "trace event");
    }
}

// ─── Alarms ───────────────────────────────────────────────────

/// Host alarm scheduling. One alarm per run: scheduling keeps the earliest
/// requested deadline.
#[async_trait]
pub trait AlarmScheduler: Send + Sync {
    async fn schedule(&self, run_id: Uuid, at: Timestamp) -> Result<()>;
}

/// Tracks the earliest pending deadline per run; a driver loop (or a test)
/// asks which runs are due and fires their `on_timeout_alarm`.
pub struct MemoryAlarms {
    deadlines: RwLock<HashMap<Uuid, Timestamp>>,
}

impl MemoryAlarms {
    pub fn new() -> Self {
        Self {
            deadlines: RwLock::new(HashMap::new()),
        }
    }

    pub async fn next_deadline(&self, run_id: Uuid) -> Option<Timestamp> {
        self.deadlines.read().await.get(&run_id).copied()
    }

    /// Runs whose deadline has passed; firing consumes the alarm, the run
    /// re-arms if it still needs one.
    pub async fn due(&self, now: Timestamp) -> Vec<Uuid> {
        let mut deadlines = self.deadlines.write().await;
        let due: Vec<Uuid> = deadlines
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(run_id, _)| *run_id)
            .collect();
        for run_id in &due {
            deadlines.remove(run_id);
        }
        due
    }
}

impl Default for MemoryAlarms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmScheduler for MemoryAlarms {
    async fn schedule(&self, run_id: Uuid, at: Timestamp) -> Result<()> {
        let mut deadlines = self.deadlines.write().await;
        deadlines
            .entry(run_id)
            .and_modify(|current| *current = (*current).min(at))
            .or_insert(at);
        Ok(())
    }
}

// ─── Resource catalog ─────────────────────────────────────────

/// Workflow definition lookup, hit once per run on cold start.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn get_workflow_def(&self, id: &str, version: Option<&str>) -> Result<WorkflowDef>;
}

/// Fixed in-process catalog.
pub struct StaticCatalog {
    defs: RwLock<HashMap<String, WorkflowDef>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, def: WorkflowDef) {
        self.defs.write().await.insert(def.id.clone(), def);
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceCatalog for StaticCatalog {
    async fn get_workflow_def(&self, id: &str, _version: Option<&str>) -> Result<WorkflowDef> {
        self.defs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("workflow definition not found: {id}"))
    }
}
