use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use tokenflow_core::types::{SubworkflowOutcome, TaskError};

use crate::runs::RunManager;

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("tokenflow.v1");
}

use proto::tokenflow_server::Tokenflow;
use proto::*;

pub struct TokenflowService {
    pub runs: Arc<RunManager>,
}

// --- Proto ↔ Core conversions ---

#[allow(clippy::result_large_err)]
fn parse_uuid(field: &str, s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s)
        .map_err(|e| Status::invalid_argument(format!("invalid {field} UUID: {e}")))
}

#[allow(clippy::result_large_err)]
fn parse_json(field: &str, s: &str) -> Result<serde_json::Value, Status> {
    if s.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(s)
        .map_err(|e| Status::invalid_argument(format!("invalid {field} JSON: {e}")))
}

fn manager_err(e: anyhow::Error) -> Status {
    Status::internal(format!("{e:#}"))
}

fn empty_as_none(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[tonic::async_trait]
impl Tokenflow for TokenflowService {
    async fn register_workflow(
        &self,
        request: Request<RegisterWorkflowRequest>,
    ) -> Result<Response<RegisterWorkflowResponse>, Status> {
        let req = request.into_inner();
        let (workflow_id, warnings) = self
            .runs
            .register_workflow(&req.definition_json)
            .await
            .map_err(|e| Status::invalid_argument(format!("registration failed: {e:#}")))?;
        Ok(Response::new(RegisterWorkflowResponse {
            workflow_id,
            warnings,
        }))
    }

    async fn start_run(
        &self,
        request: Request<StartRunRequest>,
    ) -> Result<Response<StartRunResponse>, Status> {
        let req = request.into_inner();
        let input = parse_json("input_json", &req.input_json)?;
        let run_id = self
            .runs
            .start_run(&req.workflow_id, empty_as_none(&req.version), input)
            .await
            .map_err(|e| Status::invalid_argument(format!("start failed: {e:#}")))?;
        Ok(Response::new(StartRunResponse {
            run_id: run_id.to_string(),
        }))
    }

    async fn complete_task(
        &self,
        request: Request<CompleteTaskRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        let token_id = parse_uuid("token_id", &req.token_id)?;
        let output = parse_json("output_json", &req.output_json)?;
        self.runs
            .complete_task(run_id, token_id, output)
            .await
            .map_err(manager_err)?;
        Ok(Response::new(Ack { accepted: true }))
    }

    async fn fail_task(
        &self,
        request: Request<FailTaskRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        let token_id = parse_uuid("token_id", &req.token_id)?;
        self.runs
            .fail_task(
                run_id,
                token_id,
                TaskError {
                    error_type: req.error_type,
                    step_ref: empty_as_none(&req.step_ref).map(str::to_string),
                    message: req.message,
                    retryable: req.retryable,
                },
            )
            .await
            .map_err(manager_err)?;
        Ok(Response::new(Ack { accepted: true }))
    }

    async fn subworkflow_result(
        &self,
        request: Request<SubworkflowResultRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        let subworkflow_run_id = parse_uuid("subworkflow_run_id", &req.subworkflow_run_id)?;
        let outcome = match req.status.as_str() {
            "completed" => SubworkflowOutcome::Completed {
                output: parse_json("output_json", &req.output_json)?,
            },
            "failed" => SubworkflowOutcome::Failed {
                message: req.message,
            },
            "cancelled" => SubworkflowOutcome::Cancelled,
            other => {
                return Err(Status::invalid_argument(format!(
                    "unknown subworkflow status '{other}'"
                )));
            }
        };
        self.runs
            .subworkflow_result(run_id, subworkflow_run_id, outcome)
            .await
            .map_err(manager_err)?;
        Ok(Response::new(Ack { accepted: true }))
    }

    async fn cancel_run(
        &self,
        request: Request<CancelRunRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        self.runs
            .cancel(run_id, empty_as_none(&req.reason))
            .await
            .map_err(manager_err)?;
        Ok(Response::new(Ack { accepted: true }))
    }

    type ActivateTasksStream = ReceiverStream<Result<TaskActivation, Status>>;

    async fn activate_tasks(
        &self,
        request: Request<ActivateTasksRequest>,
    ) -> Result<Response<Self::ActivateTasksStream>, Status> {
        let req = request.into_inner();
        let max = if req.max_tasks == 0 {
            16
        } else {
            req.max_tasks as usize
        };
        let batch = self
            .runs
            .activate_tasks(&req.task_refs, max)
            .await
            .map_err(manager_err)?;

        let (tx, rx) = tokio::sync::mpsc::channel(batch.len().max(1));
        tokio::spawn(async move {
            for task in batch {
                let activation = TaskActivation {
                    run_id: task.run_id.to_string(),
                    token_id: task.correlation.to_string(),
                    task_ref: task.task_ref,
                    input_json: task.input.to_string(),
                    timeout_ms: task.timeout_ms.unwrap_or(0),
                };
                if tx.send(Ok(activation)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn inspect_run(
        &self,
        request: Request<InspectRunRequest>,
    ) -> Result<Response<InspectRunResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        let inspection = self.runs.inspect(run_id).await.map_err(manager_err)?;
        Ok(Response::new(InspectRunResponse {
            status: inspection
                .status
                .map(|s| s.as_str().to_uppercase())
                .unwrap_or_default(),
            tokens: inspection
                .tokens
                .iter()
                .map(|t| TokenSnapshot {
                    id: t.id.to_string(),
                    node_id: t.node_id.clone(),
                    status: t.status.as_str().to_string(),
                    path_id: t.path_id.clone(),
                    sibling_group: t.sibling_group.clone().unwrap_or_default(),
                    branch_index: t.branch_index,
                    branch_total: t.branch_total,
                    retry_count: t.retry_count,
                })
                .collect(),
            waiting_fan_ins: inspection
                .waiting_fan_ins
                .iter()
                .map(|f| FanInSnapshot {
                    fan_in_path: f.fan_in_path.clone(),
                    status: f.status.as_str().to_string(),
                    node_id: f.node_id.clone(),
                })
                .collect(),
        }))
    }

    type ReadTraceStream = ReceiverStream<Result<TraceEventMessage, Status>>;

    async fn read_trace(
        &self,
        request: Request<ReadTraceRequest>,
    ) -> Result<Response<Self::ReadTraceStream>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid("run_id", &req.run_id)?;
        let events = self.runs.trace_events(run_id).await;

        let (tx, rx) = tokio::sync::mpsc::channel(events.len().max(1));
        tokio::spawn(async move {
            for event in events {
                let wire = event.to_wire();
                let message = TraceEventMessage {
                    r#type: event.event_type().to_string(),
                    payload_json: wire["payload"].to_string(),
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
