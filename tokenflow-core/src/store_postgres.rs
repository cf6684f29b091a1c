use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::path;
use crate::store::RunStore;
use crate::types::{
    ContextSnapshot, FanIn, FanInStatus, RunStatus, Subworkflow, SubworkflowStatus, Timestamp,
    Token, TokenStatus, WorkflowDef,
};

/// Convert an epoch-ms i64 to a `chrono::DateTime<chrono::Utc>` for
/// TIMESTAMPTZ binding.
fn epoch_ms_to_datetime(epoch_ms: Timestamp) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    chrono::Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}

fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> Timestamp {
    dt.timestamp_millis()
}

fn parse_token_status(s: &str) -> Result<TokenStatus> {
    Ok(match s {
        "pending" => TokenStatus::Pending,
        "dispatched" => TokenStatus::Dispatched,
        "executing" => TokenStatus::Executing,
        "waiting_for_siblings" => TokenStatus::WaitingForSiblings,
        "waiting_for_subworkflow" => TokenStatus::WaitingForSubworkflow,
        "completed" => TokenStatus::Completed,
        "failed" => TokenStatus::Failed,
        "timed_out" => TokenStatus::TimedOut,
        "cancelled" => TokenStatus::Cancelled,
        other => return Err(anyhow!("unknown token status '{other}'")),
    })
}

fn parse_run_status(s: &str) -> Result<RunStatus> {
    Ok(match s {
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "timed_out" => RunStatus::TimedOut,
        "cancelled" => RunStatus::Cancelled,
        other => return Err(anyhow!("unknown run status '{other}'")),
    })
}

fn parse_fan_in_status(s: &str) -> Result<FanInStatus> {
    Ok(match s {
        "waiting" => FanInStatus::Waiting,
        "activated" => FanInStatus::Activated,
        "timed_out" => FanInStatus::TimedOut,
        other => return Err(anyhow!("unknown fan-in status '{other}'")),
    })
}

fn parse_subworkflow_status(s: &str) -> Result<SubworkflowStatus> {
    Ok(match s {
        "running" => SubworkflowStatus::Running,
        "completed" => SubworkflowStatus::Completed,
        "failed" => SubworkflowStatus::Failed,
        "cancelled" => SubworkflowStatus::Cancelled,
        other => return Err(anyhow!("unknown subworkflow status '{other}'")),
    })
}

const TERMINAL_TOKEN_STATUSES: &str = "('completed', 'failed', 'timed_out', 'cancelled')";

fn token_from_row(row: &sqlx::postgres::PgRow) -> Result<Token> {
    let status: String = row.get("status");
    let iteration_counts: Value = row.get("iteration_counts");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");
    let arrived_at: Option<chrono::DateTime<chrono::Utc>> = row.get("arrived_at");
    let branch_index: i32 = row.get("branch_index");
    let branch_total: i32 = row.get("branch_total");
    let retry_count: i32 = row.get("retry_count");
    Ok(Token {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        status: parse_token_status(&status)?,
        parent_token_id: row.get("parent_token_id"),
        path_id: row.get("path_id"),
        sibling_group: row.get("sibling_group"),
        branch_index: branch_index as u32,
        branch_total: branch_total as u32,
        iteration_counts: serde_json::from_value(iteration_counts)
            .context("failed to deserialize token iteration_counts")?,
        retry_count: retry_count as u32,
        created_at: datetime_to_epoch_ms(created_at),
        updated_at: datetime_to_epoch_ms(updated_at),
        arrived_at: arrived_at.map(datetime_to_epoch_ms),
    })
}

fn fan_in_from_row(row: &sqlx::postgres::PgRow) -> Result<FanIn> {
    let status: String = row.get("status");
    let first_arrival_at: chrono::DateTime<chrono::Utc> = row.get("first_arrival_at");
    let activated_at: Option<chrono::DateTime<chrono::Utc>> = row.get("activated_at");
    Ok(FanIn {
        id: row.get("id"),
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        fan_in_path: row.get("fan_in_path"),
        status: parse_fan_in_status(&status)?,
        transition_id: row.get("transition_id"),
        first_arrival_at: datetime_to_epoch_ms(first_arrival_at),
        activated_at: activated_at.map(datetime_to_epoch_ms),
        activated_by_token_id: row.get("activated_by_token_id"),
    })
}

fn subworkflow_from_row(row: &sqlx::postgres::PgRow) -> Result<Subworkflow> {
    let status: String = row.get("status");
    let timeout_ms: Option<i64> = row.get("timeout_ms");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
    let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");
    Ok(Subworkflow {
        id: row.get("id"),
        run_id: row.get("run_id"),
        parent_token_id: row.get("parent_token_id"),
        subworkflow_run_id: row.get("subworkflow_run_id"),
        status: parse_subworkflow_status(&status)?,
        timeout_ms: timeout_ms.map(|ms| ms as u64),
        created_at: datetime_to_epoch_ms(created_at),
        updated_at: datetime_to_epoch_ms(updated_at),
    })
}

// ── Schema-driven table naming ──

/// Context and branch tables are namespaced per run/token with the hex id
/// so concurrent runs never share a table. Hex ids keep identifiers safe
/// without quoting games.
fn context_table(section: &str, run_id: Uuid) -> String {
    format!("context_{section}_{}", run_id.simple())
}

fn branch_table(token_id: Uuid) -> String {
    format!("branch_output_{}", token_id.simple())
}

/// Columns come from the section schema's top-level `properties`. Names
/// must be plain identifiers; anything else is a definition problem.
fn schema_columns(schema: Option<&Value>) -> Result<Vec<String>> {
    let Some(Value::Object(schema)) = schema else {
        return Ok(Vec::new());
    };
    let Some(Value::Object(properties)) = schema.get("properties") else {
        return Ok(Vec::new());
    };
    let mut columns = Vec::with_capacity(properties.len());
    for name in properties.keys() {
        let ok = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !ok {
            return Err(CoordinatorError::Validation(format!(
                "schema property '{name}' is not usable as a column name"
            ))
            .into());
        }
        columns.push(name.clone());
    }
    Ok(columns)
}

/// PostgreSQL-backed implementation of `RunStore`.
///
/// Fan-in race safety rests on two primitives here: `INSERT .. ON CONFLICT
/// DO NOTHING` against the `(run_id, fan_in_path)` uniqueness, and
/// `UPDATE .. WHERE status = 'waiting'` for activation.
pub struct PostgresRunStore {
    pool: sqlx::PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations for the fixed tables.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run coordinator migrations")?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("present"))
    }

    async fn load_section_schema(&self, run_id: Uuid, section: &str) -> Result<Option<Value>> {
        let column = match section {
            "input" => "input_schema",
            "state" => "state_schema",
            "output" => "output_schema",
            other => return Err(anyhow!("unknown context section '{other}'")),
        };
        let row = sqlx::query(&format!(
            "SELECT {column} AS schema FROM context_schemas WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|row| {
            let schema: Option<Value> = row.get("schema");
            schema.filter(|s| !s.is_null())
        }))
    }

    async fn create_context_table(
        &self,
        run_id: Uuid,
        section: &str,
        schema: Option<&Value>,
    ) -> Result<()> {
        let table = context_table(section, run_id);
        let mut columns = String::new();
        for column in schema_columns(schema)? {
            columns.push_str(&format!("\"{column}\" JSONB, "));
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                only_row BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (only_row),
                {columns}
                _extra JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )"
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        sqlx::query(&format!(
            "INSERT INTO {table} (only_row) VALUES (TRUE) ON CONFLICT DO NOTHING"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reassemble a section record from its row: declared columns merged
    /// with the `_extra` spillover.
    async fn read_section(&self, run_id: Uuid, section: &str) -> Result<Value> {
        let table = context_table(section, run_id);
        if !self.table_exists(&table).await? {
            return Err(anyhow!("context not initialized for run {run_id}"));
        }
        let row = sqlx::query(&format!(
            "SELECT to_jsonb(t) - 'only_row' AS doc FROM {table} t"
        ))
        .fetch_one(&self.pool)
        .await?;
        let doc: Value = row.get("doc");
        let Value::Object(mut fields) = doc else {
            return Ok(Value::Object(Map::new()));
        };
        let extra = fields.remove("_extra").unwrap_or(Value::Object(Map::new()));
        let mut record = Map::new();
        for (key, value) in fields {
            if !value.is_null() {
                record.insert(key, value);
            }
        }
        if let Value::Object(extra) = extra {
            for (key, value) in extra {
                record.entry(key).or_insert(value);
            }
        }
        Ok(Value::Object(record))
    }

    /// Split a section record into declared columns and spillover, then
    /// write the whole single row back.
    async fn write_section(&self, run_id: Uuid, section: &str, record: &Value) -> Result<()> {
        let table = context_table(section, run_id);
        let schema = self.load_section_schema(run_id, section).await?;
        let columns = schema_columns(schema.as_ref())?;
        let Value::Object(fields) = record else {
            return Err(CoordinatorError::Validation(format!(
                "context {section} must be an object"
            ))
            .into());
        };

        let mut assignments = Vec::with_capacity(columns.len() + 1);
        let mut binds: Vec<Value> = Vec::with_capacity(columns.len() + 1);
        for (i, column) in columns.iter().enumerate() {
            assignments.push(format!("\"{column}\" = ${}", i + 1));
            binds.push(fields.get(column).cloned().unwrap_or(Value::Null));
        }
        let mut extra = Map::new();
        for (key, value) in fields {
            if !columns.contains(key) {
                extra.insert(key.clone(), value.clone());
            }
        }
        assignments.push(format!("_extra = ${}", columns.len() + 1));
        binds.push(Value::Object(extra));

        let sql = format!("UPDATE {table} SET {}", assignments.join(", "));
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn validate_section(&self, run_id: Uuid, section: &str, record: &Value) -> Result<()> {
        if let Some(schema) = self.load_section_schema(run_id, section).await? {
            let validator = jsonschema::validator_for(&schema)
                .map_err(|e| anyhow!("invalid stored {section} schema: {e}"))?;
            if let Err(error) = validator.validate(record) {
                return Err(CoordinatorError::Validation(format!(
                    "{section} does not match its schema: {error}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    // ── Run status ──

    async fn init_run(&self, run_id: Uuid, workflow_id: &str, now: Timestamp) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_status (run_id, workflow_id, status, updated_at)
            VALUES ($1, $2, 'running', $3)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(workflow_id)
        .bind(epoch_ms_to_datetime(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_status(&self, run_id: Uuid) -> Result<Option<RunStatus>> {
        let row = sqlx::query("SELECT status FROM workflow_status WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(parse_run_status(&status)?))
            }
        }
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_status SET status = $1, updated_at = $2
             WHERE run_id = $3 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(epoch_ms_to_datetime(now))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Tokens ──

    async fn insert_tokens(&self, tokens: &[Token]) -> Result<()> {
        for token in tokens {
            let iteration_counts = serde_json::to_value(&token.iteration_counts)?;
            sqlx::query(
                r#"
                INSERT INTO tokens (
                    id, run_id, node_id, status, parent_token_id, path_id,
                    sibling_group, branch_index, branch_total, iteration_counts,
                    retry_count, created_at, updated_at, arrived_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(token.id)
            .bind(token.run_id)
            .bind(&token.node_id)
            .bind(token.status.as_str())
            .bind(token.parent_token_id)
            .bind(&token.path_id)
            .bind(&token.sibling_group)
            .bind(token.branch_index as i32)
            .bind(token.branch_total as i32)
            .bind(&iteration_counts)
            .bind(token.retry_count as i32)
            .bind(epoch_ms_to_datetime(token.created_at))
            .bind(epoch_ms_to_datetime(token.updated_at))
            .bind(token.arrived_at.map(epoch_ms_to_datetime))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn load_token(&self, run_id: Uuid, token_id: Uuid) -> Result<Option<Token>> {
        let row = sqlx::query("SELECT * FROM tokens WHERE run_id = $1 AND id = $2")
            .bind(run_id)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn load_tokens(&self, run_id: Uuid) -> Result<Vec<Token>> {
        let rows =
            sqlx::query("SELECT * FROM tokens WHERE run_id = $1 ORDER BY created_at, id")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn tokens_by_status(&self, run_id: Uuid, status: TokenStatus) -> Result<Vec<Token>> {
        let rows = sqlx::query(
            "SELECT * FROM tokens WHERE run_id = $1 AND status = $2 ORDER BY created_at, id",
        )
        .bind(run_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn tokens_in_group(&self, run_id: Uuid, sibling_group: &str) -> Result<Vec<Token>> {
        let rows = sqlx::query(
            "SELECT * FROM tokens WHERE run_id = $1 AND sibling_group = $2 ORDER BY created_at, id",
        )
        .bind(run_id)
        .bind(sibling_group)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn active_token_count(&self, run_id: Uuid) -> Result<usize> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS active FROM tokens
             WHERE run_id = $1 AND status NOT IN {TERMINAL_TOKEN_STATUSES}"
        ))
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        let active: i64 = row.get("active");
        Ok(active as usize)
    }

    async fn update_token_status(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        status: TokenStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE tokens SET status = $1, updated_at = $2
             WHERE run_id = $3 AND id = $4 AND status NOT IN {TERMINAL_TOKEN_STATUSES}"
        ))
        .bind(status.as_str())
        .bind(epoch_ms_to_datetime(now))
        .bind(run_id)
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_waiting(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        arrived_at: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE tokens
             SET status = 'waiting_for_siblings',
                 arrived_at = COALESCE(arrived_at, $1),
                 updated_at = $1
             WHERE run_id = $2 AND id = $3 AND status NOT IN {TERMINAL_TOKEN_STATUSES}"
        ))
        .bind(epoch_ms_to_datetime(arrived_at))
        .bind(run_id)
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bump_retry(&self, run_id: Uuid, token_id: Uuid, now: Timestamp) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE tokens SET retry_count = retry_count + 1, updated_at = $1
             WHERE run_id = $2 AND id = $3
             RETURNING retry_count",
        )
        .bind(epoch_ms_to_datetime(now))
        .bind(run_id)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("token not found: {token_id}"))?;
        let retry_count: i32 = row.get("retry_count");
        Ok(retry_count as u32)
    }

    // ── Fan-ins ──

    async fn create_fan_in_if_absent(&self, fan_in: &FanIn) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fan_ins (
                id, run_id, node_id, fan_in_path, status, transition_id,
                first_arrival_at, activated_at, activated_by_token_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, fan_in_path) DO NOTHING
            "#,
        )
        .bind(fan_in.id)
        .bind(fan_in.run_id)
        .bind(&fan_in.node_id)
        .bind(&fan_in.fan_in_path)
        .bind(fan_in.status.as_str())
        .bind(&fan_in.transition_id)
        .bind(epoch_ms_to_datetime(fan_in.first_arrival_at))
        .bind(fan_in.activated_at.map(epoch_ms_to_datetime))
        .bind(fan_in.activated_by_token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_fan_in(&self, run_id: Uuid, fan_in_path: &str) -> Result<Option<FanIn>> {
        let row = sqlx::query("SELECT * FROM fan_ins WHERE run_id = $1 AND fan_in_path = $2")
            .bind(run_id)
            .bind(fan_in_path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fan_in_from_row).transpose()
    }

    async fn waiting_fan_ins(&self, run_id: Uuid) -> Result<Vec<FanIn>> {
        let rows = sqlx::query(
            "SELECT * FROM fan_ins WHERE run_id = $1 AND status = 'waiting'
             ORDER BY first_arrival_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fan_in_from_row).collect()
    }

    async fn finish_fan_in(
        &self,
        run_id: Uuid,
        fan_in_path: &str,
        status: FanInStatus,
        activated_by: Option<Uuid>,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE fan_ins
             SET status = $1, activated_at = $2, activated_by_token_id = $3
             WHERE run_id = $4 AND fan_in_path = $5 AND status = 'waiting'",
        )
        .bind(status.as_str())
        .bind(epoch_ms_to_datetime(now))
        .bind(activated_by)
        .bind(run_id)
        .bind(fan_in_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Subworkflows ──

    async fn insert_subworkflow(&self, sub: &Subworkflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subworkflows (
                id, run_id, parent_token_id, subworkflow_run_id, status,
                timeout_ms, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subworkflow_run_id) DO NOTHING
            "#,
        )
        .bind(sub.id)
        .bind(sub.run_id)
        .bind(sub.parent_token_id)
        .bind(sub.subworkflow_run_id)
        .bind(sub.status.as_str())
        .bind(sub.timeout_ms.map(|ms| ms as i64))
        .bind(epoch_ms_to_datetime(sub.created_at))
        .bind(epoch_ms_to_datetime(sub.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_subworkflow_by_child(
        &self,
        subworkflow_run_id: Uuid,
    ) -> Result<Option<Subworkflow>> {
        let row = sqlx::query("SELECT * FROM subworkflows WHERE subworkflow_run_id = $1")
            .bind(subworkflow_run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subworkflow_from_row).transpose()
    }

    async fn active_subworkflows(&self, run_id: Uuid) -> Result<Vec<Subworkflow>> {
        let rows =
            sqlx::query("SELECT * FROM subworkflows WHERE run_id = $1 AND status = 'running'")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(subworkflow_from_row).collect()
    }

    async fn update_subworkflow_status(
        &self,
        id: Uuid,
        status: SubworkflowStatus,
        now: Timestamp,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subworkflows SET status = $1, updated_at = $2
             WHERE id = $3 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(epoch_ms_to_datetime(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Context ──

    async fn init_context(&self, run_id: Uuid, def: &WorkflowDef, input: &Value) -> Result<()> {
        if let Some(schema) = &def.input_schema {
            if !schema.is_null() {
                let validator = jsonschema::validator_for(schema)
                    .map_err(|e| anyhow!("invalid input schema: {e}"))?;
                if let Err(error) = validator.validate(input) {
                    return Err(CoordinatorError::Validation(format!(
                        "input does not match its schema: {error}"
                    ))
                    .into());
                }
            }
        }
        sqlx::query(
            r#"
            INSERT INTO context_schemas (run_id, input_schema, state_schema, output_schema)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(&def.input_schema)
        .bind(&def.state_schema)
        .bind(&def.output_schema)
        .execute(&self.pool)
        .await?;

        self.create_context_table(run_id, "input", def.input_schema.as_ref())
            .await?;
        self.create_context_table(run_id, "state", def.state_schema.as_ref())
            .await?;
        self.create_context_table(run_id, "output", def.output_schema.as_ref())
            .await?;
        self.write_section(run_id, "input", input).await?;
        Ok(())
    }

    async fn read_context(&self, run_id: Uuid) -> Result<ContextSnapshot> {
        Ok(ContextSnapshot {
            input: self.read_section(run_id, "input").await?,
            state: self.read_section(run_id, "state").await?,
            output: self.read_section(run_id, "output").await?,
        })
    }

    async fn set_context_value(&self, run_id: Uuid, target: &str, value: &Value) -> Result<()> {
        let (section, inner_path) = path::parse_target(target)?;
        let section = section.as_str();
        let mut record = self.read_section(run_id, section).await?;
        path::set_in(&mut record, inner_path, value.clone());
        self.validate_section(run_id, section, &record).await?;
        self.write_section(run_id, section, &record).await
    }

    async fn merge_output(&self, run_id: Uuid, value: &Value) -> Result<()> {
        let mut record = self.read_section(run_id, "output").await?;
        path::merge_shallow(&mut record, value);
        self.validate_section(run_id, "output", &record).await?;
        self.write_section(run_id, "output", &record).await
    }

    // ── Branch tables ──

    async fn init_branch_table(&self, run_id: Uuid, token_id: Uuid) -> Result<()> {
        let table = branch_table(token_id);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                only_row BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (only_row),
                run_id UUID NOT NULL,
                doc JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {table} (only_row, run_id) VALUES (TRUE, $1) ON CONFLICT DO NOTHING"
        ))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_branch_output(
        &self,
        run_id: Uuid,
        token_id: Uuid,
        output: &Value,
    ) -> Result<()> {
        self.init_branch_table(run_id, token_id).await?;
        let table = branch_table(token_id);
        let row = sqlx::query(&format!("SELECT doc FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let mut record: Value = row.get("doc");
        path::set_in(&mut record, "_branch.output", output.clone());
        sqlx::query(&format!("UPDATE {table} SET doc = $1"))
            .bind(&record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_branch_rows(
        &self,
        run_id: Uuid,
        token_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, Value)>> {
        let mut rows = Vec::new();
        for token_id in token_ids {
            let table = branch_table(*token_id);
            if !self.table_exists(&table).await? {
                continue;
            }
            let row = sqlx::query(&format!("SELECT doc FROM {table} WHERE run_id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                rows.push((*token_id, row.get("doc")));
            }
        }
        Ok(rows)
    }

    async fn drop_branch_tables(&self, _run_id: Uuid, token_ids: &[Uuid]) -> Result<()> {
        for token_id in token_ids {
            let table = branch_table(*token_id);
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;
    use std::collections::BTreeMap;

    async fn setup() -> (PgPool, PostgresRunStore) {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///tokenflow".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");

        // Truncate the fixed tables. Context and branch tables are per-run
        // and never collide across tests (fresh run ids each time).
        sqlx::query("TRUNCATE workflow_status")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("TRUNCATE tokens")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("TRUNCATE fan_ins")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("TRUNCATE subworkflows")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("TRUNCATE context_schemas")
            .execute(&pool)
            .await
            .unwrap();

        let store = PostgresRunStore::new(pool.clone());
        (pool, store)
    }

    fn make_token(run_id: Uuid, status: TokenStatus) -> Token {
        Token {
            id: Uuid::now_v7(),
            run_id,
            node_id: "j".to_string(),
            status,
            parent_token_id: None,
            path_id: "root.a.0".to_string(),
            sibling_group: Some("judges".to_string()),
            branch_index: 0,
            branch_total: 3,
            iteration_counts: BTreeMap::from([("t_fan".to_string(), 1)]),
            retry_count: 0,
            created_at: 1700000000000,
            updated_at: 1700000000000,
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
            transition_id: "t_join".to_string(),
            first_arrival_at: 1700000000000,
            activated_at: None,
            activated_by_token_id: None,
        }
    }

    fn make_def() -> WorkflowDef {
        serde_json::from_value(serde_json::json!({
            "id": "wf",
            "initial_node_id": "a",
            "nodes": [{"id": "a", "kind": "task", "task_ref": "t"}],
            "transitions": [],
            "input_schema": {
                "type": "object",
                "required": ["customer_id"],
                "properties": {
                    "customer_id": {"type": "string"},
                    "region": {"type": "string"}
                }
            },
            "state_schema": {
                "type": "object",
                "properties": {"votes": {"type": "array"}}
            }
        }))
        .unwrap()
    }

    /// Token round-trip through TIMESTAMPTZ and JSONB columns, plus the
    /// terminal-status rejection the race model rests on.
    #[tokio::test]
    #[ignore]
    async fn test_pg_token_round_trip_and_terminal_rejection() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let token = make_token(run_id, TokenStatus::Executing);
        store.insert_tokens(&[token.clone()]).await.unwrap();

        let loaded = store.load_token(run_id, token.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TokenStatus::Executing);
        assert_eq!(loaded.path_id, "root.a.0");
        assert_eq!(loaded.sibling_group.as_deref(), Some("judges"));
        assert_eq!(loaded.branch_total, 3);
        assert_eq!(loaded.iteration_counts.get("t_fan"), Some(&1));
        assert_eq!(loaded.created_at, 1700000000000);

        // Idempotent insert (redelivery after a crash mid-batch).
        store.insert_tokens(&[token.clone()]).await.unwrap();

        assert!(store
            .update_token_status(run_id, token.id, TokenStatus::Completed, 1700000001000)
            .await
            .unwrap());
        assert!(!store
            .update_token_status(run_id, token.id, TokenStatus::Failed, 1700000002000)
            .await
            .unwrap());
        let loaded = store.load_token(run_id, token.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TokenStatus::Completed);
        assert_eq!(store.active_token_count(run_id).await.unwrap(), 0);
    }

    /// mark_waiting sets arrived_at once and never clears it.
    #[tokio::test]
    #[ignore]
    async fn test_pg_mark_waiting_preserves_first_arrival() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let token = make_token(run_id, TokenStatus::Executing);
        store.insert_tokens(&[token.clone()]).await.unwrap();

        assert!(store
            .mark_waiting(run_id, token.id, 1700000005000)
            .await
            .unwrap());
        assert!(store
            .mark_waiting(run_id, token.id, 1700000009000)
            .await
            .unwrap());
        let loaded = store.load_token(run_id, token.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TokenStatus::WaitingForSiblings);
        assert_eq!(loaded.arrived_at, Some(1700000005000));
    }

    /// Fan-in creation is insert-if-absent on (run_id, fan_in_path).
    #[tokio::test]
    #[ignore]
    async fn test_pg_fan_in_insert_if_absent() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let fan_in = make_fan_in(run_id, "root.a:t_join");

        assert!(store.create_fan_in_if_absent(&fan_in).await.unwrap());
        // Same path, different id: the conflict clause swallows it.
        let rival = FanIn {
            id: Uuid::now_v7(),
            ..make_fan_in(run_id, "root.a:t_join")
        };
        assert!(!store.create_fan_in_if_absent(&rival).await.unwrap());

        let loaded = store
            .load_fan_in(run_id, "root.a:t_join")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, fan_in.id);
        assert_eq!(loaded.status, FanInStatus::Waiting);
        assert_eq!(store.waiting_fan_ins(run_id).await.unwrap().len(), 1);
    }

    /// Conditional activation: exactly one writer flips waiting → activated,
    /// the loser observes false and stands down.
    #[tokio::test]
    #[ignore]
    async fn test_pg_fan_in_conditional_activation() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        store
            .create_fan_in_if_absent(&make_fan_in(run_id, "root.a:t_join"))
            .await
            .unwrap();

        let winner = Uuid::now_v7();
        let loser = Uuid::now_v7();
        assert!(store
            .finish_fan_in(
                run_id,
                "root.a:t_join",
                FanInStatus::Activated,
                Some(winner),
                1700000001000,
            )
            .await
            .unwrap());
        assert!(!store
            .finish_fan_in(
                run_id,
                "root.a:t_join",
                FanInStatus::Activated,
                Some(loser),
                1700000002000,
            )
            .await
            .unwrap());
        // The timeout path uses the same primitive and also loses.
        assert!(!store
            .finish_fan_in(
                run_id,
                "root.a:t_join",
                FanInStatus::TimedOut,
                None,
                1700000003000,
            )
            .await
            .unwrap());

        let loaded = store
            .load_fan_in(run_id, "root.a:t_join")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, FanInStatus::Activated);
        assert_eq!(loaded.activated_by_token_id, Some(winner));
        assert!(store.waiting_fan_ins(run_id).await.unwrap().is_empty());
    }

    /// Run status: first terminal write wins, later attempts are refused.
    #[tokio::test]
    #[ignore]
    async fn test_pg_run_status_guarded_write() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        store.init_run(run_id, "wf", 1700000000000).await.unwrap();
        assert_eq!(
            store.load_status(run_id).await.unwrap(),
            Some(RunStatus::Running)
        );

        assert!(store
            .update_status(run_id, RunStatus::Completed, 1700000001000)
            .await
            .unwrap());
        assert!(!store
            .update_status(run_id, RunStatus::Failed, 1700000002000)
            .await
            .unwrap());
        assert_eq!(
            store.load_status(run_id).await.unwrap(),
            Some(RunStatus::Completed)
        );
    }

    /// Context round trip through the schema-generated tables: declared
    /// columns, `_extra` spillover, validated writes, read-only input.
    #[tokio::test]
    #[ignore]
    async fn test_pg_context_round_trip() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let def = make_def();

        // Schema violation refused before any table is written.
        assert!(store
            .init_context(run_id, &def, &serde_json::json!({}))
            .await
            .is_err());

        let input = serde_json::json!({
            "customer_id": "c-1",
            "region": "emea",
            "untyped": {"nested": true}
        });
        store.init_context(run_id, &def, &input).await.unwrap();

        let ctx = store.read_context(run_id).await.unwrap();
        assert_eq!(ctx.input["customer_id"], "c-1");
        assert_eq!(ctx.input["region"], "emea");
        // Spillover fields come back from _extra.
        assert_eq!(ctx.input["untyped"]["nested"], true);
        assert_eq!(ctx.state, serde_json::json!({}));
        assert_eq!(ctx.output, serde_json::json!({}));

        store
            .set_context_value(run_id, "state.votes", &serde_json::json!(["A", "B"]))
            .await
            .unwrap();
        store
            .merge_output(run_id, &serde_json::json!({"verdict": "A"}))
            .await
            .unwrap();
        let ctx = store.read_context(run_id).await.unwrap();
        assert_eq!(ctx.state["votes"], serde_json::json!(["A", "B"]));
        assert_eq!(ctx.output["verdict"], "A");

        // state schema says votes is an array.
        assert!(store
            .set_context_value(run_id, "state.votes", &serde_json::json!(42))
            .await
            .is_err());
        // Input is read-only.
        assert!(store
            .set_context_value(run_id, "input.region", &serde_json::json!("apac"))
            .await
            .is_err());
    }

    /// Branch table lifecycle: create, write under _branch.output, read
    /// back, drop, and survive a write after a drop (late redelivery).
    #[tokio::test]
    #[ignore]
    async fn test_pg_branch_table_lifecycle() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let t0 = Uuid::now_v7();
        let t1 = Uuid::now_v7();

        store.init_branch_table(run_id, t0).await.unwrap();
        store.init_branch_table(run_id, t1).await.unwrap();
        store
            .write_branch_output(run_id, t0, &serde_json::json!({"vote": "A"}))
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

        // A straggler writing after the drop recreates its own table only.
        store
            .write_branch_output(run_id, t1, &serde_json::json!({"vote": "C"}))
            .await
            .unwrap();
        let rows = store.read_branch_rows(run_id, &[t0, t1]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, t1);
        store.drop_branch_tables(run_id, &[t1]).await.unwrap();
    }

    /// Subworkflow round trip with the unique child-run lookup.
    #[tokio::test]
    #[ignore]
    async fn test_pg_subworkflow_round_trip() {
        let (_pool, store) = setup().await;
        let run_id = Uuid::now_v7();
        let sub = Subworkflow {
            id: Uuid::now_v7(),
            run_id,
            parent_token_id: Uuid::now_v7(),
            subworkflow_run_id: Uuid::now_v7(),
            status: SubworkflowStatus::Running,
            timeout_ms: Some(60_000),
            created_at: 1700000000000,
            updated_at: 1700000000000,
        };
        store.insert_subworkflow(&sub).await.unwrap();

        let loaded = store
            .load_subworkflow_by_child(sub.subworkflow_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, sub.id);
        assert_eq!(loaded.timeout_ms, Some(60_000));
        assert_eq!(store.active_subworkflows(run_id).await.unwrap().len(), 1);

        assert!(store
            .update_subworkflow_status(sub.id, SubworkflowStatus::Completed, 1700000001000)
            .await
            .unwrap());
        assert!(!store
            .update_subworkflow_status(sub.id, SubworkflowStatus::Failed, 1700000002000)
            .await
            .unwrap());
        assert!(store.active_subworkflows(run_id).await.unwrap().is_empty());
    }
}
