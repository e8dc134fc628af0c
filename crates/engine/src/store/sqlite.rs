use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};
use tracing::{debug, error, info};

use crate::{
    store::Store,
    workflow::{
        ExecutionContext, StepExecution, StepStatus, WorkflowDefinition, WorkflowInstance,
        WorkflowStatus,
    },
    Error, Result,
};

const INSTANCE_COLUMNS: &str = r#"
    id, workflow_definition_id, name, user_id, status, current_step_id, error_message,
    priority, metadata, created_at, updated_at, started_at, completed_at
"#;

const STEP_EXECUTION_COLUMNS: &str = r#"
    id, workflow_instance_id, step_id, step_name, status, assigned_agent_id,
    assigned_agent_role, timeout_seconds, attempt, input, output, metadata, logs,
    error_message, created_at, updated_at, started_at, completed_at
"#;

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// `database_url` is a file path, a `sqlite:` URL or `:memory:`.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            let file = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to :memory: is its own database, so pin a single one
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn json_map(row: &SqliteRow, column: &str) -> Result<HashMap<String, JsonValue>> {
    Ok(serde_json::from_str(&row.get::<String, _>(column))?)
}

fn int_column<T: TryFrom<i64>>(row: &SqliteRow, column: &str) -> Result<T> {
    let value: i64 = row.get(column);
    T::try_from(value)
        .map_err(|_| Error::Internal(format!("Column {} is out of range: {}", column, value)))
}

fn row_to_instance(r: &SqliteRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: r.get("id"),
        workflow_definition_id: r.get("workflow_definition_id"),
        name: r.get("name"),
        user_id: r.get("user_id"),
        status: r.get::<String, _>("status").parse()?,
        current_step_id: r.get("current_step_id"),
        error_message: r.get("error_message"),
        priority: int_column(r, "priority")?,
        metadata: json_map(r, "metadata")?,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
    })
}

fn row_to_step_execution(r: &SqliteRow) -> Result<StepExecution> {
    Ok(StepExecution {
        id: r.get("id"),
        workflow_instance_id: r.get("workflow_instance_id"),
        step_id: r.get("step_id"),
        step_name: r.get("step_name"),
        status: r.get::<String, _>("status").parse()?,
        assigned_agent_id: r.get("assigned_agent_id"),
        assigned_agent_role: r.get("assigned_agent_role"),
        timeout_seconds: int_column(r, "timeout_seconds")?,
        attempt: int_column(r, "attempt")?,
        input: json_map(r, "input")?,
        output: json_map(r, "output")?,
        metadata: json_map(r, "metadata")?,
        logs: serde_json::from_str(&r.get::<String, _>("logs"))?,
        error_message: r.get("error_message"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
    })
}

fn row_to_context(r: &SqliteRow) -> Result<ExecutionContext> {
    Ok(ExecutionContext {
        id: r.get("id"),
        workflow_instance_id: r.get("workflow_instance_id"),
        data: json_map(r, "data")?,
        metadata: json_map(r, "metadata")?,
        version: r.get("version"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    // Workflow definition operations
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        debug!("Saving workflow definition: {}", definition.id);

        let document = to_json(&definition)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (
                id, name, version, is_active, is_template, document, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                is_active = excluded.is_active,
                is_template = excluded.is_template,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.version)
        .bind(definition.is_active)
        .bind(definition.is_template)
        .bind(document)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        debug!("Getting workflow definition: {}", id);

        let row = sqlx::query("SELECT document FROM workflow_definitions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(serde_json::from_str(&r.get::<String, _>("document"))?)),
            None => Ok(None),
        }
    }

    async fn delete_definition(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workflow_definitions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_definitions(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM workflow_definitions
            WHERE ?1 = 0 OR is_active = 1
            ORDER BY created_at ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("document"))?))
            .collect()
    }

    // Workflow instance operations
    async fn save_instance(&self, instance: WorkflowInstance) -> Result<()> {
        debug!("Saving workflow instance: {} ({})", instance.id, instance.status);

        let metadata_json = to_json(&instance.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, workflow_definition_id, name, user_id, status, current_step_id,
                error_message, priority, metadata, created_at, updated_at,
                started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                current_step_id = excluded.current_step_id,
                error_message = excluded.error_message,
                priority = excluded.priority,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.workflow_definition_id)
        .bind(&instance.name)
        .bind(&instance.user_id)
        .bind(instance.status.to_string())
        .bind(&instance.current_step_id)
        .bind(&instance.error_message)
        .bind(i64::from(instance.priority))
        .bind(metadata_json)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        debug!("Getting workflow instance: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE id = ?1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM step_executions WHERE workflow_instance_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM execution_contexts WHERE workflow_instance_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_instances WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            INSTANCE_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_instances_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE status = ?1 ORDER BY created_at ASC",
            INSTANCE_COLUMNS
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_instances_by_definition(&self, definition_id: &str) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE workflow_definition_id = ?1 ORDER BY created_at ASC",
            INSTANCE_COLUMNS
        ))
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_instances_by_user(&self, user_id: &str) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_instances WHERE user_id = ?1 ORDER BY created_at DESC",
            INSTANCE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn list_instances_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM workflow_instances
            WHERE status = ?1 AND completed_at >= ?2 AND completed_at <= ?3
            ORDER BY completed_at ASC
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(WorkflowStatus::Completed.to_string())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    // Step execution operations
    async fn save_step_execution(&self, execution: StepExecution) -> Result<()> {
        debug!(
            "Saving step execution: {} ({} -> {})",
            execution.id, execution.step_id, execution.status
        );

        let input_json = to_json(&execution.input)?;
        let output_json = to_json(&execution.output)?;
        let metadata_json = to_json(&execution.metadata)?;
        let logs_json = to_json(&execution.logs)?;
        let timeout_seconds = i64::try_from(execution.timeout_seconds).map_err(|_| {
            Error::Internal(format!(
                "Timeout of step execution {} is out of range: {}",
                execution.id, execution.timeout_seconds
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO step_executions (
                id, workflow_instance_id, step_id, step_name, status, assigned_agent_id,
                assigned_agent_role, timeout_seconds, attempt, input, output, metadata, logs,
                error_message, created_at, updated_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                assigned_agent_id = excluded.assigned_agent_id,
                assigned_agent_role = excluded.assigned_agent_role,
                timeout_seconds = excluded.timeout_seconds,
                input = excluded.input,
                output = excluded.output,
                metadata = excluded.metadata,
                logs = excluded.logs,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_instance_id)
        .bind(&execution.step_id)
        .bind(&execution.step_name)
        .bind(execution.status.to_string())
        .bind(&execution.assigned_agent_id)
        .bind(&execution.assigned_agent_role)
        .bind(timeout_seconds)
        .bind(i64::from(execution.attempt))
        .bind(input_json)
        .bind(output_json)
        .bind(metadata_json)
        .bind(logs_json)
        .bind(&execution.error_message)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_step_execution(&self, id: &str) -> Result<Option<StepExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE id = ?1",
            STEP_EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_step_execution).transpose()
    }

    async fn find_step_executions_by_status(
        &self,
        instance_id: &str,
        status: StepStatus,
    ) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE workflow_instance_id = ?1 AND status = ?2 ORDER BY seq ASC",
            STEP_EXECUTION_COLUMNS
        ))
        .bind(instance_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step_execution).collect()
    }

    async fn list_step_executions(&self, instance_id: &str) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE workflow_instance_id = ?1 ORDER BY seq ASC",
            STEP_EXECUTION_COLUMNS
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step_execution).collect()
    }

    async fn list_step_executions_by_status(&self, status: StepStatus) -> Result<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE status = ?1 ORDER BY seq ASC",
            STEP_EXECUTION_COLUMNS
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step_execution).collect()
    }

    // Execution context operations
    async fn get_execution_context(&self, instance_id: &str) -> Result<Option<ExecutionContext>> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_instance_id, data, metadata, version, created_at, updated_at
            FROM execution_contexts
            WHERE workflow_instance_id = ?1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_context).transpose()
    }

    async fn save_execution_context(
        &self,
        context: ExecutionContext,
        expected_version: Option<i64>,
    ) -> Result<()> {
        let data_json = to_json(&context.data)?;
        let metadata_json = to_json(&context.metadata)?;

        match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO execution_contexts (
                        workflow_instance_id, id, data, metadata, version, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(workflow_instance_id) DO UPDATE SET
                        data = excluded.data,
                        metadata = excluded.metadata,
                        version = excluded.version,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&context.workflow_instance_id)
                .bind(&context.id)
                .bind(data_json)
                .bind(metadata_json)
                .bind(context.version)
                .bind(context.created_at)
                .bind(context.updated_at)
                .execute(&self.pool)
                .await?;
            }
            Some(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE execution_contexts
                    SET data = ?1, metadata = ?2, version = ?3, updated_at = ?4
                    WHERE workflow_instance_id = ?5 AND version = ?6
                    "#,
                )
                .bind(data_json)
                .bind(metadata_json)
                .bind(context.version)
                .bind(context.updated_at)
                .bind(&context.workflow_instance_id)
                .bind(expected)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(Error::VersionConflict(format!(
                        "Execution context for {} is not at version {}",
                        context.workflow_instance_id, expected
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        let store = SqliteStore::new(":memory:", 1).await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_out_of_range_priority_is_an_error() {
        let store = store().await;
        let instance = WorkflowInstance::new("def-1", "run", "user-1");
        store.save_instance(instance.clone()).await.unwrap();

        sqlx::query("UPDATE workflow_instances SET priority = ?1 WHERE id = ?2")
            .bind(i64::from(i32::MAX) + 1)
            .bind(&instance.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get_instance(&instance.id).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("priority"));
    }

    #[tokio::test]
    async fn test_negative_timeout_is_an_error() {
        let store = store().await;
        let execution = StepExecution::new("i-1", "a", "A");
        store.save_step_execution(execution.clone()).await.unwrap();

        sqlx::query("UPDATE step_executions SET timeout_seconds = -1 WHERE id = ?1")
            .bind(&execution.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get_step_execution(&execution.id).await.unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }
}
