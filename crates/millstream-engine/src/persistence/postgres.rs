//! PostgreSQL implementation of the store.
//!
//! Production persistence using PostgreSQL with:
//! - Row-level locking via `SELECT … FOR UPDATE`
//! - Contention-free job claiming with `FOR UPDATE SKIP LOCKED`
//! - Named locks built on READ COMMITTED insert blocking
//! - Transient-error classification for deadlocks and serialization
//!   failures (retried by the caller)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::spec::TaskType;
use crate::state::State;

/// PostgreSQL implementation of [`Store`].
///
/// Uses a connection pool; any number of engine processes may share one
/// database.
///
/// # Example
///
/// ```ignore
/// use millstream_engine::persistence::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/millstream").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    field_size_limit_kb: i64,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            field_size_limit_kb: 1024,
        }
    }

    /// Set the long-field size limit in KB (negative = unlimited).
    pub fn with_field_size_limit_kb(mut self, limit: i64) -> Self {
        self.field_size_limit_kb = limit;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self, read_only: bool) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        if read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        Ok(Box::new(PgTx {
            tx: Some(tx),
            limit_kb: self.field_size_limit_kb,
        }))
    }

    async fn acquire_named_lock(&self, name: &str) -> Result<Uuid, StoreError> {
        // Insert blocking under READ COMMITTED: a concurrent inserter of the
        // same name waits for the in-flight insert to finish. Once the
        // holder deletes its row and commits, one waiter wins the insert;
        // the others get a unique violation and go around again.
        loop {
            let lock_id = Uuid::now_v7();

            let result = sqlx::query(
                r#"
                INSERT INTO named_locks (id, name)
                VALUES ($1, $2)
                "#,
            )
            .bind(lock_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_db_err);

            match result {
                Ok(_) => {
                    debug!(name, %lock_id, "acquired named lock");
                    return Ok(lock_id);
                }
                Err(StoreError::DuplicateKey(_)) | Err(StoreError::Transient(_)) => {
                    let delay = rand::thread_rng().gen_range(20..60);
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_named_lock(&self, lock_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM named_locks WHERE id = $1
            "#,
        )
        .bind(lock_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        debug!(%lock_id, "released named lock");
        Ok(())
    }
}

struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
    limit_kb: i64,
}

impl PgTx {
    fn tx(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction already finished")
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_workflow_execution(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            SELECT id FROM workflow_executions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?
        .map(|_| ())
        .ok_or_else(|| StoreError::not_found("workflow execution", id))
    }

    async fn lock_task_execution(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            SELECT id FROM task_executions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?
        .map(|_| ())
        .ok_or_else(|| StoreError::not_found("task execution", id))
    }

    async fn create_workflow_definition(
        &mut self,
        def: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        let spec = to_json(&def.spec)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (
                id, name, namespace, project_id, definition, spec,
                checksum, is_system, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(def.id)
        .bind(&def.name)
        .bind(&def.namespace)
        .bind(&def.project_id)
        .bind(&def.definition)
        .bind(&spec)
        .bind(&def.checksum)
        .bind(def.is_system)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to create workflow definition: {}", e);
            map_db_err(e)
        })?;

        debug!(name = %def.name, namespace = %def.namespace, "created workflow definition");
        Ok(())
    }

    async fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, namespace, project_id, definition, spec,
                   checksum, is_system, created_at, updated_at
            FROM workflow_definitions
            WHERE name = $1 AND namespace = $2
            "#,
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| {
            StoreError::not_found("workflow definition", format!("{}/{}", namespace, name))
        })?;

        workflow_definition_from_row(&row)
    }

    async fn create_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        validate_workflow_execution_fields(self.limit_kb, ex)?;

        let spec = to_json(&ex.spec)?;
        let params = to_json(&ex.params)?;
        let runtime = to_json(&ex.runtime)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, name, description, workflow_namespace, workflow_definition_id,
                project_id, state, state_info, spec, params, input, output, context,
                accepted, read_only, runtime, root_execution_id, task_execution_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(ex.id)
        .bind(&ex.name)
        .bind(&ex.description)
        .bind(&ex.workflow_namespace)
        .bind(ex.workflow_definition_id)
        .bind(&ex.project_id)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(&spec)
        .bind(&params)
        .bind(&ex.input)
        .bind(&ex.output)
        .bind(&ex.context)
        .bind(ex.accepted)
        .bind(ex.read_only)
        .bind(&runtime)
        .bind(ex.root_execution_id)
        .bind(ex.task_execution_id)
        .bind(ex.created_at)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to create workflow execution: {}", e);
            map_db_err(e)
        })?;

        debug!(workflow_execution_id = %ex.id, "created workflow execution");
        Ok(())
    }

    async fn get_workflow_execution(&mut self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.load_workflow_execution(id)
            .await?
            .ok_or_else(|| StoreError::not_found("workflow execution", id))
    }

    async fn load_workflow_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(workflow_execution_from_row).transpose()
    }

    async fn update_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        validate_workflow_execution_fields(self.limit_kb, ex)?;

        let spec = to_json(&ex.spec)?;
        let params = to_json(&ex.params)?;
        let runtime = to_json(&ex.runtime)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET state = $2,
                state_info = $3,
                spec = $4,
                params = $5,
                input = $6,
                output = $7,
                context = $8,
                accepted = $9,
                read_only = $10,
                runtime = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(ex.id)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(&spec)
        .bind(&params)
        .bind(&ex.input)
        .bind(&ex.output)
        .bind(&ex.context)
        .bind(ex.accepted)
        .bind(ex.read_only)
        .bind(&runtime)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to update workflow execution: {}", e);
            map_db_err(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workflow execution", ex.id));
        }

        Ok(())
    }

    async fn get_sub_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_executions
            WHERE task_execution_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(task_execution_id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(workflow_execution_from_row).collect()
    }

    async fn get_workflow_executions_by_root(
        &mut self,
        root_execution_id: Uuid,
        state: Option<State>,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_executions
            WHERE root_execution_id = $1
              AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at
            "#,
        )
        .bind(root_execution_id)
        .bind(state.map(|s| s.to_string()))
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(workflow_execution_from_row).collect()
    }

    async fn mark_workflow_executions_read_only(
        &mut self,
        ids: &[Uuid],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions SET read_only = TRUE WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        Ok(())
    }

    async fn create_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError> {
        validate_task_execution_fields(self.limit_kb, ex)?;

        let spec = to_json(&ex.spec)?;
        let next_tasks = to_json(&ex.next_tasks)?;
        let runtime = to_json(&ex.runtime)?;

        sqlx::query(
            r#"
            INSERT INTO task_executions (
                id, workflow_execution_id, name, state, state_info, task_type,
                spec, in_context, published, processed, has_next_tasks, next_tasks,
                error_handled, runtime, unique_key, started_at, finished_at,
                project_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(ex.id)
        .bind(ex.workflow_execution_id)
        .bind(&ex.name)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(task_type_str(ex.task_type))
        .bind(&spec)
        .bind(&ex.in_context)
        .bind(&ex.published)
        .bind(ex.processed)
        .bind(ex.has_next_tasks)
        .bind(&next_tasks)
        .bind(ex.error_handled)
        .bind(&runtime)
        .bind(&ex.unique_key)
        .bind(ex.started_at)
        .bind(ex.finished_at)
        .bind(&ex.project_id)
        .bind(ex.created_at)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to create task execution: {}", e);
            map_db_err(e)
        })?;

        debug!(task_execution_id = %ex.id, task = %ex.name, "created task execution");
        Ok(())
    }

    async fn get_task_execution(&mut self, id: Uuid) -> Result<TaskExecution, StoreError> {
        self.load_task_execution(id)
            .await?
            .ok_or_else(|| StoreError::not_found("task execution", id))
    }

    async fn load_task_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM task_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(task_execution_from_row).transpose()
    }

    async fn update_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError> {
        validate_task_execution_fields(self.limit_kb, ex)?;

        let next_tasks = to_json(&ex.next_tasks)?;
        let runtime = to_json(&ex.runtime)?;

        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET state = $2,
                state_info = $3,
                in_context = $4,
                published = $5,
                processed = $6,
                has_next_tasks = $7,
                next_tasks = $8,
                error_handled = $9,
                runtime = $10,
                started_at = $11,
                finished_at = $12,
                updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(ex.id)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(&ex.in_context)
        .bind(&ex.published)
        .bind(ex.processed)
        .bind(ex.has_next_tasks)
        .bind(&next_tasks)
        .bind(ex.error_handled)
        .bind(&runtime)
        .bind(ex.started_at)
        .bind(ex.finished_at)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to update task execution: {}", e);
            map_db_err(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task execution", ex.id));
        }

        Ok(())
    }

    async fn get_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_executions
            WHERE workflow_execution_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(workflow_execution_id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(task_execution_from_row).collect()
    }

    async fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM task_executions WHERE unique_key = $1
            "#,
        )
        .bind(unique_key)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(task_execution_from_row).transpose()
    }

    async fn get_stale_running_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_executions
            WHERE workflow_execution_id = $1
              AND state = 'RUNNING'
              AND updated_at < $2
            ORDER BY updated_at
            LIMIT $3
            "#,
        )
        .bind(workflow_execution_id)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(task_execution_from_row).collect()
    }

    async fn create_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError> {
        validate_action_execution_fields(self.limit_kb, ex)?;

        let runtime = to_json(&ex.runtime)?;

        sqlx::query(
            r#"
            INSERT INTO action_executions (
                id, task_execution_id, name, state, state_info, input, output,
                accepted, is_sync, last_heartbeat, runtime, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(ex.id)
        .bind(ex.task_execution_id)
        .bind(&ex.name)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(&ex.input)
        .bind(&ex.output)
        .bind(ex.accepted)
        .bind(ex.is_sync)
        .bind(ex.last_heartbeat)
        .bind(&runtime)
        .bind(ex.created_at)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to create action execution: {}", e);
            map_db_err(e)
        })?;

        debug!(action_execution_id = %ex.id, action = %ex.name, "created action execution");
        Ok(())
    }

    async fn get_action_execution(&mut self, id: Uuid) -> Result<ActionExecution, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM action_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| StoreError::not_found("action execution", id))?;

        action_execution_from_row(&row)
    }

    async fn update_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError> {
        validate_action_execution_fields(self.limit_kb, ex)?;

        let runtime = to_json(&ex.runtime)?;

        let result = sqlx::query(
            r#"
            UPDATE action_executions
            SET state = $2,
                state_info = $3,
                output = $4,
                accepted = $5,
                is_sync = $6,
                last_heartbeat = $7,
                runtime = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(ex.id)
        .bind(ex.state.to_string())
        .bind(cut_state_info(ex.state_info.as_deref()))
        .bind(&ex.output)
        .bind(ex.accepted)
        .bind(ex.is_sync)
        .bind(ex.last_heartbeat)
        .bind(&runtime)
        .bind(ex.updated_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to update action execution: {}", e);
            map_db_err(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("action execution", ex.id));
        }

        Ok(())
    }

    async fn get_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM action_executions
            WHERE task_execution_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(task_execution_id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(action_execution_from_row).collect()
    }

    async fn get_expired_heartbeat_actions(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM action_executions
            WHERE state NOT IN ('SUCCESS', 'ERROR', 'CANCELLED')
              AND last_heartbeat < $1
            ORDER BY last_heartbeat
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        rows.iter().map(action_execution_from_row).collect()
    }

    async fn create_scheduled_job(&mut self, job: &ScheduledJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, key, run_after, execute_at, func_name, func_args,
                captured_at, processing, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(&job.key)
        .bind(job.run_after)
        .bind(job.execute_at)
        .bind(&job.func_name)
        .bind(&job.func_args)
        .bind(job.captured_at)
        .bind(job.processing)
        .bind(job.created_at)
        .execute(&mut **self.tx())
        .await
        .map_err(|e| {
            error!("Failed to create scheduled job: {}", e);
            map_db_err(e)
        })?;

        debug!(job_id = %job.id, func = %job.func_name, "scheduled job");
        Ok(())
    }

    async fn has_scheduled_jobs(&mut self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present FROM scheduled_jobs
            WHERE key = $1 AND processing = FALSE
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        Ok(row.is_some())
    }

    async fn claim_due_scheduled_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        // SKIP LOCKED keeps concurrent pollers from contending on the same
        // rows; the capture marker makes the claim visible across workers.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM scheduled_jobs
                WHERE execute_at <= $1
                  AND captured_at IS NULL
                ORDER BY execute_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_jobs j
            SET captured_at = $1,
                processing = TRUE
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.key, j.run_after, j.execute_at, j.func_name,
                      j.func_args, j.captured_at, j.processing, j.created_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        let claimed: Result<Vec<_>, _> = rows.iter().map(scheduled_job_from_row).collect();
        let claimed = claimed?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed scheduled jobs");
        }

        Ok(claimed)
    }

    async fn delete_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM scheduled_jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        Ok(())
    }

    async fn reset_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET captured_at = NULL, processing = FALSE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        Ok(())
    }

    async fn recover_abandoned_scheduled_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET captured_at = NULL, processing = FALSE
            WHERE captured_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut **self.tx())
        .await
        .map_err(map_db_err)?;

        Ok(result.rows_affected())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .take()
            .expect("transaction already finished")
            .commit()
            .await
            .map_err(map_db_err)
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .take()
            .expect("transaction already finished")
            .rollback()
            .await
            .map_err(map_db_err)
    }
}

// Helper functions

/// Classify a sqlx error. Deadlocks (40P01) and serialization failures
/// (40001) are transient; unique violations (23505) surface as duplicate
/// keys so callers can handle creation races.
fn map_db_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        match db_err.code().as_deref() {
            Some("40001") | Some("40P01") => return StoreError::Transient(db_err.to_string()),
            Some("23505") => return StoreError::DuplicateKey(db_err.to_string()),
            _ => {}
        }
    }

    StoreError::Database(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_state(s: &str) -> Result<State, StoreError> {
    s.parse().map_err(StoreError::Database)
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Action => "ACTION",
        TaskType::Workflow => "WORKFLOW",
    }
}

fn parse_task_type(s: &str) -> Result<TaskType, StoreError> {
    match s {
        "ACTION" => Ok(TaskType::Action),
        "WORKFLOW" => Ok(TaskType::Workflow),
        other => Err(StoreError::Database(format!("unknown task type: {}", other))),
    }
}

fn workflow_definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    Ok(WorkflowDefinition {
        id: row.get("id"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        project_id: row.get("project_id"),
        definition: row.get("definition"),
        spec: from_json(row.get("spec"))?,
        checksum: row.get("checksum"),
        is_system: row.get("is_system"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn workflow_execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let state: String = row.get("state");

    Ok(WorkflowExecution {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        workflow_namespace: row.get("workflow_namespace"),
        workflow_definition_id: row.get("workflow_definition_id"),
        project_id: row.get("project_id"),
        state: parse_state(&state)?,
        state_info: row.get("state_info"),
        spec: from_json(row.get("spec"))?,
        params: from_json(row.get("params"))?,
        input: row.get("input"),
        output: row.get("output"),
        context: row.get("context"),
        accepted: row.get("accepted"),
        read_only: row.get("read_only"),
        runtime: from_json(row.get("runtime"))?,
        root_execution_id: row.get("root_execution_id"),
        task_execution_id: row.get("task_execution_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn task_execution_from_row(row: &PgRow) -> Result<TaskExecution, StoreError> {
    let state: String = row.get("state");
    let task_type: String = row.get("task_type");

    Ok(TaskExecution {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        name: row.get("name"),
        state: parse_state(&state)?,
        state_info: row.get("state_info"),
        task_type: parse_task_type(&task_type)?,
        spec: from_json(row.get("spec"))?,
        in_context: row.get("in_context"),
        published: row.get("published"),
        processed: row.get("processed"),
        has_next_tasks: row.get("has_next_tasks"),
        next_tasks: from_json(row.get("next_tasks"))?,
        error_handled: row.get("error_handled"),
        runtime: from_json(row.get("runtime"))?,
        unique_key: row.get("unique_key"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        project_id: row.get("project_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn action_execution_from_row(row: &PgRow) -> Result<ActionExecution, StoreError> {
    let state: String = row.get("state");

    Ok(ActionExecution {
        id: row.get("id"),
        task_execution_id: row.get("task_execution_id"),
        name: row.get("name"),
        state: parse_state(&state)?,
        state_info: row.get("state_info"),
        input: row.get("input"),
        output: row.get("output"),
        accepted: row.get("accepted"),
        is_sync: row.get("is_sync"),
        last_heartbeat: row.get("last_heartbeat"),
        runtime: from_json(row.get("runtime"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn scheduled_job_from_row(row: &PgRow) -> Result<ScheduledJob, StoreError> {
    Ok(ScheduledJob {
        id: row.get("id"),
        key: row.get("key"),
        run_after: row.get("run_after"),
        execute_at: row.get("execute_at"),
        func_name: row.get("func_name"),
        func_args: row.get("func_args"),
        captured_at: row.get("captured_at"),
        processing: row.get("processing"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    // Store behavior is covered by the MemoryStore suite and the engine
    // scenario tests; exercising this implementation requires a PostgreSQL
    // database (set DATABASE_URL and run the migrations first).
}
