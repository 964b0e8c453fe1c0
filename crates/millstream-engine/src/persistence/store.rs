//! Store trait definitions.
//!
//! All engine coordination happens through the store: transactions, row
//! locks, unique constraints and the named-lock table. Implementations must
//! be safe for any number of engine processes sharing one database.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::models::*;
use crate::state::State;

/// Maximum stored length of `state_info`, in bytes. Slightly below the
/// 65,535 column limit to absorb inaccuracies when the value is cut on a
/// character boundary.
pub const STATE_INFO_LIMIT: usize = 65_500;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Unique constraint violation (task unique key, named lock, job key)
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Deadlock or serialization failure; safe to retry
    #[error("transient database error: {0}")]
    Transient(String),

    /// A long field exceeded the configured size limit
    #[error("field size limit exceeded [field={field}, size={size_kb}KB, limit={limit_kb}KB]")]
    SizeLimitExceeded {
        field: &'static str,
        size_kb: i64,
        limit_kb: i64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Store for all engine entities.
///
/// `begin` opens a transaction scope; every mutation goes through a
/// [`StoreTx`]. Named locks live outside transactions: acquisition commits
/// the lock row in a tight inner transaction and release deletes it, so the
/// table never accumulates rows at rest.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a transaction. Read-only transactions must not write.
    async fn begin(&self, read_only: bool) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Acquire the named lock, blocking until it is free. Returns the lock
    /// row id to pass to [`Store::release_named_lock`].
    async fn acquire_named_lock(&self, name: &str) -> Result<Uuid, StoreError>;

    /// Release a previously acquired named lock.
    async fn release_named_lock(&self, lock_id: Uuid) -> Result<(), StoreError>;
}

/// A transaction handle.
///
/// Dropping a handle without calling [`StoreTx::commit`] must discard all
/// writes. Row-lock methods block concurrent writers of the same row for
/// the lifetime of the transaction.
#[async_trait]
pub trait StoreTx: Send {
    // =========================================================================
    // Row locks
    // =========================================================================

    /// Lock the workflow execution row (`SELECT … FOR UPDATE`).
    async fn lock_workflow_execution(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Lock the task execution row (`SELECT … FOR UPDATE`).
    async fn lock_task_execution(&mut self, id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Workflow definitions
    // =========================================================================

    async fn create_workflow_definition(
        &mut self,
        def: &WorkflowDefinition,
    ) -> Result<(), StoreError>;

    async fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> Result<WorkflowDefinition, StoreError>;

    // =========================================================================
    // Workflow executions
    // =========================================================================

    async fn create_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError>;

    async fn get_workflow_execution(&mut self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Unlike `get_workflow_execution` this method is allowed to return None.
    async fn load_workflow_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    async fn update_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError>;

    /// Child workflow executions of a task (sub-workflows).
    async fn get_sub_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Workflow executions by root, optionally filtered by state.
    async fn get_workflow_executions_by_root(
        &mut self,
        root_execution_id: Uuid,
        state: Option<State>,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Flip the read-only flag on the given executions. The only legal
    /// mutation of a terminal execution.
    async fn mark_workflow_executions_read_only(
        &mut self,
        ids: &[Uuid],
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task executions
    // =========================================================================

    /// Insert a task execution. Fails with [`StoreError::DuplicateKey`] when
    /// the unique key is already taken (concurrent spawn).
    async fn create_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError>;

    async fn get_task_execution(&mut self, id: Uuid) -> Result<TaskExecution, StoreError>;

    /// Unlike `get_task_execution` this method is allowed to return None.
    async fn load_task_execution(&mut self, id: Uuid)
        -> Result<Option<TaskExecution>, StoreError>;

    async fn update_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError>;

    async fn get_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    async fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> Result<Option<TaskExecution>, StoreError>;

    /// RUNNING tasks of a workflow not updated since `cutoff` (integrity
    /// scan).
    async fn get_stale_running_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    // =========================================================================
    // Action executions
    // =========================================================================

    async fn create_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError>;

    async fn get_action_execution(&mut self, id: Uuid) -> Result<ActionExecution, StoreError>;

    async fn update_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError>;

    async fn get_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError>;

    /// Incomplete actions whose `last_heartbeat` is older than `cutoff`.
    async fn get_expired_heartbeat_actions(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActionExecution>, StoreError>;

    // =========================================================================
    // Scheduled jobs
    // =========================================================================

    async fn create_scheduled_job(&mut self, job: &ScheduledJob) -> Result<(), StoreError>;

    /// Whether an unprocessed job with this key exists.
    async fn has_scheduled_jobs(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Claim up to `limit` due jobs: stamp `captured_at`/`processing` and
    /// return them. Claims must not collide across concurrent workers
    /// (`FOR UPDATE SKIP LOCKED` or equivalent).
    async fn claim_due_scheduled_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    async fn delete_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Clear the capture so another poll retries the job.
    async fn reset_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Reset jobs captured before `cutoff` (crashed workers). Returns how
    /// many were recovered.
    async fn recover_abandoned_scheduled_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Transaction control
    // =========================================================================

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// =============================================================================
// Write-path validation
// =============================================================================

/// Size of a JSON value in whole KB, as stored.
fn value_size_kb(value: &Value) -> i64 {
    (serde_json::to_string(value).map(|s| s.len()).unwrap_or(0) / 1024) as i64
}

/// Make sure a long field does not exceed the configured limit
/// (negative limit = unlimited).
pub fn validate_long_field(
    limit_kb: i64,
    field: &'static str,
    value: &Value,
) -> Result<(), StoreError> {
    if limit_kb < 0 {
        return Ok(());
    }

    let size_kb = value_size_kb(value);
    if size_kb > limit_kb {
        return Err(StoreError::SizeLimitExceeded {
            field,
            size_kb,
            limit_kb,
        });
    }

    Ok(())
}

/// Validate the long fields of a workflow execution before writing.
pub fn validate_workflow_execution_fields(
    limit_kb: i64,
    ex: &WorkflowExecution,
) -> Result<(), StoreError> {
    validate_long_field(limit_kb, "input", &ex.input)?;
    if let Some(output) = &ex.output {
        validate_long_field(limit_kb, "output", output)?;
    }
    let params = serde_json::to_value(&ex.params)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    validate_long_field(limit_kb, "params", &params)?;
    Ok(())
}

/// Validate the long fields of a task execution before writing.
pub fn validate_task_execution_fields(
    limit_kb: i64,
    ex: &TaskExecution,
) -> Result<(), StoreError> {
    validate_long_field(limit_kb, "published", &ex.published)
}

/// Validate the long fields of an action execution before writing.
pub fn validate_action_execution_fields(
    limit_kb: i64,
    ex: &ActionExecution,
) -> Result<(), StoreError> {
    validate_long_field(limit_kb, "input", &ex.input)?;
    if let Some(output) = &ex.output {
        validate_long_field(limit_kb, "output", output)?;
    }
    Ok(())
}

/// Cut `state_info` to fit its column, on a character boundary.
pub fn cut_state_info(info: Option<&str>) -> Option<String> {
    info.map(|s| {
        if s.len() <= STATE_INFO_LIMIT {
            return s.to_string();
        }
        let mut end = STATE_INFO_LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    })
}

// =============================================================================
// Transient-error retry
// =============================================================================

const DB_RETRY_ATTEMPTS: u32 = 6;
const DB_RETRY_MIN_DELAY_MS: u64 = 50;
const DB_RETRY_MAX_DELAY_MS: u64 = 1_000;

/// Whether an error should be retried by [`retry_on_db_error`].
pub trait TransientCheck {
    fn is_transient(&self) -> bool;
}

impl TransientCheck for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl TransientCheck for crate::error::EngineError {
    fn is_transient(&self) -> bool {
        crate::error::EngineError::is_transient(self)
    }
}

/// Retry a database operation on transient failures with bounded, jittered
/// backoff (6 attempts, 50 ms – 1 s).
pub async fn retry_on_db_error<T, E, F, Fut>(mut f: F) -> Result<T, E>
where
    E: TransientCheck + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay_ms = DB_RETRY_MIN_DELAY_MS;

    for attempt in 1..=DB_RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < DB_RETRY_ATTEMPTS => {
                let jittered = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(delay_ms / 2..=delay_ms)
                };
                warn!(attempt, delay_ms = jittered, "transient database error, retrying: {}", e);
                tokio::time::sleep(Duration::from_millis(jittered)).await;
                delay_ms = (delay_ms * 2).min(DB_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop always returns")
}
