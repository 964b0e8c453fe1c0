//! In-memory implementation of the store for testing and embedding.
//!
//! Write transactions are serialized by one async mutex and roll back by
//! restoring a snapshot. That is coarser locking than the Postgres
//! implementation but provides the same observable semantics: atomic
//! commits, rollback on drop, named-lock mutual exclusion and unique-key
//! enforcement.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::state::State;

#[derive(Default, Clone)]
struct Tables {
    definitions: HashMap<(String, String), WorkflowDefinition>,
    workflow_executions: HashMap<Uuid, WorkflowExecution>,
    task_executions: HashMap<Uuid, TaskExecution>,
    action_executions: HashMap<Uuid, ActionExecution>,
    scheduled_jobs: HashMap<Uuid, ScheduledJob>,
}

/// In-memory [`Store`] implementation.
///
/// # Example
///
/// ```
/// use millstream_engine::persistence::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    named_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    held_locks: parking_lot::Mutex<HashMap<Uuid, OwnedMutexGuard<()>>>,
    field_size_limit_kb: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            named_locks: parking_lot::Mutex::new(HashMap::new()),
            held_locks: parking_lot::Mutex::new(HashMap::new()),
            field_size_limit_kb: 1024,
        }
    }

    /// Set the long-field size limit in KB (negative = unlimited).
    pub fn with_field_size_limit_kb(mut self, limit: i64) -> Self {
        self.field_size_limit_kb = limit;
        self
    }

    /// Number of scheduled jobs currently stored (for assertions).
    pub async fn scheduled_job_count(&self) -> usize {
        self.tables.lock().await.scheduled_jobs.len()
    }

    /// Number of workflow executions currently stored (for assertions).
    pub async fn workflow_execution_count(&self) -> usize {
        self.tables.lock().await.workflow_executions.len()
    }

    /// Clear all data (for testing).
    pub async fn clear(&self) {
        let mut tables = self.tables.lock().await;
        *tables = Tables::default();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, read_only: bool) -> Result<Box<dyn StoreTx>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let snapshot = if read_only { None } else { Some(guard.clone()) };

        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            snapshot,
            read_only,
            committed: false,
            limit_kb: self.field_size_limit_kb,
        }))
    }

    async fn acquire_named_lock(&self, name: &str) -> Result<Uuid, StoreError> {
        let mutex = {
            let mut locks = self.named_locks.lock();
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let guard = mutex.lock_owned().await;
        let lock_id = Uuid::now_v7();
        self.held_locks.lock().insert(lock_id, guard);

        Ok(lock_id)
    }

    async fn release_named_lock(&self, lock_id: Uuid) -> Result<(), StoreError> {
        self.held_locks
            .lock()
            .remove(&lock_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("named lock", lock_id))
    }
}

struct MemoryTx {
    guard: Option<OwnedMutexGuard<Tables>>,
    snapshot: Option<Tables>,
    read_only: bool,
    committed: bool,
    limit_kb: i64,
}

impl MemoryTx {
    fn tables(&mut self) -> &mut Tables {
        self.guard.as_mut().expect("transaction already finished")
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Database(
                "write attempted in a read-only transaction".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // Uncommitted writes are discarded by restoring the snapshot.
        if !self.committed {
            if let (Some(guard), Some(snapshot)) = (self.guard.as_mut(), self.snapshot.take()) {
                **guard = snapshot;
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_workflow_execution(&mut self, id: Uuid) -> Result<(), StoreError> {
        // The transaction mutex already serializes writers; just verify the
        // row exists, like SELECT … FOR UPDATE would.
        if self.tables().workflow_executions.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::not_found("workflow execution", id))
        }
    }

    async fn lock_task_execution(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.tables().task_executions.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::not_found("task execution", id))
        }
    }

    async fn create_workflow_definition(
        &mut self,
        def: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let key = (def.name.clone(), def.namespace.clone());
        if self.tables().definitions.contains_key(&key) {
            return Err(StoreError::DuplicateKey(format!(
                "workflow definition {}/{}",
                def.namespace, def.name
            )));
        }
        self.tables().definitions.insert(key, def.clone());
        Ok(())
    }

    async fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> Result<WorkflowDefinition, StoreError> {
        self.tables()
            .definitions
            .get(&(name.to_string(), namespace.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::not_found("workflow definition", format!("{}/{}", namespace, name))
            })
    }

    async fn create_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_workflow_execution_fields(self.limit_kb, ex)?;

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().workflow_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_workflow_execution(&mut self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.tables()
            .workflow_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow execution", id))
    }

    async fn load_workflow_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.tables().workflow_executions.get(&id).cloned())
    }

    async fn update_workflow_execution(
        &mut self,
        ex: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_workflow_execution_fields(self.limit_kb, ex)?;

        if !self.tables().workflow_executions.contains_key(&ex.id) {
            return Err(StoreError::not_found("workflow execution", ex.id));
        }

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().workflow_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_sub_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .workflow_executions
            .values()
            .filter(|ex| ex.task_execution_id == Some(task_execution_id))
            .cloned()
            .collect();
        result.sort_by_key(|ex| ex.created_at);
        Ok(result)
    }

    async fn get_workflow_executions_by_root(
        &mut self,
        root_execution_id: Uuid,
        state: Option<State>,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .workflow_executions
            .values()
            .filter(|ex| {
                ex.root_execution_id == Some(root_execution_id)
                    && state.map(|s| ex.state == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        result.sort_by_key(|ex| ex.created_at);
        Ok(result)
    }

    async fn mark_workflow_executions_read_only(
        &mut self,
        ids: &[Uuid],
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        for id in ids {
            if let Some(ex) = self.tables().workflow_executions.get_mut(id) {
                ex.read_only = true;
            }
        }
        Ok(())
    }

    async fn create_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_task_execution_fields(self.limit_kb, ex)?;

        if let Some(key) = &ex.unique_key {
            let clash = self
                .tables()
                .task_executions
                .values()
                .any(|t| t.unique_key.as_deref() == Some(key.as_str()));
            if clash {
                return Err(StoreError::DuplicateKey(format!("task unique key {}", key)));
            }
        }

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().task_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_task_execution(&mut self, id: Uuid) -> Result<TaskExecution, StoreError> {
        self.tables()
            .task_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task execution", id))
    }

    async fn load_task_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<TaskExecution>, StoreError> {
        Ok(self.tables().task_executions.get(&id).cloned())
    }

    async fn update_task_execution(&mut self, ex: &TaskExecution) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_task_execution_fields(self.limit_kb, ex)?;

        if !self.tables().task_executions.contains_key(&ex.id) {
            return Err(StoreError::not_found("task execution", ex.id));
        }

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().task_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }

    async fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> Result<Option<TaskExecution>, StoreError> {
        Ok(self
            .tables()
            .task_executions
            .values()
            .find(|t| t.unique_key.as_deref() == Some(unique_key))
            .cloned())
    }

    async fn get_stale_running_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .task_executions
            .values()
            .filter(|t| {
                t.workflow_execution_id == workflow_execution_id
                    && t.state == State::Running
                    && t.updated_at < cutoff
            })
            .cloned()
            .collect();
        result.sort_by_key(|t| t.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn create_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_action_execution_fields(self.limit_kb, ex)?;

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().action_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_action_execution(&mut self, id: Uuid) -> Result<ActionExecution, StoreError> {
        self.tables()
            .action_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("action execution", id))
    }

    async fn update_action_execution(&mut self, ex: &ActionExecution) -> Result<(), StoreError> {
        self.check_writable()?;
        validate_action_execution_fields(self.limit_kb, ex)?;

        if !self.tables().action_executions.contains_key(&ex.id) {
            return Err(StoreError::not_found("action execution", ex.id));
        }

        let mut stored = ex.clone();
        stored.state_info = cut_state_info(stored.state_info.as_deref());
        self.tables().action_executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .action_executions
            .values()
            .filter(|a| a.task_execution_id == task_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.created_at);
        Ok(result)
    }

    async fn get_expired_heartbeat_actions(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let mut result: Vec<_> = self
            .tables()
            .action_executions
            .values()
            .filter(|a| !a.state.is_completed() && a.last_heartbeat < cutoff)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.last_heartbeat);
        result.truncate(limit);
        Ok(result)
    }

    async fn create_scheduled_job(&mut self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables().scheduled_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn has_scheduled_jobs(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .tables()
            .scheduled_jobs
            .values()
            .any(|j| j.key.as_deref() == Some(key) && !j.processing))
    }

    async fn claim_due_scheduled_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        self.check_writable()?;

        // Fire order: execute_at, then insertion order for equal times.
        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = self
            .tables()
            .scheduled_jobs
            .values()
            .filter(|j| j.execute_at <= now && j.captured_at.is_none())
            .map(|j| (j.execute_at, j.created_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(job) = self.tables().scheduled_jobs.get_mut(&id) {
                job.captured_at = Some(now);
                job.processing = true;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn delete_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables().scheduled_jobs.remove(&id);
        Ok(())
    }

    async fn reset_scheduled_job(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        if let Some(job) = self.tables().scheduled_jobs.get_mut(&id) {
            job.captured_at = None;
            job.processing = false;
        }
        Ok(())
    }

    async fn recover_abandoned_scheduled_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_writable()?;

        let mut recovered = 0;
        for job in self.tables().scheduled_jobs.values_mut() {
            if matches!(job.captured_at, Some(at) if at < cutoff) {
                job.captured_at = None;
                job.processing = false;
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.committed = true;
        self.guard.take();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        if let (Some(guard), Some(snapshot)) = (self.guard.as_mut(), self.snapshot.take()) {
            **guard = snapshot;
        }
        self.committed = true;
        self.guard.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{TaskSpec, WorkflowSpec, WorkflowType};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn wf_spec() -> WorkflowSpec {
        WorkflowSpec {
            name: "wf".into(),
            workflow_type: WorkflowType::Direct,
            input: vec![],
            output: None,
            vars: BTreeMap::new(),
            tasks: BTreeMap::from([("t".to_string(), TaskSpec::action("t", "std.echo"))]),
        }
    }

    #[tokio::test]
    async fn test_commit_persists_writes() {
        let store = MemoryStore::new();
        let ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        let id = ex.id;

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_workflow_execution(&ex).await.expect("should create");
        tx.commit().await.expect("should commit");

        let mut tx = store.begin(true).await.expect("should begin");
        let loaded = tx.get_workflow_execution(id).await.expect("should load");
        assert_eq!(loaded.id, id);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        let id = ex.id;

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_workflow_execution(&ex).await.expect("should create");
        tx.rollback().await.expect("should rollback");

        let mut tx = store.begin(true).await.expect("should begin");
        assert!(tx
            .load_workflow_execution(id)
            .await
            .expect("should query")
            .is_none());
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let store = MemoryStore::new();
        let ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        let id = ex.id;

        {
            let mut tx = store.begin(false).await.expect("should begin");
            tx.create_workflow_execution(&ex).await.expect("should create");
            // dropped without commit
        }

        let mut tx = store.begin(true).await.expect("should begin");
        assert!(tx
            .load_workflow_execution(id)
            .await
            .expect("should query")
            .is_none());
    }

    #[tokio::test]
    async fn test_unique_key_enforced() {
        let store = MemoryStore::new();
        let ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        let task_a = TaskExecution::new(ex.id, TaskSpec::action("t", "std.echo"), json!({}));
        let task_b = TaskExecution::new(ex.id, TaskSpec::action("t", "std.echo"), json!({}));

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_workflow_execution(&ex).await.expect("should create");
        tx.create_task_execution(&task_a).await.expect("should create");

        let err = tx
            .create_task_execution(&task_b)
            .await
            .expect_err("should clash");
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_scheduled_job_claiming() {
        let store = MemoryStore::new();
        let due = ScheduledJob::new("task.retry", json!({}), 0);
        let future = ScheduledJob::new("task.retry", json!({}), 3600);

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_scheduled_job(&due).await.expect("should create");
        tx.create_scheduled_job(&future).await.expect("should create");

        let claimed = tx
            .claim_due_scheduled_jobs(Utc::now(), 10)
            .await
            .expect("should claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert!(claimed[0].processing);

        // A second claim pass finds nothing: the job is captured.
        let claimed = tx
            .claim_due_scheduled_jobs(Utc::now(), 10)
            .await
            .expect("should claim");
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_job_recovery() {
        let store = MemoryStore::new();
        let job = ScheduledJob::new("task.retry", json!({}), 0);

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_scheduled_job(&job).await.expect("should create");
        tx.claim_due_scheduled_jobs(Utc::now(), 10)
            .await
            .expect("should claim");

        let recovered = tx
            .recover_abandoned_scheduled_jobs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("should recover");
        assert_eq!(recovered, 1);

        let claimed = tx
            .claim_due_scheduled_jobs(Utc::now(), 10)
            .await
            .expect("should claim");
        assert_eq!(claimed.len(), 1, "recovered job is claimable again");
    }

    #[tokio::test]
    async fn test_named_lock_mutual_exclusion() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(MemoryStore::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = Arc::clone(&store);
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                let lock = store.acquire_named_lock("section").await.expect("should lock");
                let now = inside.fetch_add(1, Ordering::SeqCst);
                assert_eq!(now, 0, "at most one holder at a time");
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                store.release_named_lock(lock).await.expect("should release");
            }));
        }

        for handle in handles {
            handle.await.expect("task should not panic");
        }
    }

    #[tokio::test]
    async fn test_state_info_is_cut_on_write() {
        let store = MemoryStore::new();
        let mut ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        ex.state_info = Some("x".repeat(STATE_INFO_LIMIT + 1000));
        let id = ex.id;

        let mut tx = store.begin(false).await.expect("should begin");
        tx.create_workflow_execution(&ex).await.expect("should create");
        let loaded = tx.get_workflow_execution(id).await.expect("should load");
        assert_eq!(
            loaded.state_info.expect("should be some").len(),
            STATE_INFO_LIMIT
        );
    }

    #[tokio::test]
    async fn test_size_limit_enforced_on_write() {
        let store = MemoryStore::new().with_field_size_limit_kb(1);
        let mut ex = WorkflowExecution::new(wf_spec(), json!({}), ExecutionParams::default());
        ex.input = json!({"blob": "x".repeat(4096)});

        let mut tx = store.begin(false).await.expect("should begin");
        let err = tx
            .create_workflow_execution(&ex)
            .await
            .expect_err("should exceed limit");
        assert!(matches!(err, StoreError::SizeLimitExceeded { .. }));
    }
}
