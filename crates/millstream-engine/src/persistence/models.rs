//! Persisted entities.
//!
//! Ownership: a workflow execution owns its task executions; a task
//! execution owns its action executions and, for sub-workflow tasks, its
//! child workflow executions (cascade delete in the relational schema).
//! `root_execution_id` back-references the topmost ancestor of a
//! sub-workflow tree; it is assigned once at creation and never forms a
//! cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::spec::{TaskEvent, TaskSpec, TaskType, WorkflowSpec};
use crate::state::State;

/// A published workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub project_id: String,

    /// Raw workflow-language source.
    pub definition: String,

    /// Validated spec tree produced by the parser.
    pub spec: WorkflowSpec,

    /// Checksum of the spec; definitions are immutable once pinned.
    pub checksum: String,

    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(namespace: impl Into<String>, definition: impl Into<String>, spec: WorkflowSpec) -> Self {
        let now = Utc::now();
        let checksum = spec_checksum(&spec);

        Self {
            id: Uuid::now_v7(),
            name: spec.name.clone(),
            namespace: namespace.into(),
            project_id: String::new(),
            definition: definition.into(),
            spec,
            checksum,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Checksum of a spec tree (hex SHA-256 over its canonical JSON).
pub fn spec_checksum(spec: &WorkflowSpec) -> String {
    let json = serde_json::to_string(spec).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Parameters a workflow execution was started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Environment variables exposed through `env()`.
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,

    /// Parent task when this execution is a sub-workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,

    /// Topmost ancestor of the sub-workflow tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution_id: Option<Uuid>,

    /// Namespace override; defaults to the definition's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Target task for reverse workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// Iteration bookkeeping shared by action executions and sub-workflow
/// executions acting as with-items children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRuntime {
    /// With-items iteration index this execution belongs to (0 for plain
    /// tasks).
    #[serde(default)]
    pub index: u32,

    /// Attempt number, starting at 0; incremented by the retry policy.
    #[serde(default)]
    pub attempt: u32,
}

/// A workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub workflow_namespace: String,

    /// Definition this execution was created from.
    pub workflow_definition_id: Option<Uuid>,

    pub project_id: String,
    pub state: State,
    pub state_info: Option<String>,

    /// Spec snapshot taken at start; immune to definition updates.
    pub spec: WorkflowSpec,

    pub params: ExecutionParams,
    pub input: Value,
    pub output: Option<Value>,

    /// Workflow context: input merged with evaluated vars; environment under
    /// `__env`. Published task variables are merged in on read.
    pub context: Value,

    /// Whether the result was accepted by the parent with-items controller
    /// (sub-workflow executions only).
    pub accepted: bool,

    /// Terminal executions are frozen except for this flag.
    pub read_only: bool,

    pub runtime: ExecutionRuntime,

    pub root_execution_id: Option<Uuid>,

    /// Parent task when this is a sub-workflow.
    pub task_execution_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(spec: WorkflowSpec, input: Value, params: ExecutionParams) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            name: spec.name.clone(),
            description: String::new(),
            workflow_namespace: params.namespace.clone().unwrap_or_default(),
            workflow_definition_id: None,
            project_id: String::new(),
            state: State::Idle,
            state_info: None,
            spec,
            task_execution_id: params.task_execution_id,
            root_execution_id: params.root_execution_id,
            params,
            input,
            output: None,
            context: Value::Object(serde_json::Map::new()),
            accepted: false,
            read_only: false,
            runtime: ExecutionRuntime::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this execution runs as a task's sub-workflow.
    pub fn is_sub_workflow(&self) -> bool {
        self.task_execution_id.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A routed next task recorded on completion: `(task name, firing event)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTask {
    pub name: String,
    pub event: TaskEvent,
}

/// With-items progress stored in the task runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WithItemsContext {
    /// Declared iteration count (shortest bound collection).
    pub count: u32,

    /// Next iteration index to dispatch.
    pub index: u32,

    /// Remaining concurrency slots; `None` means unbounded.
    pub capacity: Option<u32>,

    /// Configured concurrency bound, when one was given.
    pub concurrency: Option<u32>,
}

/// Retry bookkeeping stored in the task runtime context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryContext {
    /// Highest retry number used by any iteration.
    #[serde(default)]
    pub retry_no: u32,

    /// Retries consumed per iteration index.
    #[serde(default)]
    pub attempts: BTreeMap<u32, u32>,
}

/// Engine-internal task state not visible to the workflow language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItemsContext>,

    #[serde(default)]
    pub retry: RetryContext,

    /// Whether a `wait` delay has already been served.
    #[serde(default)]
    pub waited: bool,

    /// Evaluated with-items tuples, fixed at task start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Value>,
}

/// A task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub name: String,
    pub state: State,
    pub state_info: Option<String>,
    pub task_type: TaskType,

    /// Spec snapshot of this task.
    pub spec: TaskSpec,

    /// Context the task was started with.
    pub in_context: Value,

    /// Variables published on completion.
    pub published: Value,

    /// Whether publishing and next-task computation have been done (exactly
    /// once). Completed-but-unprocessed tasks are what the integrity monitor
    /// hunts for.
    pub processed: bool,

    /// Whether completion produced next tasks. Only meaningful once the
    /// task is completed.
    pub has_next_tasks: bool,

    pub next_tasks: Vec<NextTask>,

    /// Whether an error was caught by an on-error route and must not bubble
    /// up to the workflow.
    pub error_handled: bool,

    pub runtime: TaskRuntime,

    /// Globally unique creation key; prevents duplicate spawning under
    /// races.
    pub unique_key: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(workflow_execution_id: Uuid, spec: TaskSpec, in_context: Value) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            name: spec.name.clone(),
            state: State::Running,
            state_info: None,
            task_type: spec.task_type(),
            unique_key: Some(task_unique_key(workflow_execution_id, &spec.name)),
            spec,
            in_context,
            published: Value::Object(serde_json::Map::new()),
            processed: false,
            has_next_tasks: false,
            next_tasks: Vec::new(),
            error_handled: false,
            runtime: TaskRuntime::default(),
            started_at: Some(now),
            finished_at: None,
            project_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Unique creation key of a task within its workflow execution.
pub fn task_unique_key(workflow_execution_id: Uuid, task_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_execution_id.as_bytes());
    hasher.update(task_name.as_bytes());
    hex::encode(hasher.finalize())
}

/// An action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    pub task_execution_id: Uuid,
    pub name: String,
    pub state: State,
    pub state_info: Option<String>,
    pub input: Value,
    pub output: Option<Value>,

    /// Whether this execution counts toward the task result. Superseded
    /// retry attempts are flipped back to false.
    pub accepted: bool,

    pub is_sync: bool,

    /// Refreshed by executor heartbeats; seeded with the first-heartbeat
    /// grace period.
    pub last_heartbeat: DateTime<Utc>,

    pub runtime: ExecutionRuntime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionExecution {
    pub fn new(
        task_execution_id: Uuid,
        name: impl Into<String>,
        input: Value,
        first_heartbeat_timeout: u64,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            task_execution_id,
            name: name.into(),
            state: State::Running,
            state_info: None,
            input,
            output: None,
            accepted: false,
            is_sync: true,
            last_heartbeat: now + chrono::Duration::seconds(first_heartbeat_timeout as i64),
            runtime: ExecutionRuntime::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A scheduled job: persisted future work fired by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,

    /// Deduplication key; at most one unprocessed job per key.
    pub key: Option<String>,

    /// Requested delay in seconds.
    pub run_after: i64,

    /// Wall-clock time at or after which the job fires.
    pub execute_at: DateTime<Utc>,

    /// Registry key of the handler to invoke.
    pub func_name: String,

    pub func_args: Value,

    /// Set when a worker claims the job; cleared on transient failure so
    /// another poll retries.
    pub captured_at: Option<DateTime<Utc>>,

    pub processing: bool,

    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(func_name: impl Into<String>, func_args: Value, run_after: i64) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            key: None,
            run_after,
            execute_at: now + chrono::Duration::seconds(run_after),
            func_name: func_name.into(),
            func_args,
            captured_at: None,
            processing: false,
            created_at: now,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A named lock row. The table never accumulates rows at rest: a row exists
/// only while the owning critical section runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLock {
    pub id: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_unique_key_is_stable_and_distinct() {
        let wf_a = Uuid::now_v7();
        let wf_b = Uuid::now_v7();

        assert_eq!(task_unique_key(wf_a, "t1"), task_unique_key(wf_a, "t1"));
        assert_ne!(task_unique_key(wf_a, "t1"), task_unique_key(wf_a, "t2"));
        assert_ne!(task_unique_key(wf_a, "t1"), task_unique_key(wf_b, "t1"));
    }

    #[test]
    fn test_scheduled_job_execute_at() {
        let job = ScheduledJob::new("task.retry", json!({}), 30);
        let delta = job.execute_at - job.created_at;
        assert_eq!(delta.num_seconds(), 30);
        assert!(job.captured_at.is_none());
        assert!(!job.processing);
    }

    #[test]
    fn test_action_first_heartbeat_grace() {
        let action = ActionExecution::new(Uuid::now_v7(), "std.echo", json!({}), 600);
        assert!(action.last_heartbeat > Utc::now() + chrono::Duration::seconds(500));
    }

    #[test]
    fn test_spec_checksum_changes_with_spec() {
        use crate::spec::{TaskSpec, WorkflowType};
        use std::collections::BTreeMap;

        let spec_a = WorkflowSpec {
            name: "wf".into(),
            workflow_type: WorkflowType::Direct,
            input: vec![],
            output: None,
            vars: BTreeMap::new(),
            tasks: BTreeMap::from([("t".to_string(), TaskSpec::action("t", "std.echo"))]),
        };
        let mut spec_b = spec_a.clone();
        spec_b
            .tasks
            .insert("t2".to_string(), TaskSpec::action("t2", "std.fail"));

        assert_eq!(spec_checksum(&spec_a), spec_checksum(&spec_a));
        assert_ne!(spec_checksum(&spec_a), spec_checksum(&spec_b));
    }
}
