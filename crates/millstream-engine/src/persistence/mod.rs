//! Persistence layer.
//!
//! This module provides:
//! - The entity model (workflow/task/action executions, scheduled jobs)
//! - The [`Store`] / [`StoreTx`] traits: transactions, row locks and the
//!   named-lock primitive
//! - [`MemoryStore`] for tests and embedding
//! - [`PostgresStore`] for production

mod memory;
mod models;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use models::{
    spec_checksum, task_unique_key, ActionExecution, ExecutionParams, ExecutionRuntime,
    NamedLock, NextTask, RetryContext, ScheduledJob, TaskExecution, TaskRuntime,
    WithItemsContext, WorkflowDefinition, WorkflowExecution,
};
pub use postgres::PostgresStore;
pub use store::{
    cut_state_info, retry_on_db_error, validate_action_execution_fields,
    validate_long_field, validate_task_execution_fields, validate_workflow_execution_fields,
    Store, StoreError, StoreTx, TransientCheck, STATE_INFO_LIMIT,
};
