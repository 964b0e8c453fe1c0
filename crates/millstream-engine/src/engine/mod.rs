//! The execution engine.
//!
//! [`Engine`] is the facade shared by all handlers: workflow lifecycle
//! operations, task state management, action dispatch and the integrity
//! monitor are method families on it, living in sibling modules. Handlers
//! never call each other through module globals; everything routes through
//! this one struct, which also breaks the workflow↔task handler cycle.
//!
//! Every public entry point opens one transaction, buffers side effects in
//! a [`PostCommitQueue`] and runs them only after a successful commit.

mod action_handler;
mod integrity;
mod policies;
mod post_commit;
mod task_handler;
mod with_items;
mod workflow_handler;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::ActionExecutor;
use crate::expr::Evaluator;
use crate::persistence::{
    ActionExecution, ScheduledJob, Store, StoreTx, TaskExecution, WorkflowExecution,
};
use crate::scheduler::{JobRegistry, Scheduler};

pub use post_commit::{Command, PostCommitQueue};

/// Symbolic names of scheduled-job handlers. Part of the persisted format:
/// job rows carry these keys, not function references.
pub mod job_names {
    pub const ON_ACTION_COMPLETE: &str = "task.on_action_complete";
    pub const TASK_RETRY: &str = "task.retry";
    pub const TASK_CONTINUE: &str = "task.continue";
    pub const TASK_TIMEOUT: &str = "task.timeout";
    pub const WORKFLOW_START_PLANNED: &str = "workflow.start_planned";
    pub const INTEGRITY_CHECK: &str = "workflow.check_and_fix_integrity";
    pub const HEARTBEAT_SWEEP: &str = "action.heartbeat_sweep";
}

// Scheduled-job argument payloads.

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OnActionCompleteArgs {
    pub child_id: Uuid,
    pub workflow_child: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskRetryArgs {
    pub task_execution_id: Uuid,
    pub index: u32,
    pub attempt: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskContinueArgs {
    pub task_execution_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TaskTimeoutArgs {
    pub action_execution_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StartPlannedArgs {
    pub workflow_execution_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IntegrityArgs {
    pub workflow_execution_id: Uuid,
}

/// The workflow engine.
///
/// Any number of identical engines may share one store; coordination
/// happens entirely through the database.
///
/// # Example
///
/// ```ignore
/// use millstream_engine::prelude::*;
///
/// let engine = Engine::new(store, executor, evaluator, EngineConfig::default());
/// let handle = engine.start().await?;
///
/// let wf_ex = engine
///     .start_workflow("my_wf", "", json!({}), "", ExecutionParams::default())
///     .await?;
/// ```
pub struct Engine {
    store: Arc<dyn Store>,
    executor: Arc<dyn ActionExecutor>,
    evaluator: Arc<dyn Evaluator>,
    scheduler: Arc<Scheduler>,
    config: EngineConfig,
}

/// Handle to a started engine's background loops.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal shutdown and wait for the loops to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Engine {
    /// Create an engine over the given collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn ActionExecutor>,
        evaluator: Arc<dyn Evaluator>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), config.scheduler.clone()));

        let engine = Arc::new(Self {
            store,
            executor,
            evaluator,
            scheduler,
            config,
        });

        register_jobs(engine.scheduler.registry());
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start the scheduler and maintenance loops.
    pub async fn start(self: &Arc<Self>) -> Result<EngineHandle, EngineError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = crate::scheduler::start_loops(
            Arc::clone(&self.scheduler),
            Arc::clone(self),
            shutdown_rx,
        );

        if self.config.action_heartbeat.enabled() {
            self.schedule_heartbeat_sweep().await?;
        }

        info!("engine started");
        Ok(EngineHandle {
            shutdown_tx,
            handles,
        })
    }

    // =========================================================================
    // Transaction plumbing
    // =========================================================================

    /// Open a write transaction with a fresh post-commit queue.
    pub(crate) async fn begin(
        &self,
    ) -> Result<(Box<dyn StoreTx>, PostCommitQueue), EngineError> {
        let tx = self.store.begin(false).await?;
        Ok((tx, PostCommitQueue::new()))
    }

    /// Commit and run the buffered side effects.
    pub(crate) async fn finish(
        &self,
        tx: Box<dyn StoreTx>,
        queue: PostCommitQueue,
    ) -> Result<(), EngineError> {
        tx.commit().await?;
        self.run_commands(queue).await;
        Ok(())
    }

    /// Roll back, discarding the queue.
    pub(crate) async fn abort(&self, tx: Box<dyn StoreTx>) {
        if let Err(e) = tx.rollback().await {
            warn!("rollback failed: {}", e);
        }
    }

    /// Execute post-commit commands in FIFO order, outside any transaction.
    ///
    /// Failures are logged and dropped: the commit already happened, and the
    /// integrity monitor covers lost follow-up work.
    pub(crate) fn run_commands(&self, mut queue: PostCommitQueue) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for command in queue.drain() {
                match command {
                    Command::RunAction { dispatch } => {
                        let action_id = dispatch.action_execution_id;
                        if let Err(e) = self.executor.run(dispatch).await {
                            error!(%action_id, "executor rejected action: {}", e);
                            self.fail_rejected_action(action_id, &e.to_string()).await;
                        }
                    }

                    Command::StartSubWorkflow {
                        task_execution_id,
                        workflow,
                        namespace,
                        input,
                        index,
                        attempt,
                    } => {
                        self.start_sub_workflow(
                            task_execution_id,
                            &workflow,
                            &namespace,
                            input,
                            index,
                            attempt,
                        )
                        .await;
                    }

                    Command::ScheduleOnActionComplete {
                        child_id,
                        workflow_child,
                    } => {
                        let args = OnActionCompleteArgs {
                            child_id,
                            workflow_child,
                        };
                        let job = ScheduledJob::new(
                            job_names::ON_ACTION_COMPLETE,
                            serde_json::to_value(&args).unwrap_or(Value::Null),
                            0,
                        );
                        if let Err(e) = self.scheduler.schedule(job).await {
                            error!(%child_id, "failed to schedule completion evaluation: {}", e);
                        }
                    }

                    Command::CheckAndComplete {
                        workflow_execution_id,
                    } => {
                        if let Err(e) = self.check_and_complete(workflow_execution_id).await {
                            error!(
                                %workflow_execution_id,
                                "completion check failed: {}", e
                            );

                            // An unexpected handler failure must not leave
                            // the workflow dangling.
                            if !e.is_transient() {
                                let msg = format!(
                                    "Failed to check and complete [wf_ex_id={}]: {}",
                                    workflow_execution_id, e
                                );
                                if let Err(fail_err) = self
                                    .force_fail_workflow(workflow_execution_id, &msg)
                                    .await
                                {
                                    error!(
                                        %workflow_execution_id,
                                        "failed to force-fail workflow: {}", fail_err
                                    );
                                }
                            }
                        }
                    }

                    Command::InterruptAction {
                        action_execution_id,
                    } => {
                        if let Err(e) = self.executor.interrupt(action_execution_id).await {
                            warn!(%action_execution_id, "failed to interrupt action: {}", e);
                        }
                    }

                    Command::ScheduleJob { job } => {
                        let func = job.func_name.clone();
                        if let Err(e) = self.scheduler.schedule(job).await {
                            error!(func = %func, "failed to schedule job: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn schedule_heartbeat_sweep(&self) -> Result<(), EngineError> {
        let job = ScheduledJob::new(
            job_names::HEARTBEAT_SWEEP,
            Value::Object(serde_json::Map::new()),
            self.config.action_heartbeat.interval as i64,
        )
        .with_key("action-heartbeat-sweep");

        self.scheduler
            .schedule(job)
            .await
            .map_err(|e| match e {
                crate::scheduler::SchedulerError::Store(s) => EngineError::Store(s),
            })
    }

    // =========================================================================
    // Read helpers
    // =========================================================================

    pub async fn workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut tx = self.store.begin(true).await?;
        let wf_ex = tx.get_workflow_execution(id).await?;
        tx.commit().await?;
        Ok(wf_ex)
    }

    pub async fn task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, EngineError> {
        let mut tx = self.store.begin(true).await?;
        let tasks = tx.get_task_executions(workflow_execution_id).await?;
        tx.commit().await?;
        Ok(tasks)
    }

    pub async fn action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, EngineError> {
        let mut tx = self.store.begin(true).await?;
        let actions = tx.get_action_executions(task_execution_id).await?;
        tx.commit().await?;
        Ok(actions)
    }

    pub async fn sub_workflow_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let mut tx = self.store.begin(true).await?;
        let subs = tx.get_sub_workflow_executions(task_execution_id).await?;
        tx.commit().await?;
        Ok(subs)
    }

    /// Aggregated result of a task: per-iteration outputs in iteration
    /// order for with-items tasks, the single child's output otherwise.
    pub async fn task_result(&self, task_execution_id: Uuid) -> Result<Value, EngineError> {
        let mut tx = self.store.begin(true).await?;
        let task = tx.get_task_execution(task_execution_id).await?;
        let result = self.aggregate_task_result(tx.as_mut(), &task).await?;
        tx.commit().await?;
        Ok(result)
    }
}

/// Populate the scheduled-job dispatch table.
fn register_jobs(registry: &JobRegistry) {
    registry.register(job_names::ON_ACTION_COMPLETE, |engine, args| async move {
        let args: OnActionCompleteArgs = serde_json::from_value(args)?;
        engine
            .on_scheduled_child_complete(args.child_id, args.workflow_child)
            .await
    });

    registry.register(job_names::TASK_RETRY, |engine, args| async move {
        let args: TaskRetryArgs = serde_json::from_value(args)?;
        engine
            .retry_task_iteration(args.task_execution_id, args.index, args.attempt)
            .await
    });

    registry.register(job_names::TASK_CONTINUE, |engine, args| async move {
        let args: TaskContinueArgs = serde_json::from_value(args)?;
        engine.continue_task(args.task_execution_id).await
    });

    registry.register(job_names::TASK_TIMEOUT, |engine, args| async move {
        let args: TaskTimeoutArgs = serde_json::from_value(args)?;
        engine.time_out_action(args.action_execution_id).await
    });

    registry.register(
        job_names::WORKFLOW_START_PLANNED,
        |engine, args| async move {
            let args: StartPlannedArgs = serde_json::from_value(args)?;
            engine.start_planned_workflow(args.workflow_execution_id).await
        },
    );

    registry.register(job_names::INTEGRITY_CHECK, |engine, args| async move {
        let args: IntegrityArgs = serde_json::from_value(args)?;
        engine
            .check_and_fix_integrity(args.workflow_execution_id)
            .await
    });

    registry.register(job_names::HEARTBEAT_SWEEP, |engine, _args| async move {
        engine.sweep_lost_heartbeats().await
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::QueueExecutor;
    use crate::expr::TemplateEvaluator;
    use crate::persistence::MemoryStore;

    #[tokio::test]
    async fn test_all_job_names_registered() {
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(QueueExecutor::new()),
            Arc::new(TemplateEvaluator::new()),
            EngineConfig::default(),
        );

        for name in [
            job_names::ON_ACTION_COMPLETE,
            job_names::TASK_RETRY,
            job_names::TASK_CONTINUE,
            job_names::TASK_TIMEOUT,
            job_names::WORKFLOW_START_PLANNED,
            job_names::INTEGRITY_CHECK,
            job_names::HEARTBEAT_SWEEP,
        ] {
            assert!(
                engine.scheduler().registry().contains(name),
                "{} must be registered",
                name
            );
        }
    }
}
