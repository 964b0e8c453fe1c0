//! Action dispatch callbacks and heartbeat tracking.
//!
//! Completions arrive from the executor at least once; applying one is
//! idempotent (a completed action execution absorbs repeats without side
//! effects). Follow-up task evaluation is never done inline: it goes
//! through the post-commit queue and the scheduler, so a crash after the
//! commit loses at most a nudge the integrity monitor re-injects.

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{job_names, Command, Engine};
use crate::error::EngineError;
use crate::executor::ActionResult;
use crate::persistence::{retry_on_db_error, ScheduledJob, StoreError, StoreTx};
use crate::spec::TaskType;
use crate::state::State;

impl Engine {
    /// Apply an action result reported by the executor.
    ///
    /// Calling this twice for the same action yields the same final state
    /// as calling it once.
    #[instrument(skip(self, result))]
    pub async fn on_action_complete(
        &self,
        action_execution_id: Uuid,
        result: ActionResult,
    ) -> Result<(), EngineError> {
        let outcome = retry_on_db_error(|| {
            let result = result.clone();
            async move {
                let (mut tx, mut queue) = self.begin().await?;

                let applied = self
                    .apply_action_result(tx.as_mut(), &mut queue, action_execution_id, &result)
                    .await;

                match applied {
                    Ok(()) => self.finish(tx, queue).await,
                    Err(e) => {
                        self.abort(tx).await;
                        Err(e)
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e @ EngineError::Store(StoreError::NotFound { .. })) => Err(e),
            Err(e) => {
                // Completion itself failed (e.g. the output breached a size
                // limit): fail the action with the diagnostic and take the
                // task down through the regular error routing.
                let msg = format!(
                    "Failed to complete action [error={}, action_execution_id={}]",
                    e, action_execution_id
                );
                error!("{}", msg);
                self.fail_action(action_execution_id, &msg).await?;
                Ok(())
            }
        }
    }

    async fn apply_action_result(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut crate::engine::PostCommitQueue,
        action_execution_id: Uuid,
        result: &ActionResult,
    ) -> Result<(), EngineError> {
        let mut action = tx.get_action_execution(action_execution_id).await?;

        if action.state.is_completed() {
            return Ok(());
        }

        tx.lock_task_execution(action.task_execution_id).await?;
        let task = tx.get_task_execution(action.task_execution_id).await?;

        action.state = if result.cancelled {
            State::Cancelled
        } else if result.error.is_some() {
            State::Error
        } else {
            State::Success
        };
        action.output = Some(result.output.clone());
        action.state_info = result.error.clone();
        action.accepted = true;
        action.touch();
        tx.update_action_execution(&action).await?;

        info!(
            action = %action.name,
            action_execution_id = %action.id,
            state = %action.state,
            "action completed"
        );

        // A timed-out synchronous plain action is finished by the timeout
        // job, which schedules the task evaluation itself.
        let timeout_owns_completion = result.timed_out
            && task.task_type == TaskType::Action
            && task.spec.with_items.is_none()
            && action.is_sync;

        if !timeout_owns_completion {
            queue.push(Command::ScheduleOnActionComplete {
                child_id: action.id,
                workflow_child: false,
            });
        }

        Ok(())
    }

    /// Update a running action's state without completing it.
    ///
    /// Failures do not fail the action; they are logged and re-raised to
    /// the caller.
    #[instrument(skip(self))]
    pub async fn on_action_update(
        &self,
        action_execution_id: Uuid,
        state: State,
    ) -> Result<(), EngineError> {
        let result = retry_on_db_error(|| async move {
            let mut tx = self.store().begin(false).await?;

            let applied = async {
                let mut action = tx.get_action_execution(action_execution_id).await?;

                if !action.state.can_transition(state) {
                    return Err(EngineError::InvalidState(format!(
                        "action {} cannot move from {} to {}",
                        action.id, action.state, state
                    )));
                }

                action.state = state;
                action.touch();
                tx.update_action_execution(&action).await?;
                Ok(())
            }
            .await;

            match applied {
                Ok(()) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            }
        })
        .await;

        if let Err(e) = &result {
            error!(
                %action_execution_id,
                "failed to update action state: {}", e
            );
        }

        result
    }

    /// Refresh an action's heartbeat timestamp.
    pub async fn report_heartbeat(&self, action_execution_id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.store().begin(false).await?;
        let mut action = tx.get_action_execution(action_execution_id).await?;

        if !action.state.is_completed() {
            action.last_heartbeat = Utc::now();
            action.touch();
            tx.update_action_execution(&action).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Scheduled deadline for a dispatched action (`task.timeout` job).
    ///
    /// Owns the whole timeout path: fails the action if it is still
    /// running and always schedules the task evaluation; a timed-out
    /// result reported by the executor deliberately skips that scheduling
    /// and leaves it to this job.
    pub(crate) async fn time_out_action(
        &self,
        action_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let applied = async {
                let action = match tx.get_action_execution(action_execution_id).await {
                    Ok(a) => a,
                    Err(StoreError::NotFound { .. }) => return Ok(false),
                    Err(e) => return Err(EngineError::from(e)),
                };

                tx.lock_task_execution(action.task_execution_id).await?;
                let mut action = tx.get_action_execution(action_execution_id).await?;

                if !action.state.is_completed() {
                    action.state = State::Error;
                    action.state_info = Some("Action timed out: deadline exceeded".to_string());
                    action.accepted = true;
                    action.touch();
                    tx.update_action_execution(&action).await?;
                }

                queue.push(Command::ScheduleOnActionComplete {
                    child_id: action.id,
                    workflow_child: false,
                });
                Ok(true)
            }
            .await;

            match applied {
                Ok(_) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Mark an action the executor refused as failed.
    pub(crate) async fn fail_rejected_action(&self, action_execution_id: Uuid, msg: &str) {
        if let Err(e) = self.fail_action(action_execution_id, msg).await {
            error!(%action_execution_id, "failed to record executor rejection: {}", e);
        }
    }

    /// Fail an incomplete action and schedule the task evaluation.
    async fn fail_action(
        &self,
        action_execution_id: Uuid,
        msg: &str,
    ) -> Result<(), EngineError> {
        retry_on_db_error(|| async move {
            let (mut tx, mut queue) = self.begin().await?;

            let applied = async {
                let action = match tx.get_action_execution(action_execution_id).await {
                    Ok(a) => a,
                    Err(StoreError::NotFound { .. }) => return Ok(()),
                    Err(e) => return Err(EngineError::from(e)),
                };
                if action.state.is_completed() {
                    return Ok(());
                }

                tx.lock_task_execution(action.task_execution_id).await?;

                let mut action = tx.get_action_execution(action_execution_id).await?;
                action.state = State::Error;
                action.state_info = Some(msg.to_string());
                action.accepted = true;
                action.touch();
                tx.update_action_execution(&action).await?;

                queue.push(Command::ScheduleOnActionComplete {
                    child_id: action.id,
                    workflow_child: false,
                });
                Ok(())
            }
            .await;

            match applied {
                Ok(()) => self.finish(tx, queue).await,
                Err(e) => {
                    self.abort(tx).await;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Periodic sweep declaring silent actions lost
    /// (`action.heartbeat_sweep` job, self-rescheduling).
    pub(crate) async fn sweep_lost_heartbeats(&self) -> Result<(), EngineError> {
        let heartbeat = &self.config().action_heartbeat;
        if !heartbeat.enabled() {
            return Ok(());
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(heartbeat.max_silence()).unwrap_or_default();

        let (mut tx, mut queue) = self.begin().await?;

        let result = async {
            let expired = tx.get_expired_heartbeat_actions(cutoff, 100).await?;

            for stale in &expired {
                if tx.lock_task_execution(stale.task_execution_id).await.is_err() {
                    continue;
                }

                let mut action = tx.get_action_execution(stale.id).await?;
                if action.state.is_completed() {
                    continue;
                }

                warn!(
                    action_execution_id = %action.id,
                    action = %action.name,
                    "action heartbeat lost, failing it"
                );

                action.state = State::Error;
                action.state_info = Some("action heartbeat lost".to_string());
                action.accepted = true;
                action.touch();
                tx.update_action_execution(&action).await?;

                queue.push(Command::ScheduleOnActionComplete {
                    child_id: action.id,
                    workflow_child: false,
                });
            }

            Ok::<(), EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                // Keep the sweep alive.
                let job = ScheduledJob::new(
                    job_names::HEARTBEAT_SWEEP,
                    serde_json::Value::Object(serde_json::Map::new()),
                    heartbeat.interval as i64,
                )
                .with_key("action-heartbeat-sweep");
                queue.push(Command::ScheduleJob { job });

                self.finish(tx, queue).await
            }
            Err(e) => {
                self.abort(tx).await;
                Err(e)
            }
        }
    }

    /// Queue interrupts for every incomplete action of a task.
    pub(crate) async fn cancel_incomplete_actions(
        &self,
        tx: &mut dyn StoreTx,
        queue: &mut crate::engine::PostCommitQueue,
        task_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        for action in tx.get_action_executions(task_execution_id).await? {
            if !action.state.is_completed() {
                queue.push(Command::InterruptAction {
                    action_execution_id: action.id,
                });
            }
        }
        Ok(())
    }
}
