//! # Millstream Engine
//!
//! The persistent core of a workflow orchestration engine: a crash-safe
//! runtime executing DAG-like workflows of tasks, where each task invokes
//! an action, a sub-workflow, or iterates over a collection (with-items).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  (workflow / task / action handlers, integrity monitor)     │
//! └─────────────────────────────────────────────────────────────┘
//!         │                    │                     │
//!         ▼                    ▼                     ▼
//! ┌───────────────┐   ┌────────────────┐   ┌─────────────────┐
//! │     Store     │   │   Scheduler    │   │ ActionExecutor  │
//! │ (Postgres or  │   │ (scheduled_jobs│   │   (external)    │
//! │  in-memory)   │   │  + registry)   │   │                 │
//! └───────────────┘   └────────────────┘   └─────────────────┘
//! ```
//!
//! Multiple identical engine processes can share one database: all
//! coordination happens through row locks, unique constraints, the
//! named-lock table and `SKIP LOCKED` job claiming. Side effects produced
//! inside a transaction (action dispatch, follow-up scheduling) are
//! buffered in a post-commit queue and only run once the transaction
//! committed; completion paths are idempotent and the integrity monitor
//! rescues executions whose follow-up work was lost.
//!
//! ## Example
//!
//! ```ignore
//! use millstream_engine::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = Engine::new(
//!     store,
//!     Arc::new(QueueExecutor::new()),
//!     Arc::new(TemplateEvaluator::new()),
//!     EngineConfig::default(),
//! );
//! let handle = engine.start().await?;
//!
//! let wf_ex = engine
//!     .start_workflow("my_workflow", "", json!({"name": "John"}), "", Default::default())
//!     .await?;
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod persistence;
pub mod scheduler;
pub mod spec;
pub mod state;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{EngineConfig, HeartbeatConfig, SchedulerConfig};
    pub use crate::controller::{controller_for, TaskSelection, WorkflowController};
    pub use crate::engine::{Engine, EngineHandle};
    pub use crate::error::EngineError;
    pub use crate::executor::{ActionDispatch, ActionExecutor, ActionResult, QueueExecutor};
    pub use crate::expr::{Evaluator, ExprError, TemplateEvaluator};
    pub use crate::persistence::{
        ExecutionParams, MemoryStore, PostgresStore, Store, StoreError, WorkflowDefinition,
    };
    pub use crate::spec::{TaskSpec, WorkflowSpec, WorkflowType};
    pub use crate::state::State;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
pub use executor::{ActionExecutor, ActionResult, QueueExecutor};
pub use expr::{Evaluator, TemplateEvaluator};
pub use persistence::{MemoryStore, PostgresStore, Store};
pub use state::State;
