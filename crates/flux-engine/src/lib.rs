//! # Flux durable execution engine
//!
//! The engine turns imperative workflow code into a deterministic,
//! replayable computation:
//!
//! - Every task call computes a [`fingerprint`](fingerprint::fingerprint)
//!   before anything executes. Two calls sharing a fingerprint are the same
//!   logical invocation; the second never runs, it returns the first's
//!   recorded result.
//! - The [`ExecutionContext`] holds the append-only event log of one
//!   execution; each append is durably persisted (or forwarded to the
//!   orchestrator) before the workflow proceeds.
//! - The [`TaskRuntime`] drives a single invocation through
//!   retry/timeout/fallback/rollback/cache semantics, emitting the task
//!   event sub-machine.
//! - The [`Runner`] enters a workflow, fast-forwards through recorded
//!   results with no side effects, and executes the first unrecorded call.
//! - [`LocalExecutor`] embeds the whole loop over an
//!   [`ExecutionStore`](flux_storage::ExecutionStore) for tests and
//!   single-process runs; the distributed worker reuses the same [`Runner`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Runner                           │
//! │   (enters workflow code, classifies the drive outcome)   │
//! └──────────────────────────────────────────────────────────┘
//!                │ WorkflowContext::task / pause / parallel
//!                ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                       TaskRuntime                        │
//! │  (fingerprint lookup, attempts, fallback, rollback)      │
//! └──────────────────────────────────────────────────────────┘
//!                │ append / task_record
//!                ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ExecutionContext                      │
//! │     (single appender; EventSink persists in order)       │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod builtins;
pub mod context;
pub mod executor;
pub mod fingerprint;
pub mod output;
pub mod registry;
pub mod runner;
pub mod secrets;
pub mod task_runtime;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::builtins::register_builtins;
    pub use crate::context::{EventSink, ExecutionContext, StoreSink, TaskRecord};
    pub use crate::executor::LocalExecutor;
    pub use crate::fingerprint::{cache_key, canonical_json, fingerprint};
    pub use crate::output::{MemoryOutputStore, OutputStore};
    pub use crate::registry::{TaskRegistry, WorkflowRegistry};
    pub use crate::runner::{DriveOutcome, Runner};
    pub use crate::secrets::{SecretSource, StaticSecrets};
    pub use crate::task_runtime::{MemoryTaskCache, TaskCache, TaskRuntime};
    pub use crate::workflow::{FnTask, Task, TaskContext, Workflow, WorkflowContext};
    pub use flux_core::{
        Event, EventKind, FlowError, Interrupt, TaskError, TaskErrorKind, TaskOptions,
    };
}

pub use builtins::register_builtins;
pub use context::{EventSink, ExecutionContext, StoreSink, TaskRecord};
pub use executor::LocalExecutor;
pub use fingerprint::{cache_key, canonical_json, fingerprint};
pub use output::{MemoryOutputStore, OutputStore};
pub use registry::{TaskRegistry, WorkflowRegistry};
pub use runner::{DriveOutcome, Runner};
pub use secrets::{SecretSource, StaticSecrets};
pub use task_runtime::{MemoryTaskCache, StoreCache, TaskCache, TaskRuntime};
pub use workflow::{FnTask, Task, TaskContext, Workflow, WorkflowContext};
