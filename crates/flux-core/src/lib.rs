//! # Flux core types
//!
//! Shared vocabulary for the Flux durable workflow engine:
//!
//! - [`Event`] and the [`EventKind`] taxonomy: the append-only record of
//!   everything an execution observes
//! - [`Execution`] and its [`ExecutionState`] machine
//! - [`TaskError`] / [`FlowError`]: the error shapes that flow through the
//!   task runtime and the replay engine
//! - [`TaskOptions`]: retry/timeout/fallback/rollback/cache configuration
//! - [`CatalogEntry`] and [`ResourceRequest`]: the workflow catalog
//! - [`WorkerInfo`] and [`Claim`]: the worker registry
//! - [`WorkerFrame`] / [`ServerFrame`]: the wire protocol between workers
//!   and the orchestrator
//!
//! Everything here is plain data: no I/O, no runtime. The engine, storage,
//! server, and worker crates all build on this vocabulary.

pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod options;
pub mod protocol;
pub mod telemetry;
pub mod worker;

pub use catalog::{CatalogEntry, ResourceRequest};
pub use config::{LogConfig, LogFormat, ServerConfig, WorkerConfig};
pub use error::{FlowError, Interrupt, TaskError, TaskErrorKind};
pub use event::{Event, EventKind, SourceType};
pub use execution::{Execution, ExecutionFilter, ExecutionState};
pub use options::TaskOptions;
pub use protocol::{ExecutionAssignment, ServerFrame, WorkerFrame};
pub use worker::{Claim, WorkerInfo, WorkerResources, WorkerState};
