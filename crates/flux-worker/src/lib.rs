//! # Flux worker runtime
//!
//! A worker holds one logical session with the orchestrator:
//!
//! - downstream, it consumes [`ServerFrame`](flux_core::ServerFrame)s from
//!   the connect stream (execution requests, cancels, shutdown)
//! - upstream, it posts [`WorkerFrame`](flux_core::WorkerFrame)s
//!   (registration, events in append order, claim acks/releases,
//!   heartbeats)
//!
//! Each claimed execution gets exactly one driver task; the driver replays
//! the historical event prefix through the engine [`Runner`], executes new
//! work, and forwards every append to the server before the workflow
//! proceeds. Cancellation is cooperative and observed at task boundaries;
//! process shutdown releases claims so the server re-dispatches.
//!
//! Workflow and task registries are built by the embedding application at
//! startup and are read-only while the worker runs.

pub mod client;
pub mod driver;
pub mod runtime;

pub use client::{ServerClient, WorkerClientError};
pub use runtime::WorkerRuntime;
