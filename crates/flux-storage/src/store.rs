//! ExecutionStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use flux_core::{
    CatalogEntry, Claim, Event, Execution, ExecutionFilter, ExecutionState, WorkerInfo,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow not found in catalog: {0}")]
    WorkflowNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// Catalog entries are immutable per version
    #[error("catalog entry {name}@v{version} already exists")]
    CatalogConflict { name: String, version: u32 },

    /// State machine violation
    #[error("illegal state transition: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    /// Append attempted on a finished execution
    #[error("execution {0} is in a terminal state")]
    TerminalExecution(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Store for executions, events, catalog, workers, claims, and the task cache
///
/// Implementations must be thread-safe. Event appends are atomic and
/// ordered; `seq` is assigned by the store and is strictly increasing per
/// execution with no gaps.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Persist a new execution record
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, StoreError>;

    /// Transition the execution's state, validating against the state machine
    async fn set_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<(), StoreError>;

    /// Record which worker holds (or released) the claim
    async fn set_current_worker(
        &self,
        id: Uuid,
        worker: Option<String>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append one event, assigning the next sequence number
    ///
    /// Rejected once the execution is terminal (terminal finality).
    async fn append_event(&self, execution_id: Uuid, event: Event) -> Result<i64, StoreError>;

    /// Load the ordered event log
    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Subscribe to the live tail of an execution's log
    ///
    /// Receivers see every event appended after the call; the historical
    /// prefix comes from [`load_events`](Self::load_events).
    async fn subscribe_events(
        &self,
        execution_id: Uuid,
    ) -> Result<broadcast::Receiver<Event>, StoreError>;

    /// Atomically append a final/pause event and update the state + output
    ///
    /// Required so a crash after the append but before the state update is
    /// impossible to observe.
    async fn finish_execution(
        &self,
        id: Uuid,
        state: ExecutionState,
        output: Option<serde_json::Value>,
        final_event: Event,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Store a catalog entry; immutable per `(name, version)`
    async fn put_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError>;

    /// Fetch an entry by name, latest version when `version` is None
    async fn get_catalog_entry(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<CatalogEntry, StoreError>;

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    // =========================================================================
    // Workers
    // =========================================================================

    /// Insert or update a worker registration (keyed by stable name)
    async fn upsert_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError>;

    async fn get_worker(&self, name: &str) -> Result<WorkerInfo, StoreError>;

    async fn list_workers(&self, online_only: bool) -> Result<Vec<WorkerInfo>, StoreError>;

    /// Update `last_seen` after any frame from the worker
    async fn touch_worker(&self, name: &str) -> Result<(), StoreError>;

    async fn mark_worker_offline(&self, name: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Claims
    // =========================================================================

    /// Optimistic claim insert; false when a claim already exists
    async fn try_claim(&self, claim: &Claim) -> Result<bool, StoreError>;

    async fn get_claim(&self, execution_id: Uuid) -> Result<Option<Claim>, StoreError>;

    async fn release_claim(&self, execution_id: Uuid) -> Result<(), StoreError>;

    /// Release every claim held by a worker session, returning the affected
    /// execution ids
    async fn release_session_claims(&self, session_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Active claim count per worker (scheduler tie-breaking)
    async fn count_active_claims(&self, worker_name: &str) -> Result<usize, StoreError>;

    /// When the worker last received a claim (scheduler tie-breaking)
    async fn last_claim_at(&self, worker_name: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    // =========================================================================
    // Task cache
    // =========================================================================

    /// Cached result for a deterministic task, keyed by `(name, args hash)`
    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn cache_put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;
}
