//! Output storage seam
//!
//! Results too large to inline are written to external storage; the event
//! records a reference instead of the value. The replay path dereferences
//! transparently, so workflow code never sees the indirection.

use async_trait::async_trait;
use dashmap::DashMap;

use flux_core::TaskError;

/// Marker key for stored-output references in event payloads
pub const OUTPUT_REF_KEY: &str = "$output_ref";

/// Blob storage for task results
#[async_trait]
pub trait OutputStore: Send + Sync + 'static {
    /// Store a value, returning an opaque reference
    async fn put(&self, task_id: &str, value: &serde_json::Value) -> Result<String, TaskError>;

    /// Fetch a previously stored value
    async fn get(&self, reference: &str) -> Result<serde_json::Value, TaskError>;
}

/// Wrap a reference in the event payload shape
pub fn make_ref(reference: String) -> serde_json::Value {
    serde_json::json!({ OUTPUT_REF_KEY: reference })
}

/// Extract the reference from an event payload, if it is one
pub fn as_ref(value: &serde_json::Value) -> Option<&str> {
    value.get(OUTPUT_REF_KEY).and_then(|v| v.as_str())
}

/// In-memory OutputStore
#[derive(Debug, Default)]
pub struct MemoryOutputStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl OutputStore for MemoryOutputStore {
    async fn put(&self, task_id: &str, value: &serde_json::Value) -> Result<String, TaskError> {
        let reference = format!("mem:{task_id}");
        self.entries.insert(reference.clone(), value.clone());
        Ok(reference)
    }

    async fn get(&self, reference: &str) -> Result<serde_json::Value, TaskError> {
        self.entries
            .get(reference)
            .map(|v| v.clone())
            .ok_or_else(|| TaskError::fatal(format!("missing stored output: {reference}")))
    }
}
