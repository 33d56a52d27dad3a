//! Workflow catalog entries

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Resources an execution requires from a worker
///
/// Package matching is plain string-set subset; no semver resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResourceRequest {
    /// Minimum advertised memory, in bytes
    #[serde(default)]
    pub memory_bytes: u64,

    /// Minimum advertised CPU shares
    #[serde(default)]
    pub cpu_shares: u32,

    /// Whether a GPU must be present
    #[serde(default)]
    pub gpu: bool,

    /// Packages that must be installed on the worker
    #[serde(default)]
    pub packages: Vec<String>,
}

/// A registered workflow version
///
/// Entries are immutable per `(name, version)`. The `source` holds the
/// uploaded code bytes (or a reference to them); turning it into an
/// executable graph is the source loader collaborator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CatalogEntry {
    pub name: String,
    pub version: u32,
    pub source: String,

    #[serde(default)]
    pub resource_request: ResourceRequest,

    #[serde(default)]
    pub secret_requests: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_storage_kind: Option<String>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, version: u32, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            source: source.into(),
            resource_request: ResourceRequest::default(),
            secret_requests: vec![],
            output_storage_kind: None,
        }
    }

    /// Stable catalog reference used as `Execution::workflow_id`
    pub fn catalog_id(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_id() {
        let entry = CatalogEntry::new("greet", 2, "...");
        assert_eq!(entry.catalog_id(), "greet@v2");
    }

    #[test]
    fn test_resource_request_defaults() {
        let req: ResourceRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.memory_bytes, 0);
        assert_eq!(req.cpu_shares, 0);
        assert!(!req.gpu);
        assert!(req.packages.is_empty());
    }

    #[test]
    fn test_entry_round_trip() {
        let mut entry = CatalogEntry::new("train", 1, "def train(): ...");
        entry.resource_request = ResourceRequest {
            memory_bytes: 1 << 30,
            cpu_shares: 4,
            gpu: true,
            packages: vec!["numpy".to_string()],
        };
        entry.secret_requests = vec!["api_key".to_string()];

        let encoded = serde_json::to_string(&entry).unwrap();
        let parsed: CatalogEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(entry, parsed);
    }
}
