//! Secrets collaborator
//!
//! A key→value oracle behind the server API. Encryption at rest is the
//! collaborator's responsibility and out of scope here; this reference
//! implementation keeps values in memory.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;

/// Server-side secrets store
#[async_trait]
pub trait SecretsStore: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Option<String>;
    async fn put(&self, name: &str, value: &str);
    async fn list(&self) -> Vec<String>;
    async fn remove(&self, name: &str) -> bool;

    /// Replace the value; a random one is generated when none is supplied.
    /// Returns the new value, or None for unknown names.
    async fn rotate(&self, name: &str, new_value: Option<String>) -> Option<String>;
}

/// In-memory SecretsStore
#[derive(Debug, Default)]
pub struct MemorySecrets {
    values: DashMap<String, String>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }
}

fn random_value() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl SecretsStore for MemorySecrets {
    async fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| v.clone())
    }

    async fn put(&self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    async fn remove(&self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    async fn rotate(&self, name: &str, new_value: Option<String>) -> Option<String> {
        if !self.values.contains_key(name) {
            return None;
        }
        let value = new_value.unwrap_or_else(random_value);
        self.values.insert(name.to_string(), value.clone());
        Some(value)
    }
}
