//! Secret resolution seam
//!
//! The secrets store is a collaborator: a key→value oracle with a
//! `request(names) -> map` contract. Encryption and rotation live behind
//! the collaborator; the engine only injects resolved values into task
//! contexts at call time.

use std::collections::HashMap;

use async_trait::async_trait;

use flux_core::TaskError;

/// Resolves secret names to values at task call time
#[async_trait]
pub trait SecretSource: Send + Sync + 'static {
    async fn request(&self, names: &[String]) -> Result<HashMap<String, String>, TaskError>;
}

/// Fixed-map SecretSource for tests and embedded runs
#[derive(Debug, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Empty source; any request for a name fails
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretSource for StaticSecrets {
    async fn request(&self, names: &[String]) -> Result<HashMap<String, String>, TaskError> {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            let value = self
                .values
                .get(name)
                .ok_or_else(|| TaskError::non_retryable(format!("unknown secret: {name}")))?;
            resolved.insert(name.clone(), value.clone());
        }
        Ok(resolved)
    }
}
