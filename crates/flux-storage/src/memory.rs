//! In-memory implementation of ExecutionStore
//!
//! Full semantics of the PostgreSQL backend with no I/O. Used by tests and
//! embedded single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use flux_core::{
    CatalogEntry, Claim, Event, Execution, ExecutionFilter, ExecutionState, WorkerInfo,
    WorkerState,
};

use super::store::{ExecutionStore, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ExecutionRecord {
    execution: Execution,
    events: Vec<Event>,
}

/// In-memory ExecutionStore
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    catalog: RwLock<HashMap<(String, u32), CatalogEntry>>,
    workers: RwLock<HashMap<String, WorkerInfo>>,
    claims: RwLock<HashMap<Uuid, Claim>>,
    last_claims: RwLock<HashMap<String, DateTime<Utc>>>,
    cache: RwLock<HashMap<String, serde_json::Value>>,
    event_channels: DashMap<Uuid, broadcast::Sender<Event>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            last_claims: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            event_channels: DashMap::new(),
        }
    }

    /// Number of stored executions
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Number of active claims
    pub fn claim_count(&self) -> usize {
        self.claims.read().len()
    }

    fn channel(&self, execution_id: Uuid) -> broadcast::Sender<Event> {
        self.event_channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, execution_id: Uuid, event: &Event) {
        if let Some(tx) = self.event_channels.get(&execution_id) {
            // Lagging/absent receivers are fine
            let _ = tx.send(event.clone());
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        executions.insert(
            execution.id,
            ExecutionRecord {
                execution: execution.clone(),
                events: vec![],
            },
        );
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let executions = self.executions.read();
        executions
            .get(&id)
            .map(|r| r.execution.clone())
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        let mut matched: Vec<Execution> = executions
            .values()
            .map(|r| &r.execution)
            .filter(|e| {
                filter
                    .workflow_name
                    .as_ref()
                    .map_or(true, |name| &e.workflow_name == name)
                    && filter.state.map_or(true, |state| e.state == state)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.created_at);
        Ok(matched)
    }

    async fn set_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !record.execution.state.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                from: record.execution.state,
                to: state,
            });
        }

        record.execution.state = state;
        record.execution.updated_at = Utc::now();
        Ok(())
    }

    async fn set_current_worker(
        &self,
        id: Uuid,
        worker: Option<String>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        record.execution.current_worker = worker;
        record.execution.updated_at = Utc::now();
        Ok(())
    }

    async fn append_event(&self, execution_id: Uuid, mut event: Event) -> Result<i64, StoreError> {
        let seq = {
            let mut executions = self.executions.write();
            let record = executions
                .get_mut(&execution_id)
                .ok_or(StoreError::ExecutionNotFound(execution_id))?;

            if record.execution.state.is_terminal() {
                return Err(StoreError::TerminalExecution(execution_id));
            }

            let seq = record.events.len() as i64;
            event.seq = seq;
            record.events.push(event.clone());
            seq
        };

        self.publish(execution_id, &event);
        Ok(seq)
    }

    async fn load_events(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let executions = self.executions.read();
        executions
            .get(&execution_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn subscribe_events(
        &self,
        execution_id: Uuid,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        if !self.executions.read().contains_key(&execution_id) {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(self.channel(execution_id).subscribe())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        state: ExecutionState,
        output: Option<serde_json::Value>,
        mut final_event: Event,
    ) -> Result<(), StoreError> {
        let event = {
            let mut executions = self.executions.write();
            let record = executions
                .get_mut(&id)
                .ok_or(StoreError::ExecutionNotFound(id))?;

            if record.execution.state.is_terminal() {
                return Err(StoreError::TerminalExecution(id));
            }
            if !record.execution.state.can_transition_to(state) {
                return Err(StoreError::InvalidTransition {
                    from: record.execution.state,
                    to: state,
                });
            }

            final_event.seq = record.events.len() as i64;
            record.events.push(final_event.clone());
            record.execution.state = state;
            if output.is_some() {
                record.execution.output = output;
            }
            record.execution.updated_at = Utc::now();
            final_event
        };

        self.publish(id, &event);
        Ok(())
    }

    async fn put_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        let mut catalog = self.catalog.write();
        let key = (entry.name.clone(), entry.version);
        if catalog.contains_key(&key) {
            return Err(StoreError::CatalogConflict {
                name: entry.name.clone(),
                version: entry.version,
            });
        }
        catalog.insert(key, entry.clone());
        Ok(())
    }

    async fn get_catalog_entry(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<CatalogEntry, StoreError> {
        let catalog = self.catalog.read();
        match version {
            Some(version) => catalog
                .get(&(name.to_string(), version))
                .cloned()
                .ok_or_else(|| StoreError::WorkflowNotFound(format!("{name}@v{version}"))),
            None => catalog
                .iter()
                .filter(|((entry_name, _), _)| entry_name == name)
                .max_by_key(|((_, version), _)| *version)
                .map(|(_, entry)| entry.clone())
                .ok_or_else(|| StoreError::WorkflowNotFound(name.to_string())),
        }
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let catalog = self.catalog.read();
        let mut entries: Vec<CatalogEntry> = catalog.values().cloned().collect();
        entries.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        Ok(entries)
    }

    async fn upsert_worker(&self, worker: &WorkerInfo) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        workers.insert(worker.name.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, name: &str) -> Result<WorkerInfo, StoreError> {
        let workers = self.workers.read();
        workers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))
    }

    async fn list_workers(&self, online_only: bool) -> Result<Vec<WorkerInfo>, StoreError> {
        let workers = self.workers.read();
        let mut matched: Vec<WorkerInfo> = workers
            .values()
            .filter(|w| !online_only || w.is_online())
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }

    async fn touch_worker(&self, name: &str) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(name)
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;
        worker.last_seen = Utc::now();
        Ok(())
    }

    async fn mark_worker_offline(&self, name: &str) -> Result<(), StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(name)
            .ok_or_else(|| StoreError::WorkerNotFound(name.to_string()))?;
        worker.state = WorkerState::Offline;
        Ok(())
    }

    async fn try_claim(&self, claim: &Claim) -> Result<bool, StoreError> {
        let mut claims = self.claims.write();
        if claims.contains_key(&claim.execution_id) {
            return Ok(false);
        }
        claims.insert(claim.execution_id, claim.clone());
        self.last_claims
            .write()
            .insert(claim.worker_name.clone(), claim.claimed_at);
        Ok(true)
    }

    async fn get_claim(&self, execution_id: Uuid) -> Result<Option<Claim>, StoreError> {
        Ok(self.claims.read().get(&execution_id).cloned())
    }

    async fn release_claim(&self, execution_id: Uuid) -> Result<(), StoreError> {
        self.claims.write().remove(&execution_id);
        Ok(())
    }

    async fn release_session_claims(&self, session_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut claims = self.claims.write();
        let released: Vec<Uuid> = claims
            .iter()
            .filter(|(_, c)| c.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &released {
            claims.remove(id);
        }
        Ok(released)
    }

    async fn count_active_claims(&self, worker_name: &str) -> Result<usize, StoreError> {
        Ok(self
            .claims
            .read()
            .values()
            .filter(|c| c.worker_name == worker_name)
            .count())
    }

    async fn last_claim_at(
        &self,
        worker_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.last_claims.read().get(worker_name).copied())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.cache.read().get(key).cloned())
    }

    async fn cache_put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.cache.write().insert(key.to_string(), value.clone());
        Ok(())
    }
}
