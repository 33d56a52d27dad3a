//! Shared application state

use std::sync::Arc;

use tokio::sync::Semaphore;

use flux_core::ServerConfig;
use flux_storage::ExecutionStore;

use crate::hub::WorkerHub;
use crate::scheduler::Scheduler;
use crate::secrets::{MemorySecrets, SecretsStore};

/// State shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn ExecutionStore>,
    pub scheduler: Arc<Scheduler>,
    pub hub: Arc<WorkerHub>,
    pub secrets: Arc<dyn SecretsStore>,

    /// Bounds concurrently waiting sync-mode requests
    pub sync_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Arc<dyn ExecutionStore>) -> Self {
        let hub = Arc::new(WorkerHub::new());
        let scheduler = Scheduler::new(store.clone(), hub.clone(), config.clone());
        let sync_slots = Arc::new(Semaphore::new(config.executors_pool_size));

        Self {
            config,
            store,
            scheduler,
            hub,
            secrets: Arc::new(MemorySecrets::new()),
            sync_slots,
        }
    }
}
