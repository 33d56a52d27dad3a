//! Worker registry types and claims

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::catalog::ResourceRequest;

/// Connection state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unknown,
    Online,
    Offline,
}

/// Resources a worker advertises at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WorkerResources {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub gpu: bool,
    pub packages: Vec<String>,
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            memory_bytes: 4 << 30,
            cpu_shares: 2,
            gpu: false,
            packages: vec![],
        }
    }
}

impl WorkerResources {
    /// Whether this worker satisfies a resource request
    ///
    /// All conditions must hold: memory, CPU, GPU presence when required,
    /// and requested packages ⊆ installed packages.
    pub fn satisfies(&self, request: &ResourceRequest) -> bool {
        if self.memory_bytes < request.memory_bytes {
            return false;
        }
        if self.cpu_shares < request.cpu_shares {
            return false;
        }
        if request.gpu && !self.gpu {
            return false;
        }
        request
            .packages
            .iter()
            .all(|pkg| self.packages.iter().any(|have| have == pkg))
    }
}

/// A registered worker
///
/// `name` is stable across reconnects; `session_id` is fresh per connect.
/// Only online workers are eligible for claims; a worker going offline
/// releases every claim it held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkerInfo {
    pub name: String,
    pub session_id: Uuid,
    pub resources: WorkerResources,
    pub registered_workflows: Vec<String>,
    pub state: WorkerState,
    pub last_seen: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, resources: WorkerResources) -> Self {
        Self {
            name: name.into(),
            session_id: Uuid::now_v7(),
            resources,
            registered_workflows: vec![],
            state: WorkerState::Online,
            last_seen: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == WorkerState::Online
    }

    /// Whether this worker is eligible to run `workflow_name` with `request`
    pub fn can_run(&self, workflow_name: &str, request: &ResourceRequest) -> bool {
        self.is_online()
            && self
                .registered_workflows
                .iter()
                .any(|name| name == workflow_name)
            && self.resources.satisfies(request)
    }
}

/// Exclusive binding of one execution to one worker session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub execution_id: Uuid,
    pub worker_name: String,
    pub session_id: Uuid,
    pub claimed_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(execution_id: Uuid, worker_name: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            execution_id,
            worker_name: worker_name.into(),
            session_id,
            claimed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(memory_gb: u64, cpu: u32, gpu: bool, packages: &[&str]) -> WorkerResources {
        WorkerResources {
            memory_bytes: memory_gb << 30,
            cpu_shares: cpu,
            gpu,
            packages: packages.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_satisfies_memory_and_cpu() {
        let worker = resources(8, 4, false, &[]);

        let mut req = ResourceRequest::default();
        req.memory_bytes = 4 << 30;
        req.cpu_shares = 2;
        assert!(worker.satisfies(&req));

        req.memory_bytes = 16 << 30;
        assert!(!worker.satisfies(&req));
    }

    #[test]
    fn test_satisfies_gpu() {
        let without_gpu = resources(8, 4, false, &[]);
        let with_gpu = resources(8, 4, true, &[]);

        let mut req = ResourceRequest::default();
        req.gpu = true;
        assert!(!without_gpu.satisfies(&req));
        assert!(with_gpu.satisfies(&req));
    }

    #[test]
    fn test_satisfies_package_subset() {
        let worker = resources(8, 4, false, &["numpy", "pandas", "torch"]);

        let mut req = ResourceRequest::default();
        req.packages = vec!["numpy".to_string(), "torch".to_string()];
        assert!(worker.satisfies(&req));

        req.packages.push("scipy".to_string());
        assert!(!worker.satisfies(&req));
    }

    #[test]
    fn test_can_run_requires_registration_and_online() {
        let mut worker = WorkerInfo::new("w1", resources(8, 4, false, &[]));
        worker.registered_workflows = vec!["greet".to_string()];

        let req = ResourceRequest::default();
        assert!(worker.can_run("greet", &req));
        assert!(!worker.can_run("train", &req));

        worker.state = WorkerState::Offline;
        assert!(!worker.can_run("greet", &req));
    }
}
