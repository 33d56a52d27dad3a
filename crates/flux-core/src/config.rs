//! Process configuration
//!
//! Binaries load configuration from `FLUX_`-prefixed environment variables
//! (after `dotenvy` has run). Every option has a sensible default so a bare
//! `flux start server` works out of the box.

use std::time::Duration;

use crate::worker::WorkerResources;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Bound on concurrently driven sync-mode requests
    pub executors_pool_size: usize,

    /// A worker silent for this long is marked offline and its claims are
    /// released
    pub worker_liveness: Duration,

    /// Interval between dispatch retries for unmatched executions
    pub retry_dispatch: Duration,

    /// Dispatch rounds an execution may go unmatched before a warning is
    /// logged; it stays scheduled either way
    pub unmatched_warn_rounds: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9400,
            executors_pool_size: 64,
            worker_liveness: Duration::from_secs(15),
            retry_dispatch: Duration::from_secs(2),
            unmatched_warn_rounds: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_var("FLUX_HOST").unwrap_or(defaults.host),
            port: env_parse("FLUX_PORT", defaults.port),
            executors_pool_size: env_parse(
                "FLUX_EXECUTORS_POOL_SIZE",
                defaults.executors_pool_size,
            ),
            worker_liveness: Duration::from_secs(env_parse(
                "FLUX_WORKER_LIVENESS_SECONDS",
                defaults.worker_liveness.as_secs(),
            )),
            retry_dispatch: Duration::from_secs(env_parse(
                "FLUX_RETRY_DISPATCH_SECONDS",
                defaults.retry_dispatch.as_secs(),
            )),
            unmatched_warn_rounds: env_parse(
                "FLUX_UNMATCHED_WARN_ROUNDS",
                defaults.unmatched_warn_rounds,
            ),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,

    /// Opaque token presented at registration
    pub bootstrap_token: Option<String>,

    /// Stable worker name (survives reconnects)
    pub name: String,

    /// Maximum concurrently driven executions
    pub concurrency: usize,

    /// Advertised resources; env overrides replace the defaults
    pub resources: WorkerResources,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9400".to_string(),
            bootstrap_token: None,
            name: format!("worker-{}", uuid::Uuid::now_v7()),
            concurrency: 4,
            resources: WorkerResources::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut resources = defaults.resources.clone();
        resources.memory_bytes = env_parse("FLUX_WORKER_MEMORY_BYTES", resources.memory_bytes);
        resources.cpu_shares = env_parse("FLUX_WORKER_CPU_SHARES", resources.cpu_shares);
        resources.gpu = env_parse("FLUX_WORKER_GPU", resources.gpu);
        if let Some(packages) = env_var("FLUX_WORKER_PACKAGES") {
            resources.packages = packages
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        Self {
            server_url: env_var("FLUX_SERVER_URL").unwrap_or(defaults.server_url),
            bootstrap_token: env_var("FLUX_BOOTSTRAP_TOKEN"),
            name: env_var("FLUX_WORKER_NAME").unwrap_or(defaults.name),
            concurrency: env_parse("FLUX_WORKER_CONCURRENCY", defaults.concurrency),
            resources,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `flux_server=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let format = match env_var("FLUX_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            level: env_var("FLUX_LOG_LEVEL")
                .or_else(|| env_var("RUST_LOG"))
                .unwrap_or(defaults.level),
            format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9400);
        assert_eq!(config.bind_addr(), "0.0.0.0:9400");
        assert_eq!(config.worker_liveness, Duration::from_secs(15));
        assert_eq!(config.unmatched_warn_rounds, 10);
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert!(config.name.starts_with("worker-"));
        assert_eq!(config.concurrency, 4);
        assert!(config.bootstrap_token.is_none());
    }

    #[test]
    fn test_log_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Text);
    }
}
