//! Task invocation options
//!
//! Options are attached to registered tasks and recorded nowhere: the event
//! log references tasks by name only, and fallback/rollback are task names
//! resolved through the registry at execution time.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for a single task's runtime behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Log/event name; may contain `{key}` placeholders formatted from the
    /// call arguments
    pub name: Option<String>,

    /// Retries AFTER the initial attempt
    pub retry_max_attempts: u32,

    /// Base delay between retries
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,

    /// Multiplier applied each successive retry: `delay * backoff^i`
    pub retry_backoff: f64,

    /// Per-attempt wall-clock cap (None = no timeout)
    #[serde(with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    /// Task invoked when all retries are exhausted; its result becomes the
    /// task's result
    pub fallback: Option<String>,

    /// Cleanup task invoked after terminal failure; its result is ignored
    pub rollback: Option<String>,

    /// Secret names resolved and injected at call time
    pub secret_requests: Vec<String>,

    /// Treat the task as deterministic: identical `(name, args)` return the
    /// cached result even across executions
    pub cache: bool,

    /// Inject a structured descriptor of the invocation (id, name, attempt)
    /// into the task context
    pub inject_metadata: bool,

    /// Result is written to external storage; the event records a reference
    pub output_storage: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            retry_max_attempts: 0,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            timeout: None,
            fallback: None,
            rollback: None,
            secret_requests: vec![],
            cache: false,
            inject_metadata: false,
            output_storage: None,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the retry budget and base delay
    pub fn with_retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.retry_backoff = backoff.max(1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fallback(mut self, task_name: impl Into<String>) -> Self {
        self.fallback = Some(task_name.into());
        self
    }

    pub fn with_rollback(mut self, task_name: impl Into<String>) -> Self {
        self.rollback = Some(task_name.into());
        self
    }

    pub fn with_secrets(mut self, names: Vec<String>) -> Self {
        self.secret_requests = names;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn with_metadata(mut self) -> Self {
        self.inject_metadata = true;
        self
    }

    pub fn with_output_storage(mut self, kind: impl Into<String>) -> Self {
        self.output_storage = Some(kind.into());
        self
    }

    /// Total attempt budget including the initial attempt
    pub fn total_attempts(&self) -> u32 {
        self.retry_max_attempts.saturating_add(1)
    }

    /// Delay before retry `i` (0-based): `delay * backoff^i`
    ///
    /// Jitter (±10%) is applied only for backoff policies so that
    /// fixed-delay retries stay exact.
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let base = self.retry_delay.as_secs_f64() * self.retry_backoff.powi(retry_index as i32);

        if self.retry_backoff > 1.0 && base > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = base * 0.1;
            let offset = rng.gen_range(-jitter..jitter);
            Duration::from_secs_f64((base + offset).max(0.0))
        } else {
            Duration::from_secs_f64(base)
        }
    }

    /// Format the display name for a call, substituting `{key}` placeholders
    /// from an object argument or `{0}`, `{1}`, ... from an array argument
    pub fn display_name(&self, task_name: &str, args: &serde_json::Value) -> String {
        let Some(template) = &self.name else {
            return task_name.to_string();
        };

        let mut out = template.clone();
        match args {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    out = out.replace(&format!("{{{key}}}"), &value_to_display(value));
                }
            }
            serde_json::Value::Array(items) => {
                for (idx, value) in items.iter().enumerate() {
                    out = out.replace(&format!("{{{idx}}}"), &value_to_display(value));
                }
            }
            other => {
                out = out.replace("{0}", &value_to_display(other));
            }
        }
        out
    }
}

fn value_to_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
