//! Deterministic builtins
//!
//! Time, randomness, unique ids, and sleep are non-determinism sources, so
//! they are ordinary tasks: the first execution journals the value, and
//! replay returns the journaled value. Calling the host clock or RNG
//! directly inside workflow code is a correctness bug; route it through
//! these.

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

use flux_core::{TaskError, TaskOptions};

use crate::registry::TaskRegistry;
use crate::workflow::FnTask;

/// Register the builtin tasks: `now`, `randint`, `uuid`, `sleep`
pub fn register_builtins(registry: &mut TaskRegistry) {
    registry.register(FnTask::new("now", TaskOptions::default(), |_ctx, _args| async move {
        Ok(json!(Utc::now().to_rfc3339()))
    }));

    registry.register(FnTask::new(
        "randint",
        TaskOptions::default(),
        |_ctx, args| async move {
            let (min, max) = parse_range(&args)?;
            if min > max {
                return Err(TaskError::non_retryable(format!(
                    "empty range: {min}..={max}"
                )));
            }
            let value = rand::thread_rng().gen_range(min..=max);
            Ok(json!(value))
        },
    ));

    registry.register(FnTask::new("uuid", TaskOptions::default(), |_ctx, _args| async move {
        Ok(json!(Uuid::now_v7().to_string()))
    }));

    registry.register(FnTask::new(
        "sleep",
        TaskOptions::default(),
        |_ctx, args| async move {
            let seconds = parse_seconds(&args)?;
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
            Ok(serde_json::Value::Null)
        },
    ));
}

fn parse_range(args: &serde_json::Value) -> Result<(i64, i64), TaskError> {
    let pair = match args {
        serde_json::Value::Array(items) if items.len() == 2 => {
            (items[0].as_i64(), items[1].as_i64())
        }
        serde_json::Value::Object(map) => (
            map.get("min").and_then(|v| v.as_i64()),
            map.get("max").and_then(|v| v.as_i64()),
        ),
        _ => (None, None),
    };

    match pair {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(TaskError::non_retryable(
            "randint expects [min, max] or {\"min\", \"max\"}",
        )),
    }
}

fn parse_seconds(args: &serde_json::Value) -> Result<f64, TaskError> {
    let seconds = match args {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Object(map) => map.get("seconds").and_then(|v| v.as_f64()),
        _ => None,
    };

    match seconds {
        Some(s) if s >= 0.0 => Ok(s),
        _ => Err(TaskError::non_retryable(
            "sleep expects a non-negative number of seconds",
        )),
    }
}
