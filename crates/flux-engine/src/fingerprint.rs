//! Task call fingerprints
//!
//! A fingerprint deterministically identifies one task call within an
//! execution. It must be stable across processes and versions: canonical
//! serialization of the arguments (object keys sorted recursively), a fixed
//! hash function, and the call index to disambiguate repeated calls with
//! identical arguments.

use sha2::{Digest, Sha256};

/// Canonical JSON encoding: object keys sorted recursively, no whitespace
///
/// `serde_json` already orders map keys, but only at one level of a freshly
/// built value; this walks the tree so the encoding never depends on how the
/// value was constructed.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fingerprint of one task call
///
/// `scope` is empty for top-level calls and the parent invocation's
/// fingerprint inside a subworkflow, so nested calls never collide with the
/// parent's. `call_index` is assigned in program order by the execution
/// context.
pub fn fingerprint(scope: &str, task_name: &str, args: &serde_json::Value, call_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0]);
    hasher.update(task_name.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(args).as_bytes());
    hasher.update([0]);
    hasher.update(call_index.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Cache key for a deterministic task: name + args hash, no call index
///
/// A cached task's result is shared across executions, so two workflows
/// calling the same task with the same arguments hit the same entry.
pub fn cache_key(task_name: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(args).as_bytes());
    format!("{}:{}", task_name, hex::encode(&hasher.finalize()[..16]))
}
