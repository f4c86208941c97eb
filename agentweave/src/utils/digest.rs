//! Short content digests for event payloads.
//!
//! Lifecycle events reference state snapshots, deltas, and tool arguments by
//! digest rather than inlining them; the full payloads live in the durable
//! step records. Digests only need to be stable and cheap, not
//! cryptographic.

use rustc_hash::FxHasher;
use serde_json::Value;
use std::hash::{Hash, Hasher};

/// Stable hex digest of a JSON value.
///
/// Object keys are visited in sorted order so logically equal values hash
/// identically regardless of construction order.
#[must_use]
pub fn value_digest(value: &Value) -> String {
    let mut hasher = FxHasher::default();
    hash_value(value, &mut hasher);
    format!("{:016x}", hasher.finish())
}

fn hash_value(value: &Value, hasher: &mut FxHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}
