//! Collection construction helpers.
//!
//! The engine uses `FxHashMap` for all hot maps; these helpers keep call
//! sites free of hasher type annotations.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// New empty property map (state properties, delta payloads, overlays).
#[must_use]
pub fn new_props_map() -> FxHashMap<String, Value> {
    FxHashMap::default()
}

/// Property map from an iterator of pairs.
#[must_use]
pub fn props_from<I, K>(pairs: I) -> FxHashMap<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v))
        .collect()
}
