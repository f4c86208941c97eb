//! State schema: property declarations and per-property merge rules.
//!
//! A workflow's `state_schema` is a JSON-Schema-shaped object whose
//! `properties` entries may carry a `"merge"` annotation selecting the rule
//! used when concurrent node deltas touch the same property. Without an
//! annotation, arrays default to [`MergeRule::AppendList`] and everything else
//! to [`MergeRule::Replace`].

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How concurrent updates to a single property combine at the barrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Last writer wins, by super-step ordinality then lexicographic node id.
    #[default]
    Replace,
    /// Shallow key-wise object merge.
    MergeObject,
    /// List concatenation.
    AppendList,
    /// Per-key replace across maps.
    MergeMap,
}

/// Declaration for a single state property.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertySpec {
    /// Merge rule applied at the super-step barrier.
    pub merge: MergeRule,
    /// JSON type name from the schema (`"array"`, `"object"`, ...), if given.
    pub json_type: Option<String>,
}

/// Parsed state schema: property name → declaration.
///
/// Shared immutably by the compiled graph; properties not declared in the
/// schema fall back to [`MergeRule::Replace`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateSchema {
    properties: FxHashMap<String, PropertySpec>,
}

/// Errors raised while parsing a state schema.
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error("state schema must be a JSON object, got {found}")]
    #[diagnostic(code(agentweave::schema::not_object))]
    NotAnObject { found: &'static str },

    #[error("property '{property}' has unknown merge rule '{rule}'")]
    #[diagnostic(
        code(agentweave::schema::unknown_merge_rule),
        help("valid rules: replace, merge_object, append_list, merge_map")
    )]
    UnknownMergeRule { property: String, rule: String },
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl StateSchema {
    /// An empty schema: every property merges with [`MergeRule::Replace`].
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a JSON-Schema-shaped value.
    ///
    /// Only the `properties` section is consulted. Each property definition
    /// may carry `"merge": "<rule>"`; otherwise `"type": "array"` implies
    /// `append_list` and anything else implies `replace`.
    pub fn parse(value: &Value) -> Result<Self, SchemaError> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Ok(Self::empty()),
            other => {
                return Err(SchemaError::NotAnObject {
                    found: json_type_name(other),
                })
            }
        };

        let mut properties = FxHashMap::default();
        let Some(Value::Object(props)) = obj.get("properties") else {
            return Ok(Self { properties });
        };

        for (name, def) in props {
            let json_type = def
                .get("type")
                .and_then(Value::as_str)
                .map(ToString::to_string);

            let merge = match def.get("merge").and_then(Value::as_str) {
                Some("replace") => MergeRule::Replace,
                Some("merge_object") => MergeRule::MergeObject,
                Some("append_list") => MergeRule::AppendList,
                Some("merge_map") => MergeRule::MergeMap,
                Some(other) => {
                    return Err(SchemaError::UnknownMergeRule {
                        property: name.clone(),
                        rule: other.to_string(),
                    })
                }
                None => match json_type.as_deref() {
                    Some("array") => MergeRule::AppendList,
                    _ => MergeRule::Replace,
                },
            };

            properties.insert(name.clone(), PropertySpec { merge, json_type });
        }

        Ok(Self { properties })
    }

    /// Merge rule for a property; `Replace` when undeclared.
    #[must_use]
    pub fn rule_for(&self, property: &str) -> MergeRule {
        self.properties
            .get(property)
            .map(|p| p.merge)
            .unwrap_or_default()
    }

    /// `true` if the property is declared in the schema.
    #[must_use]
    pub fn declares(&self, property: &str) -> bool {
        self.properties.contains_key(property)
    }

    /// Iterates declared properties.
    pub fn properties(&self) -> impl Iterator<Item = (&String, &PropertySpec)> {
        self.properties.iter()
    }
}
