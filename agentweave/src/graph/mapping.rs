//! Input mappings: `$.`-rooted selectors over the state object.
//!
//! A mapping binds prompt argument names (or subgraph input properties) to
//! selectors over state. Supported: property chaining, indexed access, the
//! wildcard `*` over arrays, and a `|| <literal>` default for missing values.
//!
//! ```rust
//! use agentweave::graph::Selector;
//! use serde_json::json;
//!
//! let sel = Selector::parse("$.report.sections[0].title || \"untitled\"").unwrap();
//! let root = json!({"report": {"sections": [{"title": "Intro"}]}});
//! assert_eq!(sel.eval(&root), json!("Intro"));
//! assert_eq!(sel.eval(&json!({})), json!("untitled"));
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::state::StateSnapshot;

/// Errors raised while parsing a selector.
#[derive(Debug, Error, Diagnostic)]
pub enum MappingError {
    #[error("selector '{selector}' must start with '$'")]
    #[diagnostic(code(agentweave::mapping::missing_root))]
    MissingRoot { selector: String },

    #[error("invalid segment '{segment}' in selector '{selector}'")]
    #[diagnostic(
        code(agentweave::mapping::invalid_segment),
        help("supported segments: .property, [index], [*] or .* on arrays")
    )]
    InvalidSegment { selector: String, segment: String },

    #[error("invalid default literal in selector '{selector}': {detail}")]
    #[diagnostic(code(agentweave::mapping::invalid_default))]
    InvalidDefault { selector: String, detail: String },
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A parsed selector plus optional fallback literal.
#[derive(Clone, Debug)]
pub struct Selector {
    source: String,
    segments: Vec<Segment>,
    default: Option<Value>,
}

impl Selector {
    /// Parses a selector of the form `$.a.b[0].* || <json literal>`.
    pub fn parse(source: &str) -> Result<Self, MappingError> {
        let source = source.trim();
        let (path, default) = match source.split_once("||") {
            Some((path, default)) => {
                let literal: Value =
                    serde_json::from_str(default.trim()).map_err(|e| MappingError::InvalidDefault {
                        selector: source.to_string(),
                        detail: e.to_string(),
                    })?;
                (path.trim(), Some(literal))
            }
            None => (source, None),
        };

        let rest = path
            .strip_prefix('$')
            .ok_or_else(|| MappingError::MissingRoot {
                selector: source.to_string(),
            })?;

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        segments.push(Segment::Wildcard);
                        continue;
                    }
                    let mut key = String::new();
                    while let Some(&n) = chars.peek() {
                        if n == '.' || n == '[' {
                            break;
                        }
                        key.push(n);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(MappingError::InvalidSegment {
                            selector: source.to_string(),
                            segment: ".".to_string(),
                        });
                    }
                    segments.push(Segment::Key(key));
                }
                '[' => {
                    let mut inner = String::new();
                    for n in chars.by_ref() {
                        if n == ']' {
                            break;
                        }
                        inner.push(n);
                    }
                    let inner = inner.trim();
                    if inner == "*" {
                        segments.push(Segment::Wildcard);
                    } else {
                        let index = inner.parse::<usize>().map_err(|_| {
                            MappingError::InvalidSegment {
                                selector: source.to_string(),
                                segment: format!("[{inner}]"),
                            }
                        })?;
                        segments.push(Segment::Index(index));
                    }
                }
                other => {
                    return Err(MappingError::InvalidSegment {
                        selector: source.to_string(),
                        segment: other.to_string(),
                    })
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
            default,
        })
    }

    /// Evaluates against a root value; missing/null resolves to the default
    /// literal, or `null` when none was declared.
    #[must_use]
    pub fn eval(&self, root: &Value) -> Value {
        let resolved = walk(root, &self.segments);
        match resolved {
            Value::Null => self.default.clone().unwrap_or(Value::Null),
            found => found,
        }
    }

    /// First property name the selector reads, if any.
    #[must_use]
    pub fn root_property(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Key(k) => Some(k.as_str()),
            _ => None,
        })
    }

    /// Original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn walk(value: &Value, segments: &[Segment]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value.clone();
    };
    match head {
        Segment::Key(key) => match value.get(key) {
            Some(next) => walk(next, rest),
            None => Value::Null,
        },
        Segment::Index(i) => match value.get(i) {
            Some(next) => walk(next, rest),
            None => Value::Null,
        },
        Segment::Wildcard => match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| walk(item, rest)).collect())
            }
            _ => Value::Null,
        },
    }
}

/// A compiled input mapping: target argument name → selector.
///
/// Entries apply in target-name order so the produced bundle is
/// deterministic.
#[derive(Clone, Debug, Default)]
pub struct CompiledMapping {
    entries: Vec<(String, Selector)>,
}

impl CompiledMapping {
    /// Compiles a `target → selector` table.
    pub fn compile<'a, I>(entries: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut compiled: Vec<(String, Selector)> = entries
            .into_iter()
            .map(|(target, selector)| Ok((target.clone(), Selector::parse(selector)?)))
            .collect::<Result<_, MappingError>>()?;
        compiled.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { entries: compiled })
    }

    /// `true` when the mapping declares no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the mapping to a snapshot, producing the argument bundle.
    #[must_use]
    pub fn apply(&self, snapshot: &StateSnapshot) -> FxHashMap<String, Value> {
        let root = snapshot.to_value();
        let mut out = FxHashMap::default();
        for (target, selector) in &self.entries {
            out.insert(target.clone(), selector.eval(&root));
        }
        out
    }

    /// Iterates compiled entries.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Selector)> {
        self.entries.iter().map(|(t, s)| (t, s))
    }
}
