//! Declarative request specs: the YAML data model, a lenient parser, and
//! the post-parse defaults pass.
//!
//! Parsing is two-staged: the YAML is first read into a raw value that
//! tolerates duplicate mapping keys (warning through the caller's log
//! function, last value wins), then converted into the typed model where
//! type mismatches fail naming the offending path.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod parser;
pub mod check;

pub use parser::{parse, parse_dir, parse_str};

/// Default wait between retries when a retry count is set but no wait is.
pub const DEFAULT_RETRY_WAIT: &str = "0s";

/// The `eq:` key selecting the fallback branch of a conditional.
pub const DEFAULT_BRANCH: &str = "default";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid yaml in {path}: {source}")]
    Syntax {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid value at {path}: {source}")]
    Type {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("sequence {name} defined in both {first} and {second}")]
    DuplicateSequence {
        name: String,
        first: String,
        second: String,
    },
}

/// A named value in one of a sequence's three arg buckets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// The three arg buckets of a sequence. Required args must be supplied at
/// request time; optional args fall back to their default; static args are
/// fixed by the spec and cannot be overridden.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceArgs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<Arg>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional: Vec<Arg>,
    #[serde(default, rename = "static", skip_serializing_if = "Vec::is_empty")]
    pub static_args: Vec<Arg>,
}

impl SequenceArgs {
    /// All declared arg names, across the three buckets.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .chain(self.static_args.iter())
            .map(|arg| arg.name.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    #[default]
    Job,
    Sequence,
    Conditional,
}

/// Maps an outer-scope arg `given` onto the inner name `expected` that a
/// node consumes it under. `given` defaults to `expected`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeArg {
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
}

/// Declares that running a node produces the outer arg `as` from the inner
/// result `arg`. `as` defaults to `arg`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSet {
    pub arg: String,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub set_as: Option<String>,
}

/// Static definition of one node in a sequence: a job, a sub-sequence
/// reference, or a conditional dispatch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Derived from the map key by the defaults pass.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub category: NodeCategory,
    /// Job type for `job` nodes; sub-sequence name for `sequence` nodes.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub node_type: String,
    /// `"collectionArg:elementArg"` entries; the node is unrolled once per
    /// element of the collection, binding the element name in each copy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub each: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<NodeArg>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sets: Vec<NodeSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub retry_wait: String,
    /// Arg whose value selects a conditional branch.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_arg: Option<String>,
    /// Value -> sequence name or job type; key `"default"` is the fallback.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eq: BTreeMap<String, String>,
    /// Cap on concurrently running `each:` expansions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<u32>,
}

impl NodeSpec {
    pub fn is_job(&self) -> bool {
        self.category == NodeCategory::Job
    }

    pub fn is_sequence(&self) -> bool {
        self.category == NodeCategory::Sequence
    }

    pub fn is_conditional(&self) -> bool {
        self.category == NodeCategory::Conditional
    }

    /// Splits an `each:` entry into (collection, element) names.
    pub fn split_each(entry: &str) -> Option<(&str, &str)> {
        let (collection, element) = entry.split_once(':')?;
        if collection.is_empty() || element.is_empty() {
            return None;
        }
        Some((collection, element))
    }
}

/// A named collection of nodes; a request entry point when `request` is
/// set, a reusable building block otherwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// Derived from the map key by the defaults pass.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub request: bool,
    #[serde(default)]
    pub args: SequenceArgs,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub retry_wait: String,
}

/// All sequences known to the system, keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Specs {
    #[serde(default)]
    pub sequences: BTreeMap<String, Sequence>,
}

/// Fills derived defaults so downstream code never needs to re-derive
/// them: names from map keys, `given` from `expected`, `as` from `arg`,
/// and a zero retry wait wherever a retry count is set without one.
///
/// Called by the parse functions; exposed for specs built in code.
pub fn process(specs: &mut Specs) {
    for (seq_name, seq) in specs.sequences.iter_mut() {
        seq.name = seq_name.clone();
        if seq.retry > 0 && seq.retry_wait.is_empty() {
            seq.retry_wait = DEFAULT_RETRY_WAIT.to_string();
        }
        for (node_name, node) in seq.nodes.iter_mut() {
            node.name = node_name.clone();
            for arg in node.args.iter_mut() {
                if arg.given.is_none() {
                    arg.given = Some(arg.expected.clone());
                }
            }
            for set in node.sets.iter_mut() {
                if set.set_as.is_none() {
                    set.set_as = Some(set.arg.clone());
                }
            }
            if node.retry > 0 && node.retry_wait.is_empty() {
                node.retry_wait = DEFAULT_RETRY_WAIT.to_string();
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid duration {0:?}")]
pub struct DurationError(String);

/// Parses a duration string of the form `"500ms"`, `"2s"`, `"1m"`, `"1h"`,
/// or a bare `"0"`. An empty string is zero.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(Duration::ZERO);
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| DurationError(s.to_string()))?;
    let (value, unit) = s.split_at(split);
    let value: f64 = value.parse().map_err(|_| DurationError(s.to_string()))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(DurationError(s.to_string())),
    };
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_process_fills_defaults() {
        let mut specs = Specs {
            sequences: BTreeMap::from([(
                "seq-a".to_string(),
                Sequence {
                    retry: 2,
                    nodes: BTreeMap::from([(
                        "node-a".to_string(),
                        NodeSpec {
                            node_type: "job-type-a".to_string(),
                            args: vec![NodeArg {
                                expected: "arg-a".to_string(),
                                given: None,
                            }],
                            sets: vec![NodeSet {
                                arg: "arg-b".to_string(),
                                set_as: None,
                            }],
                            retry: 1,
                            ..NodeSpec::default()
                        },
                    )]),
                    ..Sequence::default()
                },
            )]),
        };
        process(&mut specs);

        let seq = &specs.sequences["seq-a"];
        assert_eq!(seq.name, "seq-a");
        assert_eq!(seq.retry_wait, "0s");
        let node = &seq.nodes["node-a"];
        assert_eq!(node.name, "node-a");
        assert_eq!(node.args[0].given.as_deref(), Some("arg-a"));
        assert_eq!(node.sets[0].set_as.as_deref(), Some("arg-b"));
        assert_eq!(node.retry_wait, "0s");
    }

    #[test]
    fn test_split_each() {
        assert_eq!(
            NodeSpec::split_each("instances:instance"),
            Some(("instances", "instance"))
        );
        assert_eq!(NodeSpec::split_each("instances"), None);
        assert_eq!(NodeSpec::split_each(":instance"), None);
        assert_eq!(NodeSpec::split_each("instances:"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert_eq!(
            parse_duration("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }
}
