//! Cross-sequence static validation, run after parsing and before
//! template construction.
//!
//! The checker accumulates every violation it finds instead of stopping at
//! the first, so a bad spec set is reported in one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use thiserror::Error;

use super::{parse_duration, NodeSpec, Sequence, Specs, DEFAULT_BRANCH};

#[derive(Debug, Error, PartialEq)]
pub enum CheckError {
    #[error("sequence {sequence}: node {node}: unknown subsequence {subsequence}")]
    UnknownSubsequence {
        sequence: String,
        node: String,
        subsequence: String,
    },

    #[error("sequence {sequence}: node {node}: conditional missing `if`")]
    MissingIf { sequence: String, node: String },

    #[error("sequence {sequence}: node {node}: conditional missing `eq` branches")]
    MissingEq { sequence: String, node: String },

    #[error("sequence {sequence}: node {node}: `if`/`eq` set on non-conditional node")]
    UnexpectedConditional { sequence: String, node: String },

    #[error("sequence {sequence}: node {node}: unknown dependency {dependency}")]
    UnknownDependency {
        sequence: String,
        node: String,
        dependency: String,
    },

    #[error("sequence {sequence}: impossible dependencies amongst: {}", .nodes.join(", "))]
    CircularDependencies {
        sequence: String,
        nodes: Vec<String>,
    },

    #[error("circular subsequence references amongst: {}", .sequences.join(", "))]
    CircularSubsequences { sequences: Vec<String> },

    #[error("sequence {sequence}: node {node}: malformed `each` entry {entry:?}, want collection:element")]
    MalformedEach {
        sequence: String,
        node: String,
        entry: String,
    },

    #[error("sequence {sequence}: arg {arg} appears in more than one of required/optional/static")]
    DuplicateArg { sequence: String, arg: String },

    #[error("sequence {sequence}: node {node}: invalid retryWait {wait:?}")]
    InvalidRetryWait {
        sequence: String,
        node: String,
        wait: String,
    },

    #[error("sequence {sequence}: invalid retryWait {wait:?}")]
    InvalidSequenceRetryWait { sequence: String, wait: String },
}

/// All violations found in one checker run.
#[derive(Debug, Error)]
pub struct CheckErrors(pub Vec<CheckError>);

impl Display for CheckErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.0 {
            writeln!(f, "- {e}")?;
        }
        Ok(())
    }
}

/// Validates the spec set. Warnings (a conditional without a `default`
/// branch) go to `log`; everything else accumulates into the error list.
pub fn check(specs: &Specs, log: &mut dyn FnMut(String)) -> Result<(), CheckErrors> {
    let mut errors = Vec::new();

    for (seq_name, seq) in &specs.sequences {
        check_args_disjoint(seq_name, seq, &mut errors);
        if !seq.retry_wait.is_empty() && parse_duration(&seq.retry_wait).is_err() {
            errors.push(CheckError::InvalidSequenceRetryWait {
                sequence: seq_name.clone(),
                wait: seq.retry_wait.clone(),
            });
        }
        for (node_name, node) in &seq.nodes {
            check_node(specs, seq_name, seq, node_name, node, log, &mut errors);
        }
        check_dep_cycles(seq_name, seq, &mut errors);
    }

    check_subsequence_cycles(specs, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CheckErrors(errors))
    }
}

fn check_args_disjoint(seq_name: &str, seq: &Sequence, errors: &mut Vec<CheckError>) {
    let mut seen = BTreeSet::new();
    for name in seq.args.names() {
        if !seen.insert(name) {
            errors.push(CheckError::DuplicateArg {
                sequence: seq_name.to_string(),
                arg: name.to_string(),
            });
        }
    }
}

fn check_node(
    specs: &Specs,
    seq_name: &str,
    seq: &Sequence,
    node_name: &str,
    node: &NodeSpec,
    log: &mut dyn FnMut(String),
    errors: &mut Vec<CheckError>,
) {
    if node.is_sequence() && !specs.sequences.contains_key(&node.node_type) {
        errors.push(CheckError::UnknownSubsequence {
            sequence: seq_name.to_string(),
            node: node_name.to_string(),
            subsequence: node.node_type.clone(),
        });
    }

    if node.is_conditional() {
        if node.if_arg.is_none() {
            errors.push(CheckError::MissingIf {
                sequence: seq_name.to_string(),
                node: node_name.to_string(),
            });
        }
        if node.eq.is_empty() {
            errors.push(CheckError::MissingEq {
                sequence: seq_name.to_string(),
                node: node_name.to_string(),
            });
        } else if !node.eq.contains_key(DEFAULT_BRANCH) {
            // Branch values that name no sequence are job types, which only
            // the job factory can vouch for, so nothing to verify there.
            log(format!(
                "warning: sequence {seq_name}: node {node_name}: conditional has no `default` branch"
            ));
        }
    } else if node.if_arg.is_some() || !node.eq.is_empty() {
        errors.push(CheckError::UnexpectedConditional {
            sequence: seq_name.to_string(),
            node: node_name.to_string(),
        });
    }

    for dep in &node.deps {
        if !seq.nodes.contains_key(dep) {
            errors.push(CheckError::UnknownDependency {
                sequence: seq_name.to_string(),
                node: node_name.to_string(),
                dependency: dep.clone(),
            });
        }
    }

    for entry in &node.each {
        if NodeSpec::split_each(entry).is_none() {
            errors.push(CheckError::MalformedEach {
                sequence: seq_name.to_string(),
                node: node_name.to_string(),
                entry: entry.clone(),
            });
        }
    }

    if !node.retry_wait.is_empty() && parse_duration(&node.retry_wait).is_err() {
        errors.push(CheckError::InvalidRetryWait {
            sequence: seq_name.to_string(),
            node: node_name.to_string(),
            wait: node.retry_wait.clone(),
        });
    }
}

/// Kahn-style elimination: peel nodes whose dependencies are all resolved;
/// whatever remains is involved in (or downstream of) a cycle.
fn check_dep_cycles(seq_name: &str, seq: &Sequence, errors: &mut Vec<CheckError>) {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = seq
        .nodes
        .iter()
        .map(|(name, node)| {
            let deps = node
                .deps
                .iter()
                .filter(|dep| seq.nodes.contains_key(*dep))
                .map(String::as_str)
                .collect();
            (name.as_str(), deps)
        })
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in &ready {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }
    }

    if !remaining.is_empty() {
        errors.push(CheckError::CircularDependencies {
            sequence: seq_name.to_string(),
            nodes: remaining.keys().map(|name| name.to_string()).collect(),
        });
    }
}

/// The sequences a sequence references: `sequence` nodes plus conditional
/// branches that name sequences.
pub(crate) fn subsequences(specs: &Specs, seq: &Sequence) -> BTreeSet<String> {
    let mut subs = BTreeSet::new();
    for node in seq.nodes.values() {
        if node.is_sequence() {
            subs.insert(node.node_type.clone());
        } else if node.is_conditional() {
            for target in node.eq.values() {
                if specs.sequences.contains_key(target) {
                    subs.insert(target.clone());
                }
            }
        }
    }
    subs
}

fn check_subsequence_cycles(specs: &Specs, errors: &mut Vec<CheckError>) {
    let mut remaining: BTreeMap<&str, BTreeSet<String>> = specs
        .sequences
        .iter()
        .map(|(name, seq)| {
            let subs = subsequences(specs, seq)
                .into_iter()
                .filter(|sub| specs.sequences.contains_key(sub))
                .collect();
            (name.as_str(), subs)
        })
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, subs)| subs.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in &ready {
            remaining.remove(name);
        }
        for subs in remaining.values_mut() {
            for name in &ready {
                subs.remove(*name);
            }
        }
    }

    if !remaining.is_empty() {
        errors.push(CheckError::CircularSubsequences {
            sequences: remaining.keys().map(|name| name.to_string()).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::spec::parse_str;

    fn check_yaml(yaml: &str) -> (Result<(), CheckErrors>, Vec<String>) {
        let specs = parse_str(yaml, &mut |_| {}).unwrap();
        let mut warnings = Vec::new();
        let result = check(&specs, &mut |w| warnings.push(w));
        (result, warnings)
    }

    #[test]
    fn test_valid_specs_pass() {
        let (result, warnings) = check_yaml(
            r#"
sequences:
  seq-a:
    request: true
    args:
      required:
        - name: things
    nodes:
      first:
        type: job-type-a
      second:
        category: sequence
        type: seq-b
        each:
          - things:thing
        deps: [first]
  seq-b:
    args:
      required:
        - name: thing
    nodes:
      only:
        type: job-type-b
"#,
        );
        assert!(result.is_ok());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_circular_subsequences() {
        let (result, _) = check_yaml(
            r#"
sequences:
  seq-a:
    nodes:
      call-b:
        category: sequence
        type: seq-b
  seq-b:
    nodes:
      call-a:
        category: sequence
        type: seq-a
"#,
        );
        let errors = result.unwrap_err().0;
        assert_eq!(
            errors,
            vec![CheckError::CircularSubsequences {
                sequences: vec!["seq-a".to_string(), "seq-b".to_string()]
            }]
        );
    }

    #[test]
    fn test_accumulates_all_errors() {
        let (result, _) = check_yaml(
            r#"
sequences:
  seq-a:
    args:
      required:
        - name: arg-a
      static:
        - name: arg-a
          default: x
    nodes:
      bad-dep:
        type: job-type-a
        deps: [no-such-node]
      bad-each:
        type: job-type-b
        each:
          - malformed
      bad-subseq:
        category: sequence
        type: no-such-seq
"#,
        );
        let errors = result.unwrap_err().0;
        assert_eq!(errors.len(), 4, "got: {errors:?}");
        assert!(errors.iter().any(|e| matches!(e, CheckError::DuplicateArg { .. })));
        assert!(errors.iter().any(|e| matches!(e, CheckError::UnknownDependency { .. })));
        assert!(errors.iter().any(|e| matches!(e, CheckError::MalformedEach { .. })));
        assert!(errors.iter().any(|e| matches!(e, CheckError::UnknownSubsequence { .. })));
    }

    #[test]
    fn test_dep_cycle() {
        let (result, _) = check_yaml(
            r#"
sequences:
  seq-a:
    nodes:
      one:
        type: t
        deps: [two]
      two:
        type: t
        deps: [one]
      fine:
        type: t
"#,
        );
        let errors = result.unwrap_err().0;
        assert_eq!(
            errors,
            vec![CheckError::CircularDependencies {
                sequence: "seq-a".to_string(),
                nodes: vec!["one".to_string(), "two".to_string()]
            }]
        );
    }

    #[test]
    fn test_conditional_checks() {
        let (result, warnings) = check_yaml(
            r#"
sequences:
  seq-a:
    nodes:
      pick:
        category: conditional
        if: flavor
        eq:
          red: seq-b
      not-conditional:
        type: t
        if: flavor
  seq-b:
    nodes:
      only:
        type: t
"#,
        );
        // missing default is only a warning; stray `if` is an error
        let errors = result.unwrap_err().0;
        assert_eq!(
            errors,
            vec![CheckError::UnexpectedConditional {
                sequence: "seq-a".to_string(),
                node: "not-conditional".to_string()
            }]
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no `default` branch"));
    }

    #[test]
    fn test_invalid_retry_wait() {
        let (result, _) = check_yaml(
            r#"
sequences:
  seq-a:
    retry: 1
    retryWait: soon
    nodes:
      only:
        type: t
        retry: 1
        retryWait: 10x
"#,
        );
        let errors = result.unwrap_err().0;
        assert_eq!(errors.len(), 2);
    }
}
