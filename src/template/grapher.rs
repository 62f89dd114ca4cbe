//! Template construction over validated specs.
//!
//! Sequences are built in post-order over the subsequence-reference DAG so
//! a template's arg flow can be checked against the `sets` of the
//! sub-templates it inlines. A sequence that fails never aborts the batch:
//! it is recorded in the error map, its dependents fail with a cascade
//! error, and unrelated sequences still build.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::spec::check::subsequences;
use crate::spec::{NodeSpec, Sequence, Specs};

use super::{Graph, IdGenFactory, Node};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("cannot find definition")]
    MissingDefinition,

    #[error("failed to build subsequence(s)")]
    SubsequenceFailed,

    #[error("{}", fmt_missing_sets(.0))]
    MissingSets(Vec<(String, Vec<String>)>),

    #[error("node {node} missing job args: {}", .args.join(", "))]
    MissingArgs { node: String, args: Vec<String> },

    #[error("impossible dependencies found amongst: {}", .nodes.join(", "))]
    ImpossibleDependencies { nodes: Vec<String> },

    #[error("node {node}: malformed `each` entry {entry:?}")]
    MalformedEach { node: String, entry: String },

    #[error("malformed graph created")]
    MalformedGraph,
}

fn fmt_missing_sets(missing: &[(String, Vec<String>)]) -> String {
    let nodes = missing
        .iter()
        .map(|(node, args)| format!("{node} (failed to set {})", args.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");
    let plural = if missing.len() > 1 { "s" } else { "" };
    format!("node{plural} did not actually set job args declared in 'sets': {nodes}")
}

/// Result of one grapher run: templates for the sequences that built, the
/// error for each one that did not. Membership is mutually exclusive.
#[derive(Debug, Default)]
pub struct Templates {
    pub templates: BTreeMap<String, Graph>,
    pub errors: BTreeMap<String, GraphError>,
}

impl Templates {
    pub fn get(&self, sequence: &str) -> Option<&Graph> {
        self.templates.get(sequence)
    }

    /// True when every sequence built.
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for Templates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} template(s), {} error(s)",
            self.templates.len(),
            self.errors.len()
        )
    }
}

/// Builds a template for every sequence in `specs`. Per-sequence failures
/// are logged through `log` and recorded in the returned error map.
pub fn create_templates(
    specs: &Specs,
    id_factory: &IdGenFactory,
    log: &mut dyn FnMut(String),
) -> Templates {
    let mut builder = Builder {
        specs,
        id_factory,
        out: Templates::default(),
    };
    for name in specs.sequences.keys() {
        builder.build_sequence(name, log);
    }
    builder.out
}

struct Builder<'a> {
    specs: &'a Specs,
    id_factory: &'a IdGenFactory,
    out: Templates,
}

impl Builder<'_> {
    /// Builds one sequence, memoized: a sequence lands in exactly one of
    /// the templates/errors maps and is never rebuilt.
    fn build_sequence(&mut self, name: &str, log: &mut dyn FnMut(String)) -> bool {
        if self.out.templates.contains_key(name) {
            return true;
        }
        if self.out.errors.contains_key(name) {
            return false;
        }

        match self.try_build(name, log) {
            Ok(template) => {
                self.out.templates.insert(name.to_string(), template);
                true
            }
            Err(err) => {
                log(format!("error: sequence {name}: {err}"));
                self.out.errors.insert(name.to_string(), err);
                false
            }
        }
    }

    fn try_build(&mut self, name: &str, log: &mut dyn FnMut(String)) -> Result<Graph, GraphError> {
        let seq = self
            .specs
            .sequences
            .get(name)
            .ok_or(GraphError::MissingDefinition)?;

        // Build everything this sequence references, including conditional
        // branches, before looking at its own arg flow.
        let mut subs_ok = true;
        for sub in subsequences(self.specs, seq) {
            subs_ok &= self.build_sequence(&sub, log);
        }
        if !subs_ok {
            return Err(GraphError::SubsequenceFailed);
        }

        let missing = self.missing_sets(seq);
        if !missing.is_empty() {
            return Err(GraphError::MissingSets(missing));
        }

        self.build_graph(seq)
    }

    /// Args a node's referenced sequence(s) actually produce: for a
    /// conditional, the intersection over its sequence branches; for a
    /// sequence node, that sub-template's sets. Branches naming job types
    /// are vouched for by the job factory, not checked here.
    fn actual_sets(&self, node: &NodeSpec) -> Option<BTreeSet<String>> {
        let subs: Vec<&str> = if node.is_sequence() {
            vec![node.node_type.as_str()]
        } else if node.is_conditional() {
            node.eq
                .values()
                .filter(|target| self.specs.sequences.contains_key(*target))
                .map(String::as_str)
                .collect()
        } else {
            return None;
        };
        if subs.is_empty() {
            return None;
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for sub in &subs {
            if let Some(template) = self.out.templates.get(*sub) {
                for arg in template.sets() {
                    *counts.entry(arg).or_default() += 1;
                }
            }
        }
        Some(
            counts
                .into_iter()
                .filter(|(_, count)| *count == subs.len())
                .map(|(arg, _)| arg.to_string())
                .collect(),
        )
    }

    /// (node, args) pairs where the node's `sets` promises args its
    /// referenced sequences don't all produce.
    fn missing_sets(&self, seq: &Sequence) -> Vec<(String, Vec<String>)> {
        let mut missing = Vec::new();
        for (node_name, node) in &seq.nodes {
            let Some(actual) = self.actual_sets(node) else {
                continue;
            };
            let not_set: Vec<String> = node
                .sets
                .iter()
                .filter(|set| !actual.contains(&set.arg))
                .map(|set| set.arg.clone())
                .collect();
            if !not_set.is_empty() {
                missing.push((node_name.clone(), not_set));
            }
        }
        missing
    }

    /// Topologically inserts the sequence's nodes between the sentinels,
    /// verifying before each insertion that every arg the node consumes is
    /// already available. A full pass with no insertion means the
    /// remaining nodes depend on each other in a cycle.
    fn build_graph(&self, seq: &Sequence) -> Result<Graph, GraphError> {
        let mut idgen = self.id_factory.make();
        let mut graph = Graph::new(&seq.name, &mut idgen);

        // Live set of args available so far: the sequence's own args, plus
        // whatever the inserted nodes set.
        let mut job_args: BTreeSet<String> =
            seq.args.names().map(|name| name.to_string()).collect();

        let mut ids: BTreeMap<&str, String> = BTreeMap::new();
        for (node_name, node) in &seq.nodes {
            let id = idgen.id(node_name);
            graph.add_node(Node {
                id: id.clone(),
                spec: node.clone(),
            });
            ids.insert(node_name, id);
        }

        let mut to_add: BTreeSet<&str> = seq.nodes.keys().map(String::as_str).collect();
        let mut added: BTreeSet<&str> = BTreeSet::new();

        while !to_add.is_empty() {
            let mut inserted = Vec::new();
            for node_name in &to_add {
                let node = &seq.nodes[*node_name];
                if !node.deps.iter().all(|dep| added.contains(dep.as_str())) {
                    continue;
                }

                let missing = missing_args(node, &job_args)?;
                if !missing.is_empty() {
                    return Err(GraphError::MissingArgs {
                        node: node_name.to_string(),
                        args: missing,
                    });
                }

                let id = ids[*node_name].clone();
                if node.deps.is_empty() {
                    let first = graph.first.clone();
                    graph.insert_after(&id, &first);
                } else {
                    for dep in &node.deps {
                        let prev = ids[dep.as_str()].clone();
                        graph.insert_after(&id, &prev);
                    }
                }

                for set in &node.sets {
                    let as_name = set.set_as.as_deref().unwrap_or(&set.arg);
                    job_args.insert(as_name.to_string());
                }
                inserted.push(*node_name);
            }

            if inserted.is_empty() {
                return Err(GraphError::ImpossibleDependencies {
                    nodes: to_add.iter().map(|name| name.to_string()).collect(),
                });
            }
            for name in inserted {
                to_add.remove(name);
                added.insert(name);
            }
        }

        if !graph.is_valid() {
            return Err(GraphError::MalformedGraph);
        }
        graph.sets = job_args;
        Ok(graph)
    }
}

/// Node args not present in the available arg set: `each` collections, the
/// conditional `if` arg, and every `given` mapping.
fn missing_args(node: &NodeSpec, job_args: &BTreeSet<String>) -> Result<Vec<String>, GraphError> {
    let mut missing = Vec::new();

    for entry in &node.each {
        let (collection, _) =
            NodeSpec::split_each(entry).ok_or_else(|| GraphError::MalformedEach {
                node: node.name.clone(),
                entry: entry.clone(),
            })?;
        if !job_args.contains(collection) {
            missing.push(collection.to_string());
        }
    }

    if let Some(if_arg) = &node.if_arg {
        if !job_args.contains(if_arg) {
            missing.push(if_arg.clone());
        }
    }

    for arg in &node.args {
        let given = arg.given.as_deref().unwrap_or(&arg.expected);
        if !job_args.contains(given) {
            missing.push(given.to_string());
        }
    }

    Ok(missing)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::spec::parse_str;

    fn templates(yaml: &str) -> Templates {
        let specs = parse_str(yaml, &mut |_| {}).unwrap();
        create_templates(&specs, &IdGenFactory, &mut |_| {})
    }

    #[test]
    fn test_single_node_sequence() {
        let out = templates(
            r#"
sequences:
  seq-a:
    nodes:
      only:
        type: job-type-a
"#,
        );
        assert!(out.ok());
        let graph = out.get("seq-a").unwrap();
        // start -> node -> end
        assert_eq!(graph.nodes.len(), 3);
        let only = graph.next(&graph.first);
        assert_eq!(only.len(), 1);
        assert_eq!(graph.next(&only[0]), [graph.last.clone()]);
    }

    #[test]
    fn test_sets_flow_through_nodes() {
        let out = templates(
            r#"
sequences:
  seq-a:
    args:
      required:
        - name: cluster
    nodes:
      get-instances:
        type: get-instances
        args:
          - expected: cluster
        sets:
          - arg: instances
      use-instances:
        type: use-instances
        args:
          - expected: instances
        deps: [get-instances]
"#,
        );
        assert!(out.ok(), "errors: {:?}", out.errors);
        let graph = out.get("seq-a").unwrap();
        assert!(graph.sets().contains("cluster"));
        assert!(graph.sets().contains("instances"));
    }

    #[test]
    fn test_missing_args_fails() {
        let out = templates(
            r#"
sequences:
  seq-a:
    nodes:
      use-instances:
        type: use-instances
        args:
          - expected: instances
"#,
        );
        assert_eq!(
            out.errors["seq-a"],
            GraphError::MissingArgs {
                node: "use-instances".to_string(),
                args: vec!["instances".to_string()],
            }
        );
        assert!(out.get("seq-a").is_none());
    }

    #[test]
    fn test_sets_not_produced_cascades() {
        let out = templates(
            r#"
sequences:
  parent:
    nodes:
      call-mid:
        category: sequence
        type: mid
  mid:
    nodes:
      call-leaf:
        category: sequence
        type: leaf
        sets:
          - arg: physicalhost
  leaf:
    nodes:
      only:
        type: job-type-a
  unrelated:
    nodes:
      only:
        type: job-type-b
"#,
        );
        // leaf produces nothing; mid declares `sets: physicalhost` on it
        assert_eq!(
            out.errors["mid"],
            GraphError::MissingSets(vec![(
                "call-leaf".to_string(),
                vec!["physicalhost".to_string()]
            )])
        );
        // parent fails only because mid did
        assert_eq!(out.errors["parent"], GraphError::SubsequenceFailed);
        // leaf itself and unrelated sequences still build
        assert!(out.get("leaf").is_some());
        assert!(out.get("unrelated").is_some());
    }

    #[test]
    fn test_conditional_sets_intersection() {
        let out = templates(
            r#"
sequences:
  parent:
    args:
      required:
        - name: flavor
    nodes:
      pick:
        category: conditional
        if: flavor
        eq:
          red: red-seq
          default: blue-seq
        sets:
          - arg: common
      after:
        type: consume
        args:
          - expected: common
        deps: [pick]
  red-seq:
    nodes:
      set-both:
        type: t
        sets:
          - arg: common
          - arg: red-only
  blue-seq:
    nodes:
      set-common:
        type: t
        sets:
          - arg: common
"#,
        );
        assert!(out.ok(), "errors: {:?}", out.errors);

        // Declaring the non-common arg fails: only `common` is set on all
        // branches.
        let out = templates(
            r#"
sequences:
  parent:
    args:
      required:
        - name: flavor
    nodes:
      pick:
        category: conditional
        if: flavor
        eq:
          red: red-seq
          default: blue-seq
        sets:
          - arg: red-only
  red-seq:
    nodes:
      set-both:
        type: t
        sets:
          - arg: common
          - arg: red-only
  blue-seq:
    nodes:
      set-common:
        type: t
        sets:
          - arg: common
"#,
        );
        assert_eq!(
            out.errors["parent"],
            GraphError::MissingSets(vec![("pick".to_string(), vec!["red-only".to_string()])])
        );
    }

    #[test]
    fn test_impossible_dependencies() {
        let out = templates(
            r#"
sequences:
  seq-a:
    nodes:
      first:
        type: t
      one:
        type: t
        deps: [first, two]
      two:
        type: t
        deps: [one]
"#,
        );
        assert_eq!(
            out.errors["seq-a"],
            GraphError::ImpossibleDependencies {
                nodes: vec!["one".to_string(), "two".to_string()]
            }
        );
    }
}
