//! Request resolution: template + request args -> runnable job chain.
//!
//! The resolver walks a request's template in dependency order, inlining
//! subsequences, unrolling `each:` iterations, and fixing conditional
//! branches, and emits a [`proto::JobChain`] ready to ship to a Job
//! Runner. Jobs are created through the job factory as the chain is built,
//! so every job's serialized state is captured at request time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::job::{self, JobError};
use crate::proto::{Job, JobArgs, JobChain, State, NOOP_JOB_TYPE};
use crate::spec::{NodeCategory, NodeSpec, Specs, DEFAULT_BRANCH};
use crate::template::Templates;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown request {0}")]
    UnknownRequest(String),

    #[error("sequence {0} is not a request")]
    NotARequest(String),

    #[error("sequence {sequence} has no usable template: {reason}")]
    NoTemplate { sequence: String, reason: String },

    #[error("missing required arg {arg} for sequence {sequence}")]
    MissingRequiredArg { sequence: String, arg: String },

    #[error("arg {arg} is static and cannot be overridden")]
    StaticArgOverride { arg: String },

    #[error("unknown arg {arg}")]
    UnknownArg { arg: String },

    #[error("node {node}: arg {arg} is not available")]
    MissingArg { node: String, arg: String },

    #[error("node {node}: arg {arg} is not a list, cannot iterate")]
    EachNotAList { node: String, arg: String },

    #[error("node {node}: `each` collections differ in length")]
    EachLengthMismatch { node: String },

    #[error("node {node}: `if` arg {arg} is not a string")]
    IfNotAString { node: String, arg: String },

    #[error("node {node}: no `eq` branch for {arg} = {value:?} and no default")]
    NoBranch {
        node: String,
        arg: String,
        value: String,
    },

    #[error("node {node}: job args declared in 'sets' were not set: {}", .args.join(", "))]
    SetsNotSet { node: String, args: Vec<String> },

    #[error("node {node}: {source}")]
    Job { node: String, source: JobError },
}

/// Resolves requests against compiled templates.
pub struct Resolver<'a> {
    specs: &'a Specs,
    templates: &'a Templates,
    job_factory: Arc<dyn job::Factory>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        specs: &'a Specs,
        templates: &'a Templates,
        job_factory: Arc<dyn job::Factory>,
    ) -> Self {
        Resolver {
            specs,
            templates,
            job_factory,
        }
    }

    /// Creates a job chain for one request. `user_args` must cover the
    /// request sequence's required args; optional args fall back to their
    /// defaults; static args cannot be supplied.
    pub fn resolve_request(
        &self,
        request: &str,
        user_args: JobArgs,
    ) -> Result<JobChain, RequestError> {
        let seq = self
            .specs
            .sequences
            .get(request)
            .ok_or_else(|| RequestError::UnknownRequest(request.to_string()))?;
        if !seq.request {
            return Err(RequestError::NotARequest(request.to_string()));
        }

        let supplied = self.validate_request_args(request, user_args)?;

        let request_id = new_id();
        debug!(request_id, request, "resolving request");

        let mut builder = ChainBuilder {
            resolver: self,
            jobs: HashMap::new(),
            edges: HashMap::new(),
        };
        builder.build_sequence(request, supplied)?;

        Ok(JobChain {
            request_id,
            jobs: builder.jobs,
            adjacency_list: builder.edges,
            state: State::Pending,
        })
    }

    /// Required args must be supplied; optional args may be; static args
    /// and undeclared names may not.
    fn validate_request_args(
        &self,
        request: &str,
        mut user_args: JobArgs,
    ) -> Result<JobArgs, RequestError> {
        let args = &self.specs.sequences[request].args;

        let mut supplied = JobArgs::new();
        for arg in &args.required {
            let value = user_args
                .remove(&arg.name)
                .ok_or_else(|| RequestError::MissingRequiredArg {
                    sequence: request.to_string(),
                    arg: arg.name.clone(),
                })?;
            supplied.insert(arg.name.clone(), value);
        }
        for arg in &args.optional {
            if let Some(value) = user_args.remove(&arg.name) {
                supplied.insert(arg.name.clone(), value);
            }
        }
        for arg in &args.static_args {
            if user_args.remove(&arg.name).is_some() {
                return Err(RequestError::StaticArgOverride {
                    arg: arg.name.clone(),
                });
            }
        }
        if let Some(name) = user_args.into_keys().next() {
            return Err(RequestError::UnknownArg { arg: name });
        }
        Ok(supplied)
    }
}

/// One inlined piece of the chain, with a single entry and exit job.
struct Fragment {
    first: String,
    last: String,
}

struct ChainBuilder<'a> {
    resolver: &'a Resolver<'a>,
    jobs: HashMap<String, Job>,
    edges: HashMap<String, Vec<String>>,
}

impl ChainBuilder<'_> {
    fn add_edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
    }

    fn add_job(&mut self, job: Job) -> String {
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        id
    }

    fn noop_job(&mut self, name: String, sequence_id: &str) -> String {
        self.add_job(Job {
            id: new_id(),
            name,
            job_type: NOOP_JOB_TYPE.to_string(),
            state: State::Pending,
            sequence_id: sequence_id.to_string(),
            ..Job::default()
        })
    }

    /// Inlines `seq_name` given the args mapped into its namespace.
    /// Returns the fragment and the sequence's scope after every job in it
    /// was created, so the caller can pull `sets` values out.
    fn build_sequence(
        &mut self,
        seq_name: &str,
        supplied: JobArgs,
    ) -> Result<(Fragment, JobArgs), RequestError> {
        let resolver = self.resolver;
        let seq = resolver
            .specs
            .sequences
            .get(seq_name)
            .ok_or_else(|| RequestError::UnknownRequest(seq_name.to_string()))?;
        let template = resolver.templates.get(seq_name).ok_or_else(|| {
            let reason = resolver
                .templates
                .errors
                .get(seq_name)
                .map(|err| err.to_string())
                .unwrap_or_else(|| "not compiled".to_string());
            RequestError::NoTemplate {
                sequence: seq_name.to_string(),
                reason,
            }
        })?;

        // Sequence scope: required args must have been mapped in, optional
        // and static fall back to their spec defaults.
        let mut scope = supplied;
        for arg in &seq.args.required {
            if !scope.contains_key(&arg.name) {
                return Err(RequestError::MissingRequiredArg {
                    sequence: seq_name.to_string(),
                    arg: arg.name.clone(),
                });
            }
        }
        for arg in seq.args.optional.iter().chain(seq.args.static_args.iter()) {
            if let Some(default) = &arg.default {
                scope
                    .entry(arg.name.clone())
                    .or_insert_with(|| Value::String(default.clone()));
            }
        }

        // The begin sentinel is the sequence-start job: it owns the
        // sequence retry policy and names the sequence for every job in
        // this inlining.
        let begin_id = new_id();
        self.add_job(Job {
            id: begin_id.clone(),
            name: format!("{seq_name}_begin"),
            job_type: NOOP_JOB_TYPE.to_string(),
            state: State::Pending,
            sequence_id: begin_id.clone(),
            sequence_retry: seq.retry,
            sequence_retry_wait: seq.retry_wait.clone(),
            sequence_start: true,
            ..Job::default()
        });
        let end_id = self.noop_job(format!("{seq_name}_end"), &begin_id);

        // Walk interior template nodes in dependency order, wiring each
        // node's fragment to the fragments of its dependencies.
        let mut fragments: HashMap<String, Fragment> = HashMap::new();
        let mut reaches_end = Vec::new();
        for node_id in template.topo_order() {
            if node_id == template.first || node_id == template.last {
                continue;
            }
            let node = &template.nodes[&node_id];
            let fragment = self.build_node(&node.spec, &mut scope, &begin_id)?;

            for prev_id in template.prev(&node_id) {
                if prev_id == &template.first {
                    self.add_edge(&begin_id, &fragment.first);
                } else {
                    let prev_last = fragments[prev_id].last.clone();
                    self.add_edge(&prev_last, &fragment.first);
                }
            }
            if template.next(&node_id).iter().any(|id| id == &template.last) {
                reaches_end.push(fragment.last.clone());
            }

            fragments.insert(node_id, fragment);
        }

        if fragments.is_empty() {
            self.add_edge(&begin_id, &end_id);
        } else {
            for last in reaches_end {
                self.add_edge(&last, &end_id);
            }
        }

        Ok((
            Fragment {
                first: begin_id,
                last: end_id,
            },
            scope,
        ))
    }

    /// Builds one template node: a single inlining, or one per `each:`
    /// element, batched under the node's `parallel` bound.
    fn build_node(
        &mut self,
        node: &NodeSpec,
        scope: &mut JobArgs,
        sequence_id: &str,
    ) -> Result<Fragment, RequestError> {
        if node.each.is_empty() {
            return self.build_expansion(node, scope, sequence_id, &[]);
        }

        // Evaluate the iterated collections; entries iterate in lockstep.
        let mut iters: Vec<(String, Vec<Value>)> = Vec::new();
        for entry in &node.each {
            let (collection, element) = NodeSpec::split_each(entry).ok_or_else(|| {
                RequestError::MissingArg {
                    node: node.name.clone(),
                    arg: entry.clone(),
                }
            })?;
            let values = scope
                .get(collection)
                .ok_or_else(|| RequestError::MissingArg {
                    node: node.name.clone(),
                    arg: collection.to_string(),
                })?;
            let list = values
                .as_array()
                .ok_or_else(|| RequestError::EachNotAList {
                    node: node.name.clone(),
                    arg: collection.to_string(),
                })?
                .clone();
            iters.push((element.to_string(), list));
        }
        let count = iters[0].1.len();
        if iters.iter().any(|(_, list)| list.len() != count) {
            return Err(RequestError::EachLengthMismatch {
                node: node.name.clone(),
            });
        }

        // Wrap the expansions so the group has a single entry and exit.
        let group_first = self.noop_job(format!("{}_begin", node.name), sequence_id);
        let group_last = self.noop_job(format!("{}_end", node.name), sequence_id);

        // An empty collection unrolls to nothing; successors still run.
        if count == 0 {
            self.add_edge(&group_first, &group_last);
            return Ok(Fragment {
                first: group_first,
                last: group_last,
            });
        }

        // `parallel` caps concurrency structurally: expansions run in
        // chained groups of at most `parallel` clones.
        let batch = match node.parallel {
            Some(p) if p > 0 => p as usize,
            _ => count,
        };

        let mut gate = group_first.clone();
        let mut start = 0;
        while start < count {
            let end = (start + batch).min(count);
            let next_gate = if end == count {
                group_last.clone()
            } else {
                self.noop_job(format!("{}_gate", node.name), sequence_id)
            };
            for i in start..end {
                let bindings: Vec<(String, Value)> = iters
                    .iter()
                    .map(|(element, list)| (element.clone(), list[i].clone()))
                    .collect();
                let fragment = self.build_expansion(node, scope, sequence_id, &bindings)?;
                self.add_edge(&gate, &fragment.first);
                self.add_edge(&fragment.last, &next_gate);
            }
            gate = next_gate;
            start = end;
        }

        Ok(Fragment {
            first: group_first,
            last: group_last,
        })
    }

    /// Builds one expansion of a node with the given element bindings.
    fn build_expansion(
        &mut self,
        node: &NodeSpec,
        scope: &mut JobArgs,
        sequence_id: &str,
        bindings: &[(String, Value)],
    ) -> Result<Fragment, RequestError> {
        match node.category {
            NodeCategory::Job => self.build_job(node, &node.node_type, scope, sequence_id, bindings),
            NodeCategory::Sequence => {
                self.build_subsequence(node, &node.node_type, scope, bindings)
            }
            NodeCategory::Conditional => {
                let eval = eval_scope(scope, bindings);
                let if_arg = node.if_arg.as_deref().unwrap_or_default();
                let value = eval
                    .get(if_arg)
                    .ok_or_else(|| RequestError::MissingArg {
                        node: node.name.clone(),
                        arg: if_arg.to_string(),
                    })?;
                let value = value.as_str().ok_or_else(|| RequestError::IfNotAString {
                    node: node.name.clone(),
                    arg: if_arg.to_string(),
                })?;
                let target = node
                    .eq
                    .get(value)
                    .or_else(|| node.eq.get(DEFAULT_BRANCH))
                    .ok_or_else(|| RequestError::NoBranch {
                        node: node.name.clone(),
                        arg: if_arg.to_string(),
                        value: value.to_string(),
                    })?
                    .clone();
                debug!(node = node.name, value, branch = target, "conditional resolved");

                // Exactly one branch is inlined; the branch is fixed at
                // request time and does not re-evaluate on sequence retry.
                if self.resolver.specs.sequences.contains_key(&target) {
                    self.build_subsequence(node, &target, scope, bindings)
                } else {
                    self.build_job(node, &target, scope, sequence_id, bindings)
                }
            }
        }
    }

    /// A single job: created through the factory against the sequence
    /// scope (with `given -> expected` aliases applied), serialized, and
    /// recorded in the chain.
    fn build_job(
        &mut self,
        node: &NodeSpec,
        job_type: &str,
        scope: &mut JobArgs,
        sequence_id: &str,
        bindings: &[(String, Value)],
    ) -> Result<Fragment, RequestError> {
        let mut job_scope = eval_scope(scope, bindings);
        let mut job_args = JobArgs::new();
        for arg in &node.args {
            let given = arg.given.as_deref().unwrap_or(&arg.expected);
            let value = job_scope
                .get(given)
                .cloned()
                .ok_or_else(|| RequestError::MissingArg {
                    node: node.name.clone(),
                    arg: given.to_string(),
                })?;
            job_scope.insert(arg.expected.clone(), value.clone());
            job_args.insert(arg.expected.clone(), value);
        }

        let mut job = self
            .resolver
            .job_factory
            .make(job_type, &node.name)
            .map_err(|source| RequestError::Job {
                node: node.name.clone(),
                source,
            })?;
        job.create(&mut job_scope).map_err(|source| RequestError::Job {
            node: node.name.clone(),
            source,
        })?;
        let bytes = job.serialize().map_err(|source| RequestError::Job {
            node: node.name.clone(),
            source,
        })?;

        self.apply_sets(node, &job_scope, scope)?;

        let id = self.add_job(Job {
            id: new_id(),
            name: node.name.clone(),
            job_type: job_type.to_string(),
            bytes,
            state: State::Pending,
            args: job_args,
            retry: node.retry,
            retry_wait: node.retry_wait.clone(),
            sequence_id: sequence_id.to_string(),
            ..Job::default()
        });
        Ok(Fragment {
            first: id.clone(),
            last: id,
        })
    }

    /// Inlines a referenced sequence, mapping `given -> expected` args into
    /// its namespace and pulling its `sets` back out.
    fn build_subsequence(
        &mut self,
        node: &NodeSpec,
        seq_name: &str,
        scope: &mut JobArgs,
        bindings: &[(String, Value)],
    ) -> Result<Fragment, RequestError> {
        let eval = eval_scope(scope, bindings);
        let mut supplied = JobArgs::new();
        for arg in &node.args {
            let given = arg.given.as_deref().unwrap_or(&arg.expected);
            let value = eval
                .get(given)
                .cloned()
                .ok_or_else(|| RequestError::MissingArg {
                    node: node.name.clone(),
                    arg: given.to_string(),
                })?;
            supplied.insert(arg.expected.clone(), value);
        }
        // `each` element bindings flow into the subsequence by name,
        // without an explicit args mapping
        for (name, value) in bindings {
            supplied.insert(name.clone(), value.clone());
        }

        let (fragment, sub_scope) = self.build_sequence(seq_name, supplied)?;
        self.apply_sets(node, &sub_scope, scope)?;
        Ok(fragment)
    }

    /// Copies the node's declared `sets` from an inner scope to the outer
    /// one. The grapher proved these statically; a job that fails to set a
    /// promised arg at create time still fails the request here.
    fn apply_sets(
        &self,
        node: &NodeSpec,
        inner: &JobArgs,
        outer: &mut JobArgs,
    ) -> Result<(), RequestError> {
        let mut missing = Vec::new();
        for set in &node.sets {
            match inner.get(&set.arg) {
                Some(value) => {
                    let as_name = set.set_as.as_deref().unwrap_or(&set.arg);
                    outer.insert(as_name.to_string(), value.clone());
                }
                None => missing.push(set.arg.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(RequestError::SetsNotSet {
                node: node.name.clone(),
                args: missing,
            });
        }
        Ok(())
    }
}

fn eval_scope(scope: &JobArgs, bindings: &[(String, Value)]) -> JobArgs {
    let mut eval = scope.clone();
    for (name, value) in bindings {
        eval.insert(name.clone(), value.clone());
    }
    eval
}

/// Fresh time-ordered id for requests and jobs.
fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}
