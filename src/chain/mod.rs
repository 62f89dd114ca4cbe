//! Runtime job chains and their traverser.
//!
//! [`Chain`] wraps a [`proto::JobChain`] with the mutable state the Job
//! Runner needs: per-job states and the three try-counter maps. All access
//! goes through methods guarded by one lock. The [`traverser`] drives a
//! chain to completion, stop, or suspension, coordinating with the
//! [`reaper`] state machine.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::proto::{Job, JobArgs, JobChain, State, SuspendedJobChain};

mod reaper;
mod repo;
pub mod traverser;

pub use repo::{Repo, RepoError};
pub use traverser::{Traverser, TraverserFactory};

struct ChainData {
    job_chain: JobChain,
    /// Sequence-start job id -> times the sequence has been tried.
    sequence_tries: HashMap<String, u32>,
    /// Job id -> tries across all sequence tries.
    total_job_tries: HashMap<String, u32>,
    /// Job id -> tries within the latest sequence try.
    latest_run_job_tries: HashMap<String, u32>,
}

/// Thread-safe runtime wrapper around a job chain.
pub struct Chain {
    data: RwLock<ChainData>,
}

impl Chain {
    /// Wraps a freshly resolved chain; all try counters start at zero.
    pub fn new(job_chain: JobChain) -> Self {
        Chain {
            data: RwLock::new(ChainData {
                job_chain,
                sequence_tries: HashMap::new(),
                total_job_tries: HashMap::new(),
                latest_run_job_tries: HashMap::new(),
            }),
        }
    }

    /// Wraps a suspended chain, restoring its try counters.
    pub fn from_suspended(sjc: SuspendedJobChain) -> Self {
        Chain {
            data: RwLock::new(ChainData {
                job_chain: sjc.job_chain,
                sequence_tries: sjc.sequence_tries,
                total_job_tries: sjc.total_job_tries,
                latest_run_job_tries: sjc.latest_run_job_tries,
            }),
        }
    }

    pub fn request_id(&self) -> String {
        self.data.read().unwrap().job_chain.request_id.clone()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.data.read().unwrap().job_chain.jobs.get(job_id).cloned()
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.data.read().unwrap().job_chain.jobs.keys().cloned().collect()
    }

    pub fn job_state(&self, job_id: &str) -> State {
        self.data
            .read()
            .unwrap()
            .job_chain
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .unwrap_or_default()
    }

    pub fn set_job_state(&self, job_id: &str, state: State) {
        let mut data = self.data.write().unwrap();
        if let Some(job) = data.job_chain.jobs.get_mut(job_id) {
            job.state = state;
        }
    }

    /// Merges a completed job's data into a successor's, so data flows
    /// along the chain.
    pub fn merge_job_data(&self, from_id: &str, to_id: &str) {
        let mut data = self.data.write().unwrap();
        let from_data = match data.job_chain.jobs.get(from_id) {
            Some(job) => job.data.clone(),
            None => return,
        };
        if let Some(to) = data.job_chain.jobs.get_mut(to_id) {
            to.data.extend(from_data);
        }
    }

    /// Replaces a job's data, recording what its run produced.
    pub fn set_job_data(&self, job_id: &str, job_data: JobArgs) {
        let mut data = self.data.write().unwrap();
        if let Some(job) = data.job_chain.jobs.get_mut(job_id) {
            job.data = job_data;
        }
    }

    pub fn state(&self) -> State {
        self.data.read().unwrap().job_chain.state
    }

    pub fn set_state(&self, state: State) {
        self.data.write().unwrap().job_chain.state = state;
    }

    /// All jobs that can run right now: PENDING with every dependency
    /// COMPLETE. Sorted by id for deterministic dispatch order.
    pub fn runnable_jobs(&self) -> Vec<Job> {
        let data = self.data.read().unwrap();
        let mut jobs: Vec<Job> = data
            .job_chain
            .jobs
            .keys()
            .filter(|id| is_runnable(&data, id))
            .map(|id| data.job_chain.jobs[id].clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn is_runnable(&self, job_id: &str) -> bool {
        is_runnable(&self.data.read().unwrap(), job_id)
    }

    /// Successors of `job_id` that became runnable, typically after it
    /// completed.
    pub fn runnable_next_jobs(&self, job_id: &str) -> Vec<Job> {
        let data = self.data.read().unwrap();
        let mut jobs: Vec<Job> = data
            .job_chain
            .next_jobs(job_id)
            .iter()
            .filter(|id| is_runnable(&data, id))
            .map(|id| data.job_chain.jobs[id.as_str()].clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn next_job_ids(&self, job_id: &str) -> Vec<String> {
        self.data
            .read()
            .unwrap()
            .job_chain
            .next_jobs(job_id)
            .to_vec()
    }

    /// Adds `delta` to both the latest-run and total try counts of a job.
    /// Negative deltas are used when resuming a suspended chain.
    pub fn increment_job_tries(&self, job_id: &str, delta: i64) {
        let mut data = self.data.write().unwrap();
        {
            let tries = data.latest_run_job_tries.entry(job_id.to_string()).or_insert(0);
            *tries = add_delta(*tries, delta);
        }
        {
            let tries = data.total_job_tries.entry(job_id.to_string()).or_insert(0);
            *tries = add_delta(*tries, delta);
        }
    }

    /// (tries within the latest run, tries across all runs).
    pub fn job_tries(&self, job_id: &str) -> (u32, u32) {
        let data = self.data.read().unwrap();
        (
            data.latest_run_job_tries.get(job_id).copied().unwrap_or(0),
            data.total_job_tries.get(job_id).copied().unwrap_or(0),
        )
    }

    /// Adds `delta` to the try count of the sequence `job_id` belongs to.
    pub fn increment_sequence_tries(&self, job_id: &str, delta: i64) {
        let mut data = self.data.write().unwrap();
        let Some(seq_id) = data
            .job_chain
            .jobs
            .get(job_id)
            .map(|job| job.sequence_id.clone())
        else {
            return;
        };
        let tries = data.sequence_tries.entry(seq_id).or_insert(0);
        *tries = add_delta(*tries, delta);
    }

    pub fn sequence_tries(&self, job_id: &str) -> u32 {
        let data = self.data.read().unwrap();
        data.job_chain
            .jobs
            .get(job_id)
            .and_then(|job| data.sequence_tries.get(&job.sequence_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_sequence_start_job(&self, job_id: &str) -> bool {
        self.data
            .read()
            .unwrap()
            .job_chain
            .jobs
            .get(job_id)
            .map(|job| job.sequence_start)
            .unwrap_or(false)
    }

    /// The begin job of the sequence `job_id` belongs to.
    pub fn sequence_start_job(&self, job_id: &str) -> Option<Job> {
        let data = self.data.read().unwrap();
        let seq_id = &data.job_chain.jobs.get(job_id)?.sequence_id;
        data.job_chain.jobs.get(seq_id).cloned()
    }

    /// Whether the sequence owning `job_id` has retries left.
    pub fn can_retry_sequence(&self, job_id: &str) -> bool {
        let data = self.data.read().unwrap();
        let Some(job) = data.job_chain.jobs.get(job_id) else {
            return false;
        };
        let Some(start) = data.job_chain.jobs.get(&job.sequence_id) else {
            return false;
        };
        let tries = data
            .sequence_tries
            .get(&start.sequence_id)
            .copied()
            .unwrap_or(0);
        tries <= start.sequence_retry
    }

    /// Resets every job of the failed job's sequence (nested sequences
    /// included) back to PENDING with zero latest-run tries, and returns
    /// the sequence-start job for re-enqueueing.
    pub fn prepare_sequence_retry(&self, failed_job_id: &str) -> Option<Job> {
        let mut data = self.data.write().unwrap();
        let seq_id = data.job_chain.jobs.get(failed_job_id)?.sequence_id.clone();
        let scope = retry_scope(&data, &seq_id);

        for job_id in scope {
            if let Some(job) = data.job_chain.jobs.get_mut(&job_id) {
                job.state = State::Pending;
            }
            data.latest_run_job_tries.insert(job_id, 0);
        }

        data.job_chain.jobs.get(&seq_id).cloned()
    }

    /// Whether every job in the sequence retry scope of `job_id` has
    /// stopped running. A sequence only retries once it settles.
    pub fn is_sequence_settled(&self, job_id: &str) -> bool {
        let data = self.data.read().unwrap();
        let Some(job) = data.job_chain.jobs.get(job_id) else {
            return false;
        };
        let seq_id = job.sequence_id.clone();
        let scope = retry_scope(&data, &seq_id);
        scope
            .iter()
            .all(|id| data.job_chain.jobs[id].state != State::Running)
    }

    /// A FAILED job in the sequence retry scope of `job_id`, if any.
    pub fn failed_job_in_sequence(&self, job_id: &str) -> Option<String> {
        let data = self.data.read().unwrap();
        let seq_id = data.job_chain.jobs.get(job_id)?.sequence_id.clone();
        let mut scope: Vec<String> = retry_scope(&data, &seq_id).into_iter().collect();
        scope.sort();
        scope
            .into_iter()
            .find(|id| data.job_chain.jobs[id].state == State::Fail)
    }

    /// (done, complete): done when nothing is running and nothing can run
    /// anymore; complete when additionally every job finished COMPLETE.
    ///
    /// A STOPPED job means the chain is resumable, so it is never done. A
    /// FAILED job is terminal: it blocks its successors, which are then
    /// pending but not runnable.
    pub fn is_done_running(&self) -> (bool, bool) {
        let data = self.data.read().unwrap();
        let mut complete = true;
        for job in data.job_chain.jobs.values() {
            match job.state {
                State::Complete => continue,
                State::Running | State::Stopped => return (false, false),
                State::Pending | State::Unknown => {
                    if is_runnable(&data, &job.id) {
                        return (false, false);
                    }
                    complete = false;
                }
                _ => complete = false,
            }
        }
        (true, complete)
    }

    /// Snapshot for handoff. The caller must have moved RUNNING jobs to
    /// STOPPED first; STOPPED jobs mean "resume by re-running".
    pub fn to_suspended(&self) -> SuspendedJobChain {
        let data = self.data.read().unwrap();
        let mut job_chain = data.job_chain.clone();
        job_chain.state = State::Suspended;
        SuspendedJobChain {
            request_id: job_chain.request_id.clone(),
            job_chain,
            total_job_tries: data.total_job_tries.clone(),
            latest_run_job_tries: data.latest_run_job_tries.clone(),
            sequence_tries: data.sequence_tries.clone(),
        }
    }
}

/// Job ids belonging to the sequence rooted at `seq_id`, nested sequences
/// included: jobs whose sequence id is in the scope pull their own ids in,
/// to a fixpoint.
fn retry_scope(data: &ChainData, seq_id: &str) -> HashSet<String> {
    let mut scope: HashSet<String> = HashSet::from([seq_id.to_string()]);
    loop {
        let before = scope.len();
        for job in data.job_chain.jobs.values() {
            if scope.contains(&job.sequence_id) {
                scope.insert(job.id.clone());
            }
        }
        if scope.len() == before {
            break;
        }
    }
    scope
}

fn is_runnable(data: &ChainData, job_id: &str) -> bool {
    let Some(job) = data.job_chain.jobs.get(job_id) else {
        return false;
    };
    if job.state != State::Pending {
        return false;
    }
    data.job_chain
        .prev_jobs(job_id)
        .iter()
        .all(|prev| data.job_chain.jobs[*prev].state == State::Complete)
}

fn add_delta(value: u32, delta: i64) -> u32 {
    if delta >= 0 {
        value.saturating_add(delta as u32)
    } else {
        value.saturating_sub(delta.unsigned_abs() as u32)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    /// begin -> a -> b -> end, with begin owning one sequence retry.
    fn linear_chain() -> Chain {
        let mut jobs = HashMap::new();
        for (id, start) in [("begin", true), ("a", false), ("b", false), ("end", false)] {
            jobs.insert(
                id.to_string(),
                Job {
                    id: id.to_string(),
                    name: id.to_string(),
                    job_type: if start || id == "end" { "noop" } else { "work" }.to_string(),
                    state: State::Pending,
                    sequence_id: "begin".to_string(),
                    sequence_retry: if start { 1 } else { 0 },
                    sequence_start: start,
                    ..Job::default()
                },
            );
        }
        Chain::new(JobChain {
            request_id: "req1".to_string(),
            jobs,
            adjacency_list: HashMap::from([
                ("begin".to_string(), vec!["a".to_string()]),
                ("a".to_string(), vec!["b".to_string()]),
                ("b".to_string(), vec!["end".to_string()]),
            ]),
            state: State::Pending,
        })
    }

    #[test]
    fn test_runnable_jobs() {
        let chain = linear_chain();
        let runnable = chain.runnable_jobs();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].id, "begin");

        chain.set_job_state("begin", State::Complete);
        assert!(chain.is_runnable("a"));
        assert!(!chain.is_runnable("b"));
        assert_eq!(chain.runnable_next_jobs("begin")[0].id, "a");
    }

    #[test]
    fn test_is_done_running() {
        let chain = linear_chain();
        assert_eq!(chain.is_done_running(), (false, false));

        chain.set_job_state("begin", State::Complete);
        chain.set_job_state("a", State::Running);
        assert_eq!(chain.is_done_running(), (false, false));

        // A terminal failure blocks everything downstream: done, not
        // complete
        chain.set_job_state("a", State::Fail);
        assert_eq!(chain.is_done_running(), (true, false));

        chain.set_job_state("a", State::Complete);
        chain.set_job_state("b", State::Complete);
        chain.set_job_state("end", State::Complete);
        assert_eq!(chain.is_done_running(), (true, true));
    }

    #[test]
    fn test_job_tries() {
        let chain = linear_chain();
        chain.increment_job_tries("a", 3);
        assert_eq!(chain.job_tries("a"), (3, 3));
        chain.increment_job_tries("a", -1);
        assert_eq!(chain.job_tries("a"), (2, 2));
    }

    #[test]
    fn test_sequence_retry() {
        let chain = linear_chain();
        chain.increment_sequence_tries("begin", 1);
        assert_eq!(chain.sequence_tries("a"), 1);

        // sequence_retry = 1: one retry allowed after the first run
        assert!(chain.can_retry_sequence("a"));
        chain.increment_sequence_tries("begin", 1);
        assert!(!chain.can_retry_sequence("a"));
    }

    #[test]
    fn test_prepare_sequence_retry_resets_jobs() {
        let chain = linear_chain();
        chain.set_job_state("begin", State::Complete);
        chain.set_job_state("a", State::Complete);
        chain.set_job_state("b", State::Fail);
        chain.increment_job_tries("a", 1);
        chain.increment_job_tries("b", 1);

        let start = chain.prepare_sequence_retry("b").unwrap();
        assert_eq!(start.id, "begin");
        for id in ["begin", "a", "b", "end"] {
            assert_eq!(chain.job_state(id), State::Pending, "job {id}");
        }
        // latest-run tries reset, total kept
        assert_eq!(chain.job_tries("a"), (0, 1));
        assert_eq!(chain.job_tries("b"), (0, 1));
    }

    #[test]
    fn test_suspend_round_trip() {
        let chain = linear_chain();
        chain.set_job_state("begin", State::Complete);
        chain.set_job_state("a", State::Stopped);
        chain.increment_job_tries("a", 1);
        chain.increment_sequence_tries("begin", 1);

        let sjc = chain.to_suspended();
        assert_eq!(sjc.request_id, "req1");
        assert_eq!(sjc.job_chain.state, State::Suspended);
        assert_eq!(sjc.latest_run_job_tries["a"], 1);

        let restored = Chain::from_suspended(sjc);
        assert_eq!(restored.job_state("a"), State::Stopped);
        assert_eq!(restored.job_tries("a"), (1, 1));
        assert_eq!(restored.sequence_tries("begin"), 1);
    }
}
