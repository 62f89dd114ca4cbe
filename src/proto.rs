use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job args are an untyped map of named values. They are produced at
/// request time (user-supplied args, defaults, and args set by jobs during
/// creation) and threaded through the chain as job data at run time.
pub type JobArgs = HashMap<String, Value>;

/// Reserved job type for the begin/end sentinel jobs that delimit every
/// inlined sequence. The job runner handles these internally; a job
/// factory never sees them.
pub const NOOP_JOB_TYPE: &str = "noop";

/// State of a job or of a whole chain.
///
/// Jobs only ever take the `Pending`..`Stopped` values; `Suspended` is a
/// chain-level state reported to the Request Manager when a running chain
/// is handed back for resumption elsewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    #[default]
    Unknown,
    Pending,
    Running,
    Complete,
    Fail,
    Stopped,
    Suspended,
}

impl State {
    /// A job in a finished state will not run again without outside
    /// intervention (a sequence retry or a resume).
    pub fn is_finished(&self) -> bool {
        matches!(self, State::Complete | State::Fail | State::Stopped)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Unknown => "UNKNOWN",
            State::Pending => "PENDING",
            State::Running => "RUNNING",
            State::Complete => "COMPLETE",
            State::Fail => "FAIL",
            State::Stopped => "STOPPED",
            State::Suspended => "SUSPENDED",
        };
        f.write_str(name)
    }
}

/// One concrete unit of work in a job chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job-specific payload produced by `Job::serialize` at request time
    /// and restored with `Job::deserialize` on the runner side.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub state: State,
    /// Args the job was created with.
    #[serde(default)]
    pub args: JobArgs,
    /// Data flowing along the chain: completed jobs' data is merged into
    /// their successors before those are enqueued.
    #[serde(default)]
    pub data: JobArgs,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub retry_wait: String,
    /// Id of the begin job of the innermost sequence this job belongs to.
    #[serde(default)]
    pub sequence_id: String,
    #[serde(default)]
    pub sequence_retry: u32,
    #[serde(default)]
    pub sequence_retry_wait: String,
    /// True for the begin job of an inlined sequence; that job owns the
    /// sequence retry policy.
    #[serde(default)]
    pub sequence_start: bool,
}

/// A fully resolved, ready-to-run DAG of jobs for one request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobChain {
    pub request_id: String,
    /// Job id -> job.
    pub jobs: HashMap<String, Job>,
    /// Job id -> ids of jobs that depend on it.
    pub adjacency_list: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub state: State,
}

impl JobChain {
    /// Ids of the jobs immediately downstream of `job_id`.
    pub fn next_jobs(&self, job_id: &str) -> &[String] {
        self.adjacency_list
            .get(job_id)
            .map(|next| next.as_slice())
            .unwrap_or_default()
    }

    /// Ids of the jobs `job_id` depends on.
    pub fn prev_jobs(&self, job_id: &str) -> Vec<&str> {
        self.adjacency_list
            .iter()
            .filter(|(_, next)| next.iter().any(|id| id == job_id))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Snapshot of a chain sufficient to resume it on another Job Runner:
/// the chain itself plus all three try-counter maps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspendedJobChain {
    pub request_id: String,
    pub job_chain: JobChain,
    pub total_job_tries: HashMap<String, u32>,
    pub latest_run_job_tries: HashMap<String, u32>,
    pub sequence_tries: HashMap<String, u32>,
}

/// Per-run final state of one job, recorded by the Request Manager.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub request_id: String,
    pub job_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(rename = "try")]
    pub tries: u32,
    pub started_at: i64,
    pub finished_at: i64,
    pub state: State,
    pub exit: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Real-time status of a running job, reported by `Traverser::running`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub request_id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub name: String,
    pub state: State,
    pub status: String,
    pub started_at: i64,
    #[serde(rename = "try")]
    pub tries: u32,
}

/// Filter for the `Running` status query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_state_serde_names() {
        assert_eq!(serde_json::to_string(&State::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(
            serde_json::from_str::<State>("\"COMPLETE\"").unwrap(),
            State::Complete
        );
    }

    #[test]
    fn test_prev_jobs() {
        let chain = JobChain {
            request_id: "req1".to_string(),
            jobs: HashMap::new(),
            adjacency_list: HashMap::from([
                ("a".to_string(), vec!["c".to_string()]),
                ("b".to_string(), vec!["c".to_string()]),
                ("c".to_string(), vec![]),
            ]),
            state: State::Pending,
        };
        let mut prev = chain.prev_jobs("c");
        prev.sort();
        assert_eq!(prev, vec!["a", "b"]);
        assert!(chain.prev_jobs("a").is_empty());
        assert_eq!(chain.next_jobs("b"), ["c".to_string()]);
    }

    #[test]
    fn test_sjc_round_trip() {
        let sjc = SuspendedJobChain {
            request_id: "req1".to_string(),
            job_chain: JobChain {
                request_id: "req1".to_string(),
                jobs: HashMap::from([(
                    "j1".to_string(),
                    Job {
                        id: "j1".to_string(),
                        name: "job-one".to_string(),
                        job_type: "echo".to_string(),
                        state: State::Stopped,
                        ..Job::default()
                    },
                )]),
                adjacency_list: HashMap::new(),
                state: State::Suspended,
            },
            total_job_tries: HashMap::from([("j1".to_string(), 2)]),
            latest_run_job_tries: HashMap::from([("j1".to_string(), 2)]),
            sequence_tries: HashMap::new(),
        };
        let bytes = serde_json::to_vec(&sjc).unwrap();
        let restored: SuspendedJobChain = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, sjc);
    }
}
