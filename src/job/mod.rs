//! Collaborator traits for job implementations.
//!
//! The core never contains job logic. At request time the resolver makes a
//! job through a [`Factory`], lets it record its own state from the job
//! args, and stores the serialized form in the chain. At run time the
//! runner rehydrates the job from those bytes and drives it.

use async_trait::async_trait;
use thiserror::Error;

use crate::proto::{JobArgs, State};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job type {0}")]
    UnknownType(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of one run attempt.
#[derive(Clone, Debug)]
pub struct Return {
    /// `Complete` or `Fail`.
    pub state: State,
    pub exit: i64,
    pub error: Option<String>,
}

impl Return {
    pub fn complete() -> Self {
        Return {
            state: State::Complete,
            exit: 0,
            error: None,
        }
    }

    pub fn fail(exit: i64, error: impl Into<String>) -> Self {
        Return {
            state: State::Fail,
            exit,
            error: Some(error.into()),
        }
    }
}

/// One concrete unit of work, implemented outside the core.
///
/// `create`/`serialize` run on the Request Manager when a chain is
/// resolved; `deserialize`/`run`/`stop`/`status` run on the Job Runner.
/// Jobs must be idempotent: the system retries and resumes by re-running.
#[async_trait]
pub trait Job: Send + Sync {
    /// Request-time initialization. The job may read and add args; args it
    /// adds become available downstream per the node's `sets`.
    fn create(&mut self, args: &mut JobArgs) -> Result<(), JobError>;

    /// Serialized job state to store in the chain.
    fn serialize(&self) -> Result<Vec<u8>, JobError>;

    /// Restores state captured by [`Job::serialize`].
    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), JobError>;

    /// Runs the job. May block for a long time; `data` is chain-scoped
    /// state the job may read and mutate, flowing to successor jobs.
    async fn run(&self, data: &mut JobArgs) -> Result<Return, JobError>;

    /// Signals a running job to stop. The job should cause `run` to return
    /// promptly.
    fn stop(&self) -> Result<(), JobError>;

    /// Real-time status line for the running job.
    fn status(&self) -> String;
}

/// Makes job instances by type.
pub trait Factory: Send + Sync {
    fn make(&self, job_type: &str, job_name: &str) -> Result<Box<dyn Job>, JobError>;
}
