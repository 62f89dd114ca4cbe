//! RPC client traits between the Request Manager and Job Runner.
//!
//! Transport is an external concern; the core only sees these interfaces.
//! Calls that matter for chain lifecycle (job logs, final state, suspended
//! chains) are retried by the callers with the [`crate::retry`] utility.

use async_trait::async_trait;
use thiserror::Error;

use crate::proto::{JobChain, JobLog, JobStatus, State, StatusFilter, SuspendedJobChain};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Recoverable: timeouts, connection blips. Safe to retry.
    #[error("transient client error: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Calls the Request Manager makes against a Job Runner.
#[async_trait]
pub trait JRClient: Send + Sync {
    /// Ships a new chain; returns the URL to poll for status.
    async fn new_job_chain(&self, base_url: &str, chain: JobChain) -> Result<String, ClientError>;

    /// Hands a suspended chain to a Job Runner for resumption.
    async fn resume_job_chain(
        &self,
        base_url: &str,
        sjc: SuspendedJobChain,
    ) -> Result<String, ClientError>;

    async fn start_request(&self, base_url: &str, request_id: &str) -> Result<(), ClientError>;

    async fn stop_request(&self, base_url: &str, request_id: &str) -> Result<(), ClientError>;

    async fn running(
        &self,
        base_url: &str,
        filter: StatusFilter,
    ) -> Result<Vec<JobStatus>, ClientError>;
}

/// Calls a Job Runner makes against the Request Manager.
#[async_trait]
pub trait RMClient: Send + Sync {
    /// Records one job run's final state.
    async fn create_job_log(&self, request_id: &str, job_log: JobLog) -> Result<(), ClientError>;

    /// Hands back a suspended chain so it can be resumed elsewhere.
    async fn suspend_request(
        &self,
        request_id: &str,
        sjc: SuspendedJobChain,
    ) -> Result<(), ClientError>;

    /// Reports a chain's final state.
    async fn finish_request(&self, request_id: &str, state: State) -> Result<(), ClientError>;
}
