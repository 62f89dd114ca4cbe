//! Per-job runners.
//!
//! A runner drives one job implementation through its retry policy: up to
//! `retry + 1` tries with `retry_wait` between them, picking up from the
//! try count a resumed chain carried over. Retry waits honor the stop
//! signal; a running job is stopped through its own `stop` method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::select;
use tracing::{debug, warn};

use crate::job::{self, JobError};
use crate::proto::{Job, JobArgs, State, NOOP_JOB_TYPE};
use crate::spec::parse_duration;
use crate::sync::Interrupt;

/// Outcome of one runner run: the job's final state, how many tries this
/// run performed (not counting tries from before a resume), and the last
/// try's error, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct Return {
    pub final_state: State,
    pub tries: u32,
    pub error: Option<String>,
}

/// Real-time view of a running job.
#[derive(Clone, Debug)]
pub struct Status {
    pub job: Job,
    pub started_at: i64,
    pub tries: u32,
    pub status: String,
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Runs the job to a final state. Blocking for as long as the job and
    /// its retries take.
    async fn run(&self, data: &mut JobArgs) -> Return;

    /// Signals the job to stop; `run` is expected to return promptly.
    fn stop(&self) -> Result<(), JobError>;

    fn status(&self) -> Status;
}

/// Makes runners for chain jobs. `prev_tries` and `total_tries` carry the
/// counts a resumed chain left off at.
pub trait Factory: Send + Sync {
    fn make(
        &self,
        job: &Job,
        request_id: &str,
        prev_tries: u32,
        total_tries: u32,
    ) -> Result<Arc<dyn Runner>, JobError>;
}

/// Standard factory: rehydrates jobs through the job factory. The reserved
/// no-op type used for sequence sentinels is handled internally.
pub struct ChainRunnerFactory {
    job_factory: Arc<dyn job::Factory>,
}

impl ChainRunnerFactory {
    pub fn new(job_factory: Arc<dyn job::Factory>) -> Self {
        ChainRunnerFactory { job_factory }
    }
}

impl Factory for ChainRunnerFactory {
    fn make(
        &self,
        job: &Job,
        request_id: &str,
        prev_tries: u32,
        total_tries: u32,
    ) -> Result<Arc<dyn Runner>, JobError> {
        if job.job_type == NOOP_JOB_TYPE {
            return Ok(Arc::new(NoopRunner { job: job.clone() }));
        }
        let mut inner = self.job_factory.make(&job.job_type, &job.name)?;
        inner.deserialize(&job.bytes)?;
        Ok(Arc::new(JobRunner::new(
            Arc::from(inner),
            job.clone(),
            request_id.to_string(),
            prev_tries,
            total_tries,
        )))
    }
}

/// Drives one job implementation.
pub struct JobRunner {
    inner: Arc<dyn job::Job>,
    job: Job,
    request_id: String,
    /// Tries already done within the latest sequence try (resume).
    prev_tries: u32,
    /// Tries across all sequence tries before this run.
    total_tries: u32,
    stop: Interrupt,
    started_at: AtomicI64,
    tries_this_run: AtomicU32,
}

impl JobRunner {
    pub fn new(
        inner: Arc<dyn job::Job>,
        job: Job,
        request_id: String,
        prev_tries: u32,
        total_tries: u32,
    ) -> Self {
        JobRunner {
            inner,
            job,
            request_id,
            prev_tries,
            total_tries,
            stop: Interrupt::new(),
            started_at: AtomicI64::new(0),
            tries_this_run: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Runner for JobRunner {
    async fn run(&self, data: &mut JobArgs) -> Return {
        self.started_at.store(now_unix_nanos(), Ordering::SeqCst);

        let try_limit = self.job.retry + 1;
        let retry_wait = parse_duration(&self.job.retry_wait).unwrap_or_default();

        let mut try_no = self.prev_tries;
        let mut final_state = State::Fail;
        let mut last_error = None;
        while try_no < try_limit {
            if self.stop.is_set() {
                final_state = State::Stopped;
                break;
            }
            try_no += 1;
            self.tries_this_run.fetch_add(1, Ordering::SeqCst);
            debug!(
                request_id = self.request_id,
                job_id = self.job.id,
                try_no,
                try_limit,
                "running job"
            );

            match self.inner.run(data).await {
                Ok(ret) if ret.state == State::Complete => {
                    final_state = State::Complete;
                    last_error = None;
                    break;
                }
                Ok(ret) => {
                    warn!(
                        request_id = self.request_id,
                        job_id = self.job.id,
                        exit = ret.exit,
                        error = ret.error.as_deref().unwrap_or(""),
                        "job failed"
                    );
                    last_error = ret.error;
                }
                Err(err) => {
                    warn!(
                        request_id = self.request_id,
                        job_id = self.job.id,
                        "job error: {err}"
                    );
                    last_error = Some(err.to_string());
                }
            }

            // A failure after a stop request is a stop, not a real failure
            if self.stop.is_set() {
                final_state = State::Stopped;
                break;
            }

            if try_no < try_limit {
                select! {
                    _ = tokio::time::sleep(retry_wait) => {}
                    _ = self.stop.wait() => {
                        final_state = State::Stopped;
                        break;
                    }
                }
            }
        }

        Return {
            final_state,
            tries: self.tries_this_run.load(Ordering::SeqCst),
            error: last_error,
        }
    }

    fn stop(&self) -> Result<(), JobError> {
        self.stop.trigger();
        self.inner.stop()
    }

    fn status(&self) -> Status {
        Status {
            job: self.job.clone(),
            started_at: self.started_at.load(Ordering::SeqCst),
            tries: self.total_tries + self.tries_this_run.load(Ordering::SeqCst),
            status: self.inner.status(),
        }
    }
}

/// Built-in runner for sequence sentinel jobs.
struct NoopRunner {
    job: Job,
}

#[async_trait]
impl Runner for NoopRunner {
    async fn run(&self, _data: &mut JobArgs) -> Return {
        Return {
            final_state: State::Complete,
            tries: 1,
            error: None,
        }
    }

    fn stop(&self) -> Result<(), JobError> {
        Ok(())
    }

    fn status(&self) -> Status {
        Status {
            job: self.job.clone(),
            started_at: 0,
            tries: 1,
            status: "noop".to_string(),
        }
    }
}

/// Thread-safe map of actively running jobs, keyed by job id. Each
/// traverser owns one; job ids are unique per chain, not globally.
#[derive(Clone, Default)]
pub struct Repo {
    runners: Arc<Mutex<HashMap<String, Arc<dyn Runner>>>>,
}

impl Repo {
    pub fn new() -> Self {
        Repo::default()
    }

    pub fn set(&self, job_id: &str, runner: Arc<dyn Runner>) {
        self.runners
            .lock()
            .unwrap()
            .insert(job_id.to_string(), runner);
    }

    pub fn remove(&self, job_id: &str) {
        self.runners.lock().unwrap().remove(job_id);
    }

    pub fn items(&self) -> Vec<(String, Arc<dyn Runner>)> {
        self.runners
            .lock()
            .unwrap()
            .iter()
            .map(|(id, runner)| (id.clone(), runner.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }
}

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::Return as JobReturn;
    use crate::testing::{MockJobFactory, RunBehavior};

    fn chain_job(retry: u32, retry_wait: &str) -> Job {
        Job {
            id: "j1".to_string(),
            name: "work".to_string(),
            job_type: "test/work".to_string(),
            retry,
            retry_wait: retry_wait.to_string(),
            ..Job::default()
        }
    }

    fn runner_for(factory: &MockJobFactory, job: &Job, prev_tries: u32) -> Arc<dyn Runner> {
        let job_factory: Arc<dyn job::Factory> = Arc::new(factory.clone());
        ChainRunnerFactory::new(job_factory)
            .make(job, "req1", prev_tries, prev_tries)
            .unwrap()
    }

    #[tokio::test]
    async fn test_completes_first_try() {
        let factory = MockJobFactory::new();
        let runner = runner_for(&factory, &chain_job(2, "0s"), 0);
        let mut data = JobArgs::new();
        let ret = runner.run(&mut data).await;
        assert_eq!(ret.final_state, State::Complete);
        assert_eq!(ret.tries, 1);
        assert_eq!(ret.error, None);
    }

    #[tokio::test]
    async fn test_retries_until_complete() {
        let factory = MockJobFactory::new();
        factory.on_run(
            "test/work",
            RunBehavior::results(vec![
                JobReturn::fail(1, "boom"),
                JobReturn::fail(1, "boom again"),
                JobReturn::complete(),
            ]),
        );
        let runner = runner_for(&factory, &chain_job(2, "0s"), 0);
        let ret = runner.run(&mut JobArgs::new()).await;
        assert_eq!(ret.final_state, State::Complete);
        assert_eq!(ret.tries, 3);
        assert_eq!(ret.error, None);
    }

    #[tokio::test]
    async fn test_zero_retry_first_fail_is_terminal() {
        let factory = MockJobFactory::new();
        factory.on_run(
            "test/work",
            RunBehavior::results(vec![JobReturn::fail(1, "boom")]),
        );
        let runner = runner_for(&factory, &chain_job(0, ""), 0);
        let ret = runner.run(&mut JobArgs::new()).await;
        assert_eq!(ret.final_state, State::Fail);
        assert_eq!(ret.tries, 1);
        assert_eq!(ret.error, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_resume_continues_try_count() {
        let factory = MockJobFactory::new();
        factory.on_run(
            "test/work",
            RunBehavior::results(vec![JobReturn::fail(1, "boom")]),
        );
        // retry = 2 means 3 tries total; 2 were done before suspension, so
        // only one runs here
        let runner = runner_for(&factory, &chain_job(2, "0s"), 2);
        let ret = runner.run(&mut JobArgs::new()).await;
        assert_eq!(ret.final_state, State::Fail);
        assert_eq!(ret.tries, 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_retry_wait() {
        let factory = MockJobFactory::new();
        factory.on_run(
            "test/work",
            RunBehavior::results(vec![JobReturn::fail(1, "boom")]),
        );
        let runner = runner_for(&factory, &chain_job(5, "1h"), 0);

        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&mut JobArgs::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.stop().unwrap();

        let ret = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run should return promptly after stop")
            .unwrap();
        assert_eq!(ret.final_state, State::Stopped);
        assert_eq!(ret.tries, 1);
    }

    #[tokio::test]
    async fn test_noop_runner() {
        let factory = MockJobFactory::new();
        let job = Job {
            id: "noop1".to_string(),
            name: "seq_begin".to_string(),
            job_type: NOOP_JOB_TYPE.to_string(),
            ..Job::default()
        };
        let runner = runner_for(&factory, &job, 0);
        let ret = runner.run(&mut JobArgs::new()).await;
        assert_eq!(ret.final_state, State::Complete);
    }
}
