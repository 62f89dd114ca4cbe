//! Test doubles for the external collaborators: scriptable jobs, a job
//! factory, and recording RPC clients.
//!
//! These are used by the crate's own tests and are public so embedders can
//! exercise chains end-to-end without real job implementations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;

use crate::client::{ClientError, JRClient, RMClient};
use crate::job::{Factory, Job, JobError, Return};
use crate::proto::{
    JobArgs, JobChain, JobLog, JobStatus, State, StatusFilter, SuspendedJobChain,
};
use crate::sync::Interrupt;

type CreateFn = dyn Fn(&mut JobArgs) -> Result<(), JobError> + Send + Sync;

/// How a mock job behaves when run.
#[derive(Clone, Default)]
pub struct RunBehavior {
    /// How long each run attempt takes.
    pub sleep: Duration,
    /// Per-try results; the last entry repeats. Empty means complete
    /// immediately.
    pub results: Vec<Return>,
    /// Entries merged into the chain-scoped job data on each run.
    pub set_data: JobArgs,
}

impl RunBehavior {
    pub fn results(results: Vec<Return>) -> Self {
        RunBehavior {
            results,
            ..RunBehavior::default()
        }
    }

    pub fn sleep(duration: Duration) -> Self {
        RunBehavior {
            sleep: duration,
            ..RunBehavior::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.set_data.insert(key.to_string(), value);
        self
    }
}

/// Scriptable job factory: behavior is registered per job type.
#[derive(Clone, Default)]
pub struct MockJobFactory {
    creates: Arc<Mutex<HashMap<String, Arc<CreateFn>>>>,
    behaviors: Arc<Mutex<HashMap<String, RunBehavior>>>,
    failing_types: Arc<Mutex<HashSet<String>>>,
    runs: Arc<Mutex<Vec<String>>>,
    data_seen: Arc<Mutex<HashMap<String, JobArgs>>>,
}

impl MockJobFactory {
    pub fn new() -> Self {
        MockJobFactory::default()
    }

    /// Registers request-time create behavior for a job type.
    pub fn on_create(
        &self,
        job_type: &str,
        f: impl Fn(&mut JobArgs) -> Result<(), JobError> + Send + Sync + 'static,
    ) {
        self.creates
            .lock()
            .unwrap()
            .insert(job_type.to_string(), Arc::new(f));
    }

    /// Registers run behavior for a job type.
    pub fn on_run(&self, job_type: &str, behavior: RunBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(job_type.to_string(), behavior);
    }

    /// Makes `make` fail for a job type, for factory-error paths.
    pub fn fail_make(&self, job_type: &str) {
        self.failing_types
            .lock()
            .unwrap()
            .insert(job_type.to_string());
    }

    /// Names of jobs run so far, in run order.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    /// The chain-scoped data a job saw on its most recent run.
    pub fn data_seen(&self, job_name: &str) -> Option<JobArgs> {
        self.data_seen.lock().unwrap().get(job_name).cloned()
    }
}

impl Factory for MockJobFactory {
    fn make(&self, job_type: &str, job_name: &str) -> Result<Box<dyn Job>, JobError> {
        if self.failing_types.lock().unwrap().contains(job_type) {
            return Err(JobError::UnknownType(job_type.to_string()));
        }
        Ok(Box::new(MockJob {
            name: job_name.to_string(),
            create: self.creates.lock().unwrap().get(job_type).cloned(),
            behavior: self
                .behaviors
                .lock()
                .unwrap()
                .get(job_type)
                .cloned()
                .unwrap_or_default(),
            args: Mutex::new(JobArgs::new()),
            stop: Interrupt::new(),
            run_log: self.runs.clone(),
            data_seen: self.data_seen.clone(),
        }))
    }
}

pub struct MockJob {
    name: String,
    create: Option<Arc<CreateFn>>,
    behavior: RunBehavior,
    args: Mutex<JobArgs>,
    stop: Interrupt,
    run_log: Arc<Mutex<Vec<String>>>,
    data_seen: Arc<Mutex<HashMap<String, JobArgs>>>,
}

#[async_trait]
impl Job for MockJob {
    fn create(&mut self, args: &mut JobArgs) -> Result<(), JobError> {
        if let Some(create) = &self.create {
            create(args)?;
        }
        *self.args.lock().unwrap() = args.clone();
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(&*self.args.lock().unwrap())
            .map_err(|e| JobError::Other(anyhow::anyhow!(e)))
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), JobError> {
        if bytes.is_empty() {
            return Ok(());
        }
        *self.args.lock().unwrap() =
            serde_json::from_slice(bytes).map_err(|e| JobError::Other(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn run(&self, data: &mut JobArgs) -> Result<Return, JobError> {
        // Results index by runs of this job name across instances, so
        // scripted failures span retries, sequence retries, and resumes
        let try_no = {
            let mut log = self.run_log.lock().unwrap();
            let prior = log.iter().filter(|name| *name == &self.name).count();
            log.push(self.name.clone());
            prior
        };
        self.data_seen
            .lock()
            .unwrap()
            .insert(self.name.clone(), data.clone());

        if !self.behavior.sleep.is_zero() {
            select! {
                _ = tokio::time::sleep(self.behavior.sleep) => {}
                _ = self.stop.wait() => {
                    return Ok(Return::fail(1, "stopped"));
                }
            }
        }

        data.extend(self.behavior.set_data.clone());

        let result = self
            .behavior
            .results
            .get(try_no)
            .or_else(|| self.behavior.results.last())
            .cloned()
            .unwrap_or_else(Return::complete);
        Ok(result)
    }

    fn stop(&self) -> Result<(), JobError> {
        self.stop.trigger();
        Ok(())
    }

    fn status(&self) -> String {
        format!("mock job {}", self.name)
    }
}

/// Records everything a traverser reports back to the Request Manager.
#[derive(Default)]
pub struct MockRMClient {
    job_logs: Mutex<Vec<JobLog>>,
    finished: Mutex<Vec<(String, State)>>,
    suspended: Mutex<Vec<SuspendedJobChain>>,
    fail_job_logs: AtomicU32,
}

impl MockRMClient {
    pub fn new() -> Self {
        MockRMClient::default()
    }

    pub fn job_logs(&self) -> Vec<JobLog> {
        self.job_logs.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<(String, State)> {
        self.finished.lock().unwrap().clone()
    }

    pub fn suspended(&self) -> Vec<SuspendedJobChain> {
        self.suspended.lock().unwrap().clone()
    }

    /// Fails the next `count` job-log calls with a transient error.
    pub fn fail_next_job_logs(&self, count: u32) {
        self.fail_job_logs.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RMClient for MockRMClient {
    async fn create_job_log(&self, _request_id: &str, job_log: JobLog) -> Result<(), ClientError> {
        let remaining = self.fail_job_logs.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_job_logs.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Transient("forced job log error".to_string()));
        }
        self.job_logs.lock().unwrap().push(job_log);
        Ok(())
    }

    async fn suspend_request(
        &self,
        _request_id: &str,
        sjc: SuspendedJobChain,
    ) -> Result<(), ClientError> {
        self.suspended.lock().unwrap().push(sjc);
        Ok(())
    }

    async fn finish_request(&self, request_id: &str, state: State) -> Result<(), ClientError> {
        self.finished
            .lock()
            .unwrap()
            .push((request_id.to_string(), state));
        Ok(())
    }
}

/// Records chains shipped to a Job Runner.
#[derive(Default)]
pub struct MockJRClient {
    pub new_chains: Mutex<Vec<JobChain>>,
    pub resumed: Mutex<Vec<SuspendedJobChain>>,
}

#[async_trait]
impl JRClient for MockJRClient {
    async fn new_job_chain(&self, base_url: &str, chain: JobChain) -> Result<String, ClientError> {
        let request_id = chain.request_id.clone();
        self.new_chains.lock().unwrap().push(chain);
        Ok(format!("{base_url}/api/v1/job-chains/{request_id}"))
    }

    async fn resume_job_chain(
        &self,
        base_url: &str,
        sjc: SuspendedJobChain,
    ) -> Result<String, ClientError> {
        let request_id = sjc.request_id.clone();
        self.resumed.lock().unwrap().push(sjc);
        Ok(format!("{base_url}/api/v1/job-chains/{request_id}"))
    }

    async fn start_request(&self, _base_url: &str, _request_id: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn stop_request(&self, _base_url: &str, _request_id: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn running(
        &self,
        _base_url: &str,
        _filter: StatusFilter,
    ) -> Result<Vec<JobStatus>, ClientError> {
        Ok(Vec::new())
    }
}
