//! The per-chain scheduler on the Job Runner side.
//!
//! A traverser owns one chain for its whole life: it dispatches runnable
//! jobs to worker tasks, feeds finished jobs to the active reaper, and
//! coordinates cooperative stop and suspend-for-resume. The traverser and
//! chain have the same lifespan: the traverser removes the chain from the
//! repo when it returns.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::select;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::client::RMClient;
use crate::proto::{Job, JobChain, JobStatus, State, SuspendedJobChain};
use crate::runner;
use crate::spec::parse_duration;
use crate::sync::Interrupt;

use super::reaper::{DoneJob, Reaper, ReaperFactory};
use super::repo::RepoError;
use super::{Chain, Repo};

/// Default stop and send timeouts used by the factory.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `run` waits for a stop/suspend in progress before giving up.
const STOP_GRACE: Duration = Duration::from_secs(20);

/// Poll interval for the pending-worker rendezvous.
const PENDING_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TraverserError {
    /// Stop was called but the chain is already being suspended.
    #[error("chain not stopped because traverser is shutting down")]
    ShuttingDown,

    #[error("error adding job chain: {0}")]
    Repo(#[from] RepoError),

    #[error("timeout waiting for the job loop to drain")]
    StopDrainTimeout,

    #[error("timeout waiting for in-flight workers to register")]
    StopPendingTimeout,

    #[error("problem stopping {0} job runner(s), see logs for details")]
    StopRunners(usize),
}

enum Status {
    Running,
    Stopped,
    Suspended,
}

/// Makes traversers for new and resumed chains.
pub struct TraverserFactory {
    chain_repo: Repo,
    runner_factory: Arc<dyn runner::Factory>,
    rm_client: Arc<dyn RMClient>,
    shutdown: Interrupt,
}

impl TraverserFactory {
    pub fn new(
        chain_repo: Repo,
        runner_factory: Arc<dyn runner::Factory>,
        rm_client: Arc<dyn RMClient>,
        shutdown: Interrupt,
    ) -> Self {
        TraverserFactory {
            chain_repo,
            runner_factory,
            rm_client,
            shutdown,
        }
    }

    /// Makes a traverser for a new chain.
    pub fn make(&self, job_chain: JobChain) -> Result<Arc<Traverser>, TraverserError> {
        self.make_for_chain(Chain::new(job_chain))
    }

    /// Makes a traverser for a suspended chain. STOPPED jobs are rewritten
    /// to PENDING with their try counters decremented by one, so the next
    /// run re-produces the try number they were stopped on.
    pub fn make_from_sjc(
        &self,
        sjc: SuspendedJobChain,
    ) -> Result<Arc<Traverser>, TraverserError> {
        let request_id = sjc.request_id.clone();
        let chain = Chain::from_suspended(sjc);
        info!(request_id, "resuming request");

        for job_id in chain.job_ids() {
            if chain.job_state(&job_id) != State::Stopped {
                continue;
            }
            chain.increment_job_tries(&job_id, -1);
            chain.set_job_state(&job_id, State::Pending);
            info!(request_id, job_id, "resuming from job");

            // The previous run already counted this sequence try; the
            // worker will count it again on dispatch.
            if chain.is_sequence_start_job(&job_id) {
                chain.increment_sequence_tries(&job_id, -1);
            }
        }
        chain.set_state(State::Pending);

        self.make_for_chain(chain)
    }

    fn make_for_chain(&self, chain: Chain) -> Result<Arc<Traverser>, TraverserError> {
        let chain = Arc::new(chain);
        // Adding to the repo is what prevents this Job Runner instance
        // from accepting the same chain twice.
        self.chain_repo.add(chain.clone())?;
        Ok(Arc::new(Traverser::new(TraverserConfig {
            chain,
            chain_repo: self.chain_repo.clone(),
            runner_factory: self.runner_factory.clone(),
            rm_client: self.rm_client.clone(),
            shutdown: self.shutdown.clone(),
            stop_timeout: DEFAULT_TIMEOUT,
            send_timeout: DEFAULT_TIMEOUT,
        })))
    }
}

pub struct TraverserConfig {
    pub chain: Arc<Chain>,
    pub chain_repo: Repo,
    pub runner_factory: Arc<dyn runner::Factory>,
    pub rm_client: Arc<dyn RMClient>,
    pub shutdown: Interrupt,
    /// Time to wait for jobs to stop.
    pub stop_timeout: Duration,
    /// Time to wait for a worker's done-send before abandoning it.
    pub send_timeout: Duration,
}

struct ActiveReaper {
    reaper: Arc<dyn Reaper>,
    finished: Interrupt,
}

pub struct Traverser {
    chain: Arc<Chain>,
    chain_repo: Repo,
    runner_factory: Arc<dyn runner::Factory>,
    runner_repo: runner::Repo,
    reaper_factory: ReaperFactory,
    active_reaper: Mutex<Option<ActiveReaper>>,

    /// Host-level shutdown signal; closing it suspends the chain.
    shutdown: Interrupt,
    /// Stop signal: workers check it before starting work and during
    /// retry waits.
    stop: Interrupt,
    /// Triggered when the job loop returns (no more workers will start).
    pending_done: Interrupt,
    /// Triggered when stop/suspend cleanup finishes.
    done: Interrupt,
    /// Workers that incremented but have not yet registered their runner.
    pending: AtomicI64,
    status: AsyncMutex<Status>,

    run_job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    run_job_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    done_job_tx: mpsc::Sender<DoneJob>,

    stop_timeout: Duration,
    send_timeout: Duration,
}

impl Traverser {
    pub fn new(cfg: TraverserConfig) -> Self {
        let (run_job_tx, run_job_rx) = mpsc::channel(1);
        let (done_job_tx, done_job_rx) = mpsc::channel(1);
        let done_job_rx = Arc::new(AsyncMutex::new(done_job_rx));
        let runner_repo = runner::Repo::new();

        let reaper_factory = ReaperFactory {
            chain: cfg.chain.clone(),
            rm_client: cfg.rm_client.clone(),
            runner_repo: runner_repo.clone(),
            done_rx: done_job_rx,
        };

        Traverser {
            chain: cfg.chain,
            chain_repo: cfg.chain_repo,
            runner_factory: cfg.runner_factory,
            runner_repo,
            reaper_factory,
            active_reaper: Mutex::new(None),
            shutdown: cfg.shutdown,
            stop: Interrupt::new(),
            pending_done: Interrupt::new(),
            done: Interrupt::new(),
            pending: AtomicI64::new(0),
            status: AsyncMutex::new(Status::Running),
            run_job_tx: Mutex::new(Some(run_job_tx)),
            run_job_rx: Mutex::new(Some(run_job_rx)),
            done_job_tx,
            stop_timeout: cfg.stop_timeout,
            send_timeout: cfg.send_timeout,
        }
    }

    /// Runs the whole chain. Blocks until the chain finishes, is stopped,
    /// or is suspended.
    pub async fn run(self: Arc<Self>) {
        let request_id = self.chain.request_id();
        info!(request_id, "traverser run");

        let Some(run_job_rx) = self.run_job_rx.lock().unwrap().take() else {
            warn!(request_id, "traverser already ran");
            return;
        };
        let Some(run_job_tx) = self.run_job_tx.lock().unwrap().take() else {
            return;
        };

        // Worker loop: consumes the run-job channel until it closes, which
        // happens when the running reaper returns and drops its sender.
        tokio::spawn(self.clone().run_jobs(run_job_rx));

        // Enqueue the first runnable jobs.
        for job in self.chain.runnable_jobs() {
            info!(request_id, job_id = job.id, name = job.name, "initial job");
            if run_job_tx.send(job).await.is_err() {
                break;
            }
        }

        // The running reaper takes the sender: it is the only thing that
        // enqueues more jobs from here on.
        let running_reaper = self.reaper_factory.make_running(run_job_tx);
        let reaper_finished = self.install_reaper(running_reaper);

        select! {
            _ = reaper_finished.wait() => {
                // If the reaper exited because Stop was called, wait for
                // Stop to finish cleanup. Otherwise the chain finished
                // normally (completed or failed) and we can return.
                let stopped = matches!(*self.status.lock().await, Status::Stopped);
                if stopped {
                    self.wait_done(&request_id).await;
                }
            }
            _ = self.shutdown.wait() => {
                // The Job Runner is shutting down: suspend the chain so
                // another Job Runner can resume it.
                self.suspend().await;
                self.wait_done(&request_id).await;
            }
        }

        self.chain_repo.remove(&request_id);
        info!(request_id, "traverser run return");
    }

    /// Stops the chain: swaps in the stopped reaper and stops all running
    /// jobs. Blocks until all jobs settled and the final state was sent.
    pub async fn stop(&self) -> Result<(), TraverserError> {
        let mut status = self.status.lock().await;
        match *status {
            Status::Stopped => return Ok(()),
            Status::Suspended => return Err(TraverserError::ShuttingDown),
            Status::Running => {}
        }
        *status = Status::Stopped;
        self.stop.trigger();

        let request_id = self.chain.request_id();
        info!(request_id, "stopping traverser and all jobs");

        // The stopped reaper saves job states but doesn't enqueue more
        // work. Install it only after the running reaper fully returned:
        // they share the done-job channel.
        if let Some(active) = self.take_reaper() {
            active.reaper.stop();
            active.finished.wait().await;
        }
        let reaper_finished = self.install_reaper(self.reaper_factory.make_stopped());

        let deadline = Instant::now() + self.stop_timeout;
        let result = self.stop_running_jobs(deadline).await;
        if let Err(err) = &result {
            // Keep waiting for the reaper even if stopping had errors
            error!(request_id, "traverser stop: {err}");
        }

        select! {
            _ = reaper_finished.wait() => {}
            _ = sleep_until(deadline) => {
                warn!(request_id, "timed out waiting for jobs to stop, stopping reaper");
                if let Some(active) = self.active_reaper.lock().unwrap().as_ref() {
                    active.reaper.stop();
                }
            }
        }
        self.done.trigger();
        result
    }

    /// Suspends the chain on host shutdown: same shape as stop, but the
    /// suspended reaper posts an SJC so the chain can resume elsewhere.
    async fn suspend(&self) {
        let mut status = self.status.lock().await;
        if !matches!(*status, Status::Running) {
            return;
        }
        *status = Status::Suspended;
        self.stop.trigger();

        let request_id = self.chain.request_id();
        info!(request_id, "suspending job chain, stopping all jobs");

        if let Some(active) = self.take_reaper() {
            active.reaper.stop();
            active.finished.wait().await;
        }
        let reaper_finished = self.install_reaper(self.reaper_factory.make_suspended());

        let deadline = Instant::now() + self.stop_timeout;
        if let Err(err) = self.stop_running_jobs(deadline).await {
            error!(request_id, "problem suspending job chain: {err}");
        }

        select! {
            _ = reaper_finished.wait() => {}
            _ = sleep_until(deadline) => {
                warn!(request_id, "timed out waiting for jobs to stop, stopping reaper");
                if let Some(active) = self.active_reaper.lock().unwrap().as_ref() {
                    active.reaper.stop();
                }
            }
        }
        self.done.trigger();
    }

    /// Real-time status of all currently running jobs.
    pub fn running(&self) -> Vec<JobStatus> {
        let request_id = self.chain.request_id();
        self.runner_repo
            .items()
            .into_iter()
            .map(|(job_id, runner)| {
                let status = runner.status();
                JobStatus {
                    request_id: request_id.clone(),
                    state: self.chain.job_state(&job_id),
                    job_id,
                    job_type: status.job.job_type,
                    name: status.job.name,
                    status: status.status,
                    started_at: status.started_at,
                    tries: status.tries,
                }
            })
            .collect()
    }

    fn install_reaper(&self, reaper: Arc<dyn Reaper>) -> Interrupt {
        let finished = Interrupt::new();
        *self.active_reaper.lock().unwrap() = Some(ActiveReaper {
            reaper: reaper.clone(),
            finished: finished.clone(),
        });
        let task_finished = finished.clone();
        tokio::spawn(async move {
            reaper.run().await;
            task_finished.trigger();
        });
        finished
    }

    fn take_reaper(&self) -> Option<ActiveReaper> {
        self.active_reaper.lock().unwrap().take()
    }

    async fn wait_done(&self, request_id: &str) {
        select! {
            _ = self.done.wait() => {}
            _ = sleep(STOP_GRACE) => {
                warn!(
                    request_id,
                    "stopping or suspending the job chain took too long, exiting"
                );
            }
        }
    }

    /// The job loop: runs each job that arrives on the run-job channel in
    /// its own worker task. Exits when the channel closes.
    async fn run_jobs(self: Arc<Self>, mut run_job_rx: mpsc::Receiver<Job>) {
        debug!("job loop start");
        while let Some(job) = run_job_rx.recv().await {
            // Don't start new work while stopping; keep draining so the
            // reaper's sends never block. An unstarted job stays pending
            // with zero tries, as if it was never dispatched.
            if self.stop.is_set() {
                debug!(
                    job_id = job.id,
                    "not running job: traverser stopped or shutting down"
                );
                continue;
            }

            // Rendezvous with stop_running_jobs: +1 before the worker
            // starts, -1 only after the worker registered its runner. The
            // check happens here, not in the worker, so a closed job loop
            // plus pending == 0 guarantees the runner repo covers every
            // started-and-unfinished job.
            self.pending.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(self.clone().run_job(job));
        }
        debug!("job loop return");
        self.pending_done.trigger();
    }

    /// One worker: runs a single job to its final state and hands it to
    /// the reaper.
    async fn run_job(self: Arc<Self>, mut job: Job) {
        let request_id = self.chain.request_id();

        // A sequence start with a prior try means this is a sequence
        // retry: wait it out (interruptibly) before counting the new try.
        if self.chain.is_sequence_start_job(&job.id) {
            if self.chain.sequence_tries(&job.id) != 0 {
                let wait = parse_duration(&job.sequence_retry_wait).unwrap_or_default();
                info!(
                    request_id,
                    sequence_id = job.sequence_id,
                    wait_ms = wait.as_millis() as u64,
                    "waiting before retrying sequence"
                );
                select! {
                    _ = sleep(wait) => {}
                    _ = self.stop.wait() => {
                        debug!(request_id, job_id = job.id, "stopped during sequence retry wait");
                        self.pending.fetch_add(-1, Ordering::SeqCst);
                        return;
                    }
                }
            }
            self.chain.increment_sequence_tries(&job.id, 1);
        }

        // Try counts so far; non-zero on resumed chains, which is how the
        // runner picks up where the last run left off.
        let (cur_tries, total_tries) = self.chain.job_tries(&job.id);

        let mut error = None;
        let mut started_at = 0;
        let mut finished_at = 0;
        match self
            .runner_factory
            .make(&job, &request_id, cur_tries, total_tries)
        {
            Err(err) => {
                // Runner construction failed: the job failed without ever
                // running. The reaper records the failure.
                self.pending.fetch_add(-1, Ordering::SeqCst);
                job.state = State::Fail;
                error = Some(format!("problem creating job runner: {err}"));
            }
            Ok(runner) => {
                // Register before decrementing pending: see run_jobs.
                self.runner_repo.set(&job.id, runner.clone());
                self.pending.fetch_add(-1, Ordering::SeqCst);

                self.chain.set_job_state(&job.id, State::Running);
                debug!(request_id, job_id = job.id, "running job");
                started_at = now_unix_nanos();
                let mut data = std::mem::take(&mut job.data);
                let ret = runner.run(&mut data).await;
                finished_at = now_unix_nanos();
                job.data = data;
                self.chain.set_job_data(&job.id, job.data.clone());
                self.chain.increment_job_tries(&job.id, i64::from(ret.tries));
                job.state = ret.final_state;
                error = ret.error;
                debug!(request_id, job_id = job.id, state = %job.state, "job done");
            }
        }

        // Always hand the finished job to the reaper, but never leak this
        // task if the reaper stopped reading.
        let done = DoneJob {
            job: job.clone(),
            error,
            started_at,
            finished_at,
        };
        select! {
            sent = self.done_job_tx.send(done) => {
                if sent.is_err() {
                    warn!(request_id, job_id = job.id, "done channel closed");
                }
            }
            _ = sleep(self.send_timeout) => {
                warn!(request_id, job_id = job.id, "timed out sending job to the reaper");
            }
        }
        // Deregister only after the done-send, so the draining reapers see
        // an empty repo only once everything was reaped.
        self.runner_repo.remove(&job.id);
    }

    /// Stops all currently running jobs: wait for the job loop to drain,
    /// wait for in-flight workers to register, then stop every registered
    /// runner in parallel.
    async fn stop_running_jobs(&self, deadline: Instant) -> Result<(), TraverserError> {
        select! {
            _ = self.pending_done.wait() => {}
            _ = sleep_until(deadline) => return Err(TraverserError::StopDrainTimeout),
        }

        while self.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return Err(TraverserError::StopPendingTimeout);
            }
            sleep(PENDING_POLL).await;
        }

        let runners = self.runner_repo.items();
        info!("stopping {} active job runners", runners.len());
        let mut handles = Vec::with_capacity(runners.len());
        for (job_id, runner) in runners {
            handles.push(tokio::task::spawn_blocking(move || {
                runner.stop().map_err(|err| {
                    error!(job_id, "problem stopping job runner: {err}");
                })
            }));
        }
        let mut failed = 0;
        for handle in handles {
            if !matches!(handle.await, Ok(Ok(()))) {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(TraverserError::StopRunners(failed));
        }
        Ok(())
    }
}

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
