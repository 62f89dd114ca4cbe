//! Reapers: the per-chain post-processors for finished jobs.
//!
//! Three variants share one capability set `{run, stop}` and one
//! `done-job` receiver. The traverser holds exactly one active reaper at a
//! time; the running reaper is swapped for the stopped or suspended
//! variant when the chain is stopped or the runner shuts down, and the
//! prior reaper has fully returned before the next one starts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info};

use crate::client::RMClient;
use crate::proto::{Job, JobLog, State};
use crate::retry::retry;
use crate::runner;
use crate::sync::Interrupt;

use super::Chain;

/// Attempts for sending a job log to the RM.
const JOB_LOG_TRIES: u32 = 3;
const JOB_LOG_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Attempts for sending chain state / SJC to the RM.
const REAPER_TRIES: u32 = 5;
const REAPER_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Poll interval for re-checking the runner repo while draining.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// A finished job as the worker hands it to the reaper: final state plus
/// the run detail that only the worker knows.
#[derive(Clone, Debug)]
pub(crate) struct DoneJob {
    pub job: Job,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

#[async_trait]
pub(crate) trait Reaper: Send + Sync {
    async fn run(&self);
    fn stop(&self);
}

/// State shared by all three reaper variants.
pub(crate) struct ReaperCore {
    pub chain: Arc<Chain>,
    pub rm_client: Arc<dyn RMClient>,
    pub runner_repo: runner::Repo,
    pub done_rx: Arc<AsyncMutex<mpsc::Receiver<DoneJob>>>,
}

impl ReaperCore {
    /// Records a finished job: final state into the chain, one JobLog to
    /// the RM.
    async fn record(&self, done: &DoneJob) {
        self.chain.set_job_state(&done.job.id, done.job.state);

        let (_, total_tries) = self.chain.job_tries(&done.job.id);
        let request_id = self.chain.request_id();
        let job_log = JobLog {
            request_id: request_id.clone(),
            job_id: done.job.id.clone(),
            name: done.job.name.clone(),
            job_type: done.job.job_type.clone(),
            tries: total_tries,
            started_at: done.started_at,
            finished_at: done.finished_at,
            state: done.job.state,
            exit: if done.job.state == State::Complete { 0 } else { 1 },
            error: done.error.clone().unwrap_or_default(),
        };
        let sent = retry(JOB_LOG_TRIES, JOB_LOG_RETRY_WAIT, || {
            self.rm_client.create_job_log(&request_id, job_log.clone())
        })
        .await;
        if let Err(err) = sent {
            error!(
                request_id,
                job_id = done.job.id,
                "problem sending job log to the Request Manager: {err}"
            );
        }
    }

    /// Sets the chain's final state and reports it to the RM. A chain
    /// whose final state was already reported is left alone, so a reaper
    /// swap racing a normal finish can't report twice.
    async fn finalize(&self, complete: bool) {
        if matches!(self.chain.state(), State::Complete | State::Fail) {
            return;
        }
        let state = if complete { State::Complete } else { State::Fail };
        self.chain.set_state(state);
        let request_id = self.chain.request_id();
        info!(request_id, %state, "chain finished");

        let sent = retry(REAPER_TRIES, REAPER_RETRY_WAIT, || {
            self.rm_client.finish_request(&request_id, state)
        })
        .await;
        if let Err(err) = sent {
            error!(request_id, "problem sending final chain state: {err}");
        }
    }
}

/// Builds the three reaper variants over shared traverser state.
pub(crate) struct ReaperFactory {
    pub chain: Arc<Chain>,
    pub rm_client: Arc<dyn RMClient>,
    pub runner_repo: runner::Repo,
    pub done_rx: Arc<AsyncMutex<mpsc::Receiver<DoneJob>>>,
}

impl ReaperFactory {
    fn core(&self) -> ReaperCore {
        ReaperCore {
            chain: self.chain.clone(),
            rm_client: self.rm_client.clone(),
            runner_repo: self.runner_repo.clone(),
            done_rx: self.done_rx.clone(),
        }
    }

    pub fn make_running(&self, run_job_tx: mpsc::Sender<Job>) -> Arc<RunningChainReaper> {
        Arc::new(RunningChainReaper {
            core: self.core(),
            run_job_tx: Mutex::new(Some(run_job_tx)),
            stop: Interrupt::new(),
        })
    }

    pub fn make_stopped(&self) -> Arc<StoppedChainReaper> {
        Arc::new(StoppedChainReaper {
            core: self.core(),
            stop: Interrupt::new(),
        })
    }

    pub fn make_suspended(&self) -> Arc<SuspendedChainReaper> {
        Arc::new(SuspendedChainReaper {
            core: self.core(),
            stop: Interrupt::new(),
        })
    }
}

/// Normal-operation reaper: records finished jobs, enqueues successors,
/// drives sequence retries, and posts the final chain state when the chain
/// is done.
pub(crate) struct RunningChainReaper {
    core: ReaperCore,
    /// Held for the duration of `run`; dropping it on return closes the
    /// run-job channel, which in turn ends the traverser's job loop.
    run_job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    stop: Interrupt,
}

impl RunningChainReaper {
    async fn reap(&self, tx: &mpsc::Sender<Job>, done: DoneJob) {
        let job_id = done.job.id.clone();
        debug!(job_id, state = %done.job.state, "reaping job");
        self.core.record(&done).await;

        if done.job.state == State::Complete {
            // Data set by this job flows to its successors; enqueue every
            // successor that is now runnable.
            for next_id in self.core.chain.next_job_ids(&job_id) {
                self.core.chain.merge_job_data(&job_id, &next_id);
            }
            for next in self.core.chain.runnable_next_jobs(&job_id) {
                debug!(job_id = next.id, "enqueueing next job");
                let _ = tx.send(next).await;
            }
        }

        // Whatever this job's own fate, its sequence may now be due a
        // retry: a sibling failed earlier and this was the last job of
        // the sequence still running.
        self.maybe_retry_sequence(tx, &job_id).await;
    }

    /// Retries the sequence owning `job_id` if it has a terminally failed
    /// job, tries remain, and every job in the sequence has settled. The
    /// sequence start itself failing is not retryable.
    async fn maybe_retry_sequence(&self, tx: &mpsc::Sender<Job>, job_id: &str) {
        let chain = &self.core.chain;
        let Some(failed) = chain.failed_job_in_sequence(job_id) else {
            return;
        };
        if chain.is_sequence_start_job(&failed)
            || !chain.can_retry_sequence(&failed)
            || !chain.is_sequence_settled(&failed)
        {
            return;
        }
        if let Some(start) = chain.prepare_sequence_retry(&failed) {
            info!(
                job_id = failed,
                sequence_id = start.id,
                "job failed, retrying sequence"
            );
            let _ = tx.send(start).await;
        }
    }
}

#[async_trait]
impl Reaper for RunningChainReaper {
    async fn run(&self) {
        let tx = match self.run_job_tx.lock().unwrap().take() {
            Some(tx) => tx,
            None => return,
        };
        let mut rx = self.core.done_rx.lock().await;

        loop {
            let (done, complete) = self.core.chain.is_done_running();
            if done {
                self.core.finalize(complete).await;
                break;
            }
            select! {
                biased;

                _ = self.stop.wait() => break,

                maybe_done = rx.recv() => {
                    match maybe_done {
                        Some(done_job) => self.reap(&tx, done_job).await,
                        None => break,
                    }
                }
            }
        }
        // rx unlocks and tx drops here: the next reaper may take over, and
        // the run-job channel closes once the seed sender is gone too
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

/// Post-stop reaper: records final job states but never enqueues more
/// work. Posts the final chain state once all running jobs have settled.
pub(crate) struct StoppedChainReaper {
    core: ReaperCore,
    stop: Interrupt,
}

#[async_trait]
impl Reaper for StoppedChainReaper {
    async fn run(&self) {
        let mut rx = self.core.done_rx.lock().await;

        while self.core.runner_repo.count() > 0 {
            select! {
                biased;

                _ = self.stop.wait() => return,

                maybe_done = rx.recv() => {
                    match maybe_done {
                        Some(done_job) => self.core.record(&done_job).await,
                        None => break,
                    }
                }

                // Workers deregister just after their done-send; re-check
                // the repo on a short poll so the drain loop can't wedge
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }

        let (_, complete) = self.core.chain.is_done_running();
        self.core.finalize(complete).await;
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

/// Shutdown reaper: records final job states, then hands the chain back to
/// the RM as a suspended job chain so another Job Runner can resume it.
pub(crate) struct SuspendedChainReaper {
    core: ReaperCore,
    stop: Interrupt,
}

#[async_trait]
impl Reaper for SuspendedChainReaper {
    async fn run(&self) {
        let mut rx = self.core.done_rx.lock().await;

        while self.core.runner_repo.count() > 0 {
            select! {
                biased;

                _ = self.stop.wait() => return,

                maybe_done = rx.recv() => {
                    match maybe_done {
                        Some(done_job) => self.core.record(&done_job).await,
                        None => break,
                    }
                }

                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }

        let chain = &self.core.chain;
        let (done, complete) = chain.is_done_running();
        if done {
            // The chain settled while shutting down: report it finished
            // instead of suspending.
            self.core.finalize(complete).await;
            return;
        }

        // Jobs abandoned mid-run are stopped-by-fiat: they resume by
        // re-running.
        for job_id in chain.job_ids() {
            if chain.job_state(&job_id) == State::Running {
                chain.set_job_state(&job_id, State::Stopped);
            }
        }

        let request_id = chain.request_id();
        let sjc = chain.to_suspended();
        chain.set_state(State::Suspended);
        info!(request_id, "suspending job chain");

        let sent = retry(REAPER_TRIES, REAPER_RETRY_WAIT, || {
            self.core.rm_client.suspend_request(&request_id, sjc.clone())
        })
        .await;
        if let Err(err) = sent {
            error!(request_id, "problem sending suspended job chain: {err}");
        }
    }

    fn stop(&self) {
        self.stop.trigger();
    }
}

