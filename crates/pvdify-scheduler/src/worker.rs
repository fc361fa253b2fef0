//! Background worker that drains the job queue.
//!
//! Jobs are dispatched into per-app lanes: each lane is a task that runs its
//! jobs one after another, so jobs for one app keep their order while
//! different apps proceed in parallel. Failed attempts are retried with a
//! doubling backoff and reported as observed state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pvdify_core::KeyedLocks;
use pvdify_core::config::ReconcileConfig;
use pvdify_state::ReconcileState;

use crate::error::SchedulerResult;
use crate::queue::{Job, JobReceiver};
use crate::reconciler::{Convergence, Reconciler};

/// Attempts and backoff for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

impl From<&ReconcileConfig> for RetryPolicy {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    reconciler: Arc<Reconciler>,
    locks: KeyedLocks,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(reconciler: Arc<Reconciler>, policy: RetryPolicy) -> Self {
        Self {
            reconciler,
            locks: KeyedLocks::new(),
            policy,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run one job to completion, retrying as the policy allows. Holds the
    /// job's lane lock for the whole run.
    pub async fn process(&self, job: Job) -> SchedulerResult<Convergence> {
        let _guard = self.locks.lock(job.lane()).await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.observe(&job, |obs| {
                obs.reconcile = ReconcileState::Reconciling;
                obs.attempts = attempt;
            });

            let err = match self.run_once(&job).await {
                Ok(outcome) => {
                    debug!(%job, attempt, ?outcome, "job complete");
                    self.observe(&job, |obs| {
                        obs.reconcile = ReconcileState::Converged;
                        obs.last_error = None;
                        obs.note = outcome.note.clone();
                    });
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            let message = err.to_string();
            self.observe(&job, |obs| obs.last_error = Some(message.clone()));

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                error!(%job, attempt, error = %err, "job failed, giving up");
                self.give_up(&job);
                return Err(err);
            }

            let delay = self.policy.backoff(attempt);
            warn!(%job, attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "job attempt failed");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(&self, job: &Job) -> SchedulerResult<Convergence> {
        let r = &self.reconciler;
        match job {
            Job::Deploy { app, version } => r.deploy(app, *version).await,
            Job::Reconcile { app } => r.reconcile(app).await,
            Job::Restart { app } => r.restart(app).await,
            Job::Teardown { app } => r.teardown(app).await,
            Job::SyncIngress => r.sync_ingress().await,
        }
    }

    fn give_up(&self, job: &Job) {
        if let Job::Deploy { app, version } = job {
            if let Err(e) = self.reconciler.fail_deploy(app, *version) {
                error!(%app, version, error = %e, "could not record failed deploy");
            }
        }
        self.observe(job, |obs| obs.reconcile = ReconcileState::Failed);
    }

    /// Best-effort observed-state write. Jobs without an app record nothing.
    fn observe(&self, job: &Job, f: impl FnOnce(&mut pvdify_state::AppObservation)) {
        let Some(app) = job.app() else {
            return;
        };
        if let Err(e) = self.reconciler.store().update_observation(app, f) {
            warn!(%app, error = %e, "failed to record observation");
        }
    }

    /// Process every job already queued, in order. Returns how many ran;
    /// a failed job still counts and does not stop the drain.
    pub async fn drain(&self, rx: &mut JobReceiver) -> usize {
        let mut count = 0;
        while let Some(job) = rx.try_next() {
            let label = job.to_string();
            if let Err(e) = self.process(job).await {
                warn!(job = %label, error = %e, "drained job failed");
            }
            count += 1;
        }
        count
    }

    /// Dispatch jobs into lanes until the queue closes or shutdown is
    /// signalled. In-flight lanes are aborted on shutdown; startup recovery
    /// picks their work up again from the store.
    pub async fn run(self, mut rx: JobReceiver, mut shutdown: watch::Receiver<bool>) {
        let mut lanes: HashMap<String, Lane> = HashMap::new();
        info!("reconcile worker started");

        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    self.dispatch(&mut lanes, job);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (_, lane) in lanes.drain() {
            lane.handle.abort();
        }
        info!("reconcile worker stopped");
    }

    fn dispatch(&self, lanes: &mut HashMap<String, Lane>, job: Job) {
        lanes.retain(|_, lane| !lane.handle.is_finished());
        let key = job.lane().to_string();
        let closes_lane = matches!(job, Job::Teardown { .. });

        let lane = lanes
            .entry(key.clone())
            .or_insert_with(|| Lane::spawn(self.clone(), key.clone()));
        let job = match lane.tx.send(job) {
            Ok(()) => None,
            Err(mpsc::error::SendError(job)) => Some(job),
        };
        if let Some(job) = job {
            // Lane task ended; start a fresh one.
            let lane = Lane::spawn(self.clone(), key.clone());
            let _ = lane.tx.send(job);
            lanes.insert(key.clone(), lane);
        }
        if closes_lane {
            // Dropping the sender lets the lane exit once teardown has run.
            lanes.remove(&key);
        }
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

impl Lane {
    fn spawn(worker: Worker, key: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let label = job.to_string();
                if let Err(e) = worker.process(job).await {
                    warn!(lane = %key, job = %label, error = %e, "job dropped after failure");
                }
            }
            debug!(lane = %key, "lane closed");
        });
        Self { tx, handle }
    }
}
