//! Reconciliation job queue.
//!
//! Facade operations persist intent, then push a job here. The worker drains
//! the queue in the background; jobs carry names only and re-read
//! everything they need from the store when they run.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::{SchedulerError, SchedulerResult};

/// Lane key for jobs that are not tied to a single app.
pub const GLOBAL_LANE: &str = "_ingress";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Roll out a release and activate it.
    Deploy { app: String, version: u32 },
    /// Bring instance counts in line with the process definitions.
    Reconcile { app: String },
    /// Stop and start every desired instance.
    Restart { app: String },
    /// Stop everything an app runs and purge its records.
    Teardown { app: String },
    /// Rewrite the ingress rule file from the domain table.
    SyncIngress,
}

impl Job {
    pub fn app(&self) -> Option<&str> {
        match self {
            Job::Deploy { app, .. }
            | Job::Reconcile { app }
            | Job::Restart { app }
            | Job::Teardown { app } => Some(app),
            Job::SyncIngress => None,
        }
    }

    /// Serialization key: jobs sharing a lane run one at a time, in order.
    pub fn lane(&self) -> &str {
        self.app().unwrap_or(GLOBAL_LANE)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Deploy { .. } => "deploy",
            Job::Reconcile { .. } => "reconcile",
            Job::Restart { .. } => "restart",
            Job::Teardown { .. } => "teardown",
            Job::SyncIngress => "sync_ingress",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Deploy { app, version } => write!(f, "deploy {app}/v{version}"),
            Job::SyncIngress => f.write_str("sync_ingress"),
            other => write!(f, "{} {}", other.kind(), other.lane()),
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn job_queue() -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobSender { tx }, JobReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct JobSender {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobSender {
    pub fn enqueue(&self, job: Job) -> SchedulerResult<()> {
        tracing::debug!(%job, "job enqueued");
        self.tx.send(job).map_err(|_| SchedulerError::QueueClosed)
    }
}

#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl JobReceiver {
    /// Wait for the next job. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Job> {
        self.rx.recv().await
    }

    /// Next job if one is already queued.
    pub fn try_next(&mut self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}
