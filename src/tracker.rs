//! Drives a submitted [`Job`] to a terminal state.
//!
//! [`JobTracker::run`] consumes the job's [`JobEvents`] from the session's
//! event channel. When no channel is available, or the session reports it
//! lost, the tracker falls back to polling a [`StatusSource`] until the job
//! finishes or the deadline passes. A quiet channel is backed by an
//! occasional status check.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ComfyError, Result};
use crate::messages::JobEvent;
use crate::session::JobEvents;
use crate::types::{ExecutionFailure, Job, JobSnapshot, JobStatus, OutputRef, ProgressUpdate};

/// Reads the server-side state of a job.
///
/// Implemented by [`crate::ComfyClient`] over `/history` and `/queue`.
pub trait StatusSource: Send + Sync {
    fn job_snapshot(&self, job_id: &str) -> impl Future<Output = Result<JobSnapshot>> + Send;
}

/// Poll intervals of channel silence before the server is asked directly.
const QUIET_POLL_FACTOR: u32 = 5;

/// Deadline and poll cadence for one tracking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// State machine for one job.
#[derive(Debug, Clone)]
pub struct JobTracker {
    job: Job,
}

impl JobTracker {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Apply one event. Events after a terminal state are ignored.
    pub fn apply(&mut self, event: &JobEvent) {
        if self.job.is_terminal() {
            tracing::trace!(job_id = %self.job.id, ?event, "Ignoring event after terminal state");
            return;
        }

        match event {
            JobEvent::Queued => {}
            JobEvent::Started | JobEvent::Progress(_) => self.mark_running(),
            JobEvent::Executing { node } => {
                self.mark_running();
                tracing::debug!(job_id = %self.job.id, node = %node, "Executing node");
            }
            JobEvent::Cached { nodes } => {
                tracing::debug!(job_id = %self.job.id, cached = nodes.len(), "Nodes served from cache");
            }
            JobEvent::Executed { node, outputs } => {
                self.mark_running();
                if self.is_output_node(node) {
                    self.merge_outputs(outputs.iter().cloned());
                }
            }
            JobEvent::Finished => {
                self.job.status = JobStatus::Completed;
                tracing::info!(
                    job_id = %self.job.id,
                    outputs = self.job.outputs.len(),
                    "Job completed",
                );
            }
            JobEvent::Failed(failure) => self.fail(failure.clone()),
            JobEvent::Interrupted => self.fail(ExecutionFailure::new("interrupted")),
            JobEvent::Resumed | JobEvent::ChannelLost(_) => {}
        }
    }

    /// Apply a polled snapshot. Never moves a job backwards.
    pub fn apply_snapshot(&mut self, snapshot: JobSnapshot) {
        if self.job.is_terminal() {
            return;
        }
        match snapshot.status {
            JobStatus::Queued => {}
            JobStatus::Running => self.mark_running(),
            JobStatus::Completed => {
                self.merge_outputs(snapshot.outputs);
                self.apply(&JobEvent::Finished);
            }
            JobStatus::Failed => {
                let failure = snapshot
                    .error
                    .unwrap_or_else(|| ExecutionFailure::new("execution failed"));
                self.fail(failure);
            }
        }
    }

    /// Track until the job is terminal or `options.timeout` elapses.
    ///
    /// `events` is `None` when no event channel could be opened; tracking
    /// then polls from the start. With a channel, the server is asked once
    /// right after subscribing and again every few poll intervals while the
    /// channel stays quiet, so a job whose events were missed still
    /// finishes. Returns the job in its terminal state, whether Completed
    /// or Failed. Dropping the future abandons tracking without touching
    /// the remote job.
    pub async fn run<S, F>(
        mut self,
        events: Option<JobEvents>,
        status: &S,
        options: &TrackOptions,
        mut on_progress: F,
    ) -> Result<Job>
    where
        S: StatusSource,
        F: FnMut(&ProgressUpdate),
    {
        let job_id = self.job.id.clone();
        let deadline = Instant::now() + options.timeout;

        tracing::debug!(job_id = %job_id, listening = events.is_some(), "Tracking job");

        let tracked = tokio::time::timeout_at(deadline, async {
            self.drive(events, status, options, &mut on_progress).await;
            if self.job.status == JobStatus::Completed && self.job.outputs.is_empty() {
                // Fully cached runs report no `executed` events.
                match status.job_snapshot(&self.job.id).await {
                    Ok(snapshot) => self.merge_outputs(snapshot.outputs),
                    Err(e) => {
                        tracing::warn!(job_id = %self.job.id, error = %e, "Could not read outputs from history");
                    }
                }
            }
        })
        .await;

        if tracked.is_err() {
            tracing::warn!(job_id = %job_id, status = %self.job.status, "Tracking deadline reached");
            return Err(ComfyError::TrackingTimeout {
                job_id,
                waited: options.timeout,
            });
        }

        Ok(self.job)
    }

    /// Follow events, then poll, until the job is terminal.
    async fn drive<S, F>(
        &mut self,
        events: Option<JobEvents>,
        status: &S,
        options: &TrackOptions,
        on_progress: &mut F,
    ) where
        S: StatusSource,
        F: FnMut(&ProgressUpdate),
    {
        if let Some(mut rx) = events {
            // The job may have progressed before the subscription existed.
            self.poll_once(status).await;
            if self.job.is_terminal() {
                return;
            }

            let quiet = options.poll_interval.saturating_mul(QUIET_POLL_FACTOR);
            let mut check = tokio::time::interval_at(Instant::now() + quiet, quiet);
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let next = tokio::select! {
                    event = rx.recv() => Some(event),
                    _ = check.tick() => None,
                };
                match next {
                    None => {
                        tracing::debug!(job_id = %self.job.id, "Event channel quiet; checking status");
                        self.poll_once(status).await;
                    }
                    Some(None) => break,
                    Some(Some(JobEvent::ChannelLost(reason))) => {
                        tracing::warn!(job_id = %self.job.id, %reason, "Event channel lost; polling for status");
                        break;
                    }
                    Some(Some(JobEvent::Resumed)) => {
                        tracing::debug!(job_id = %self.job.id, "Event channel resumed; checking status");
                        self.poll_once(status).await;
                    }
                    Some(Some(JobEvent::Progress(progress))) => {
                        self.apply(&JobEvent::Progress(progress.clone()));
                        on_progress(&progress);
                        check.reset();
                    }
                    Some(Some(other)) => {
                        self.apply(&other);
                        check.reset();
                    }
                }
                if self.job.is_terminal() {
                    return;
                }
            }
        }

        let mut ticker = tokio::time::interval(options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once(status).await;
            if self.job.is_terminal() {
                return;
            }
        }
    }

    async fn poll_once<S: StatusSource>(&mut self, status: &S) {
        match status.job_snapshot(&self.job.id).await {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(e) => {
                tracing::warn!(job_id = %self.job.id, error = %e, "Status poll failed; retrying");
            }
        }
    }

    fn mark_running(&mut self) {
        if self.job.status == JobStatus::Queued {
            self.job.status = JobStatus::Running;
            tracing::info!(job_id = %self.job.id, "Job started");
        }
    }

    fn fail(&mut self, failure: ExecutionFailure) {
        tracing::error!(job_id = %self.job.id, error = %failure, "Job failed");
        self.job.status = JobStatus::Failed;
        self.job.error = Some(failure);
    }

    fn is_output_node(&self, node: &str) -> bool {
        self.job.output_nodes.is_empty() || self.job.output_nodes.iter().any(|n| n == node)
    }

    fn merge_outputs(&mut self, outputs: impl IntoIterator<Item = OutputRef>) {
        for output in outputs {
            if self.is_output_node(&output.node_id) && !self.job.outputs.contains(&output) {
                self.job.outputs.push(output);
            }
        }
    }
}
