use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use comfy_remote::{
    ComfyError, ExecutionFailure, Job, JobEvent, JobEvents, JobSnapshot, JobStatus, JobTracker,
    OutputRef, ProgressUpdate, Result, StatusSource, TrackOptions,
};

/// Replays scripted snapshots; the last one repeats forever.
struct ScriptedStatus {
    script: Mutex<VecDeque<JobSnapshot>>,
    last: Mutex<JobSnapshot>,
    calls: AtomicUsize,
}

impl ScriptedStatus {
    fn new(script: Vec<JobSnapshot>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(JobSnapshot::pending(JobStatus::Queued)),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StatusSource for ScriptedStatus {
    async fn job_snapshot(&self, _job_id: &str) -> Result<JobSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(snapshot) = next {
            *last = snapshot;
        }
        Ok(last.clone())
    }
}

fn completed(outputs: Vec<OutputRef>) -> JobSnapshot {
    JobSnapshot {
        status: JobStatus::Completed,
        outputs,
        error: None,
    }
}

fn fox_job() -> Job {
    Job::new("job-42", "client-1").with_output_nodes(["9"])
}

fn options() -> TrackOptions {
    TrackOptions {
        timeout: Duration::from_secs(60),
        poll_interval: Duration::from_secs(2),
    }
}

fn step(current: u32, total: u32) -> JobEvent {
    JobEvent::Progress(ProgressUpdate {
        node: Some("3".into()),
        current_step: current,
        total_steps: total,
    })
}

#[tokio::test]
async fn events_drive_job_to_completion() {
    let (tx, events) = JobEvents::channel("job-42");
    for event in [
        JobEvent::Queued,
        JobEvent::Started,
        JobEvent::Executing { node: "3".into() },
        step(1, 20),
        step(20, 20),
        JobEvent::Executed {
            node: "9".into(),
            outputs: vec![OutputRef::new("9", "fox_001.png")],
        },
        JobEvent::Finished,
    ] {
        tx.send(event).unwrap();
    }

    let status = ScriptedStatus::new(vec![]);
    let mut steps = Vec::new();
    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options(), |p| steps.push(p.current_step))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs, vec![OutputRef::new("9", "fox_001.png")]);
    assert_eq!(steps, vec![1, 20]);
    // One status check right after subscribing, none afterwards.
    assert_eq!(status.calls(), 1);
}

#[tokio::test]
async fn execution_error_fails_job_with_server_detail() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::Failed(ExecutionFailure {
        message: "CUDA out of memory".into(),
        node_id: Some("3".into()),
        node_type: Some("KSampler".into()),
        exception_type: Some("torch.OutOfMemoryError".into()),
    }))
    .unwrap();
    // Late events for a terminal job must not change it.
    tx.send(JobEvent::Finished).unwrap();

    let job = JobTracker::new(fox_job())
        .run(Some(events), &ScriptedStatus::new(vec![]), &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.message, "CUDA out of memory");
    assert_eq!(error.node_type.as_deref(), Some("KSampler"));
    assert!(job.outputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn polls_when_no_channel() {
    let status = ScriptedStatus::new(vec![
        JobSnapshot::pending(JobStatus::Queued),
        JobSnapshot::pending(JobStatus::Running),
        completed(vec![OutputRef::new("9", "fox_001.png")]),
    ]);

    let job = JobTracker::new(fox_job())
        .run(None, &status, &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 1);
    assert_eq!(status.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn channel_loss_switches_to_polling() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::ChannelLost("connection reset".into())).unwrap();

    let status = ScriptedStatus::new(vec![
        JobSnapshot::pending(JobStatus::Running),
        completed(vec![OutputRef::new("9", "fox_001.png")]),
    ]);

    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs, vec![OutputRef::new("9", "fox_001.png")]);
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn resumed_channel_triggers_status_check() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::Resumed).unwrap();

    // The completion happened while the channel was down.
    let status = ScriptedStatus::new(vec![
        JobSnapshot::pending(JobStatus::Queued),
        completed(vec![OutputRef::new("9", "fox_001.png")]),
    ]);

    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(status.calls(), 2);
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn deadline_yields_tracking_timeout() {
    let status = ScriptedStatus::new(vec![JobSnapshot::pending(JobStatus::Running)]);
    let options = TrackOptions {
        timeout: Duration::from_secs(10),
        poll_interval: Duration::from_secs(2),
    };

    let err = JobTracker::new(fox_job())
        .run(None, &status, &options, |_| {})
        .await
        .unwrap_err();

    match err {
        ComfyError::TrackingTimeout { job_id, waited } => {
            assert_eq!(job_id, "job-42");
            assert_eq!(waited, Duration::from_secs(10));
        }
        other => panic!("Expected TrackingTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_channel_is_bounded_by_deadline() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();

    let options = TrackOptions {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
    };
    let result = JobTracker::new(fox_job())
        .run(Some(events), &ScriptedStatus::new(vec![]), &options, |_| {})
        .await;

    assert!(matches!(result, Err(ComfyError::TrackingTimeout { .. })));
    drop(tx);
}

#[tokio::test]
async fn cached_run_reads_outputs_from_history() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::Cached {
        nodes: vec!["1".into(), "3".into(), "9".into()],
    })
    .unwrap();
    tx.send(JobEvent::Finished).unwrap();

    let status = ScriptedStatus::new(vec![
        JobSnapshot::pending(JobStatus::Queued),
        completed(vec![
            OutputRef::new("9", "fox_001.png"),
            OutputRef::new("12", "preview.png").with_kind("temp"),
        ]),
    ]);

    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    // Only the designated output node's files are kept.
    assert_eq!(job.outputs, vec![OutputRef::new("9", "fox_001.png")]);
}

#[tokio::test]
async fn interrupted_job_is_failed() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::Interrupted).unwrap();

    let job = JobTracker::new(fox_job())
        .run(Some(events), &ScriptedStatus::new(vec![]), &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().message, "interrupted");
}

#[tokio::test(start_paused = true)]
async fn job_finished_before_subscribing_completes_on_live_channel() {
    // The channel is open but the job's events were never delivered.
    let (tx, events) = JobEvents::channel("job-42");
    let status = ScriptedStatus::new(vec![completed(vec![OutputRef::new("9", "fox_001.png")])]);

    let options = TrackOptions {
        timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(2),
    };
    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options, |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs, vec![OutputRef::new("9", "fox_001.png")]);
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn quiet_channel_falls_back_to_status_checks() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    let status = ScriptedStatus::new(vec![
        JobSnapshot::pending(JobStatus::Running),
        JobSnapshot::pending(JobStatus::Running),
        completed(vec![OutputRef::new("9", "fox_001.png")]),
    ]);

    let job = JobTracker::new(fox_job())
        .run(Some(events), &status, &options(), |_| {})
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(status.calls(), 3);
    drop(tx);
}

/// Answers the first status read, then never answers again.
struct StallingStatus {
    calls: AtomicUsize,
}

impl StatusSource for StallingStatus {
    async fn job_snapshot(&self, _job_id: &str) -> Result<JobSnapshot> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(JobSnapshot::pending(JobStatus::Queued));
        }
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn cached_output_lookup_respects_deadline() {
    let (tx, events) = JobEvents::channel("job-42");
    tx.send(JobEvent::Started).unwrap();
    tx.send(JobEvent::Finished).unwrap();

    let status = StallingStatus {
        calls: AtomicUsize::new(0),
    };
    let options = TrackOptions {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
    };
    let result = JobTracker::new(fox_job())
        .run(Some(events), &status, &options, |_| {})
        .await;

    assert!(matches!(result, Err(ComfyError::TrackingTimeout { .. })));
    assert_eq!(status.calls.load(Ordering::SeqCst), 2);
    drop(tx);
}
