use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::config::ClientConfig;
use crate::error::{ComfyError, Result};
use crate::fetcher::{ArtifactBody, ArtifactFetcher, ArtifactSource, FetchReport};
use crate::session::ClientSession;
use crate::tracker::{JobTracker, StatusSource};
use crate::types::*;
use crate::workflow::ResolvedJobPayload;

/// What the server said when it accepted a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub job_id: String,
    /// Position assigned by the server's queue.
    pub number: Option<u64>,
}

/// A finished generation: the terminal job and its downloaded artifacts.
#[derive(Debug)]
pub struct Generation {
    pub job: Job,
    pub report: FetchReport,
}

/// Async client for a ComfyUI server instance.
///
/// Wraps one [`ClientSession`] and exposes submission, tracking, artifact
/// download and model discovery. Cloning is cheap; clones share the
/// session and its event channel.
///
/// # Example
/// ```no_run
/// use comfy_remote::{ClientConfig, ComfyClient};
///
/// # async fn example() -> comfy_remote::Result<()> {
/// let client = ComfyClient::new(ClientConfig::default())?;
/// let healthy = client.health().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ComfyClient {
    session: Arc<ClientSession>,
    config: ClientConfig,
}

impl ComfyClient {
    /// Create a client from resolved configuration. No connection is made.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let session = ClientSession::new(&config)?;
        Ok(Self {
            session: Arc::new(session),
            config,
        })
    }

    /// Client for `url` with default settings.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(ClientConfig::builder().with_server_url(url).build())
    }

    /// Returns the normalized endpoint URL.
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    /// Returns the session's client ID.
    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Close the event channel. In-flight trackers fall back to polling.
    pub async fn close(&self) {
        self.session.close().await;
    }

    fn unreachable(&self, e: reqwest::Error) -> ComfyError {
        ComfyError::Transport {
            context: format!(
                "Cannot connect to ComfyUI at {}; is the service running?",
                self.endpoint()
            ),
            source: e,
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Check whether ComfyUI is reachable via `/system_stats`.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .session
            .http()
            .get(self.session.url("/system_stats"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(resp.status().is_success())
    }

    /// Raw `/system_stats` document (versions, devices, VRAM).
    pub async fn system_stats(&self) -> Result<Value> {
        self.get_json("/system_stats", "system stats").await
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Submit a resolved payload. Returns the queued [`Job`].
    ///
    /// Submissions through one session are serialized. The event channel
    /// is opened first so the job's events are routed to this session; if
    /// that fails the job is still submitted and tracking will poll.
    pub async fn submit(&self, payload: &ResolvedJobPayload) -> Result<Job> {
        let _gate = self.session.submit_gate().await;

        if let Err(e) = self.session.ensure_channel().await {
            tracing::warn!(error = %e, "Event channel unavailable; tracking will poll");
        }

        let body = json!({
            "prompt": payload.to_prompt(),
            "client_id": self.client_id(),
        });
        let resp = self
            .session
            .http()
            .post(self.session.url("/prompt"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| ComfyError::Transport {
            context: "Failed to read ComfyUI /prompt response".into(),
            source: e,
        })?;
        let accepted = parse_submit_response(status, &text)?;

        tracing::info!(
            job_id = %accepted.job_id,
            number = ?accepted.number,
            template = %payload.template_name(),
            seed = ?payload.seed(),
            "Job queued",
        );

        let mut job = Job::new(accepted.job_id, self.client_id())
            .with_output_nodes(payload.output_nodes().iter().cloned());
        job.seed = payload.seed();
        Ok(job)
    }

    /// [`submit`](Self::submit) with up to `submit_retries` extra attempts
    /// on retryable failures. The payload, and so the seed, is reused.
    pub async fn submit_with_retry(&self, payload: &ResolvedJobPayload) -> Result<Job> {
        let mut attempt = 0u32;
        loop {
            match self.submit(payload).await {
                Ok(job) => return Ok(job),
                Err(e) if e.is_retryable() && attempt < self.config.submit_retries => {
                    attempt += 1;
                    let delay = Duration::from_secs(u64::from(attempt));
                    tracing::warn!(error = %e, attempt, "Submission failed; retrying in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Fetch the history entry for a job. Returns `None` if not yet available.
    pub async fn history(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let json = self
            .get_json(&format!("/history/{}", job_id), "history")
            .await?;
        Ok(json
            .get(job_id)
            .map(parse_history_entry))
    }

    /// Get the current ComfyUI queue state.
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let json = self.get_json("/queue", "queue status").await?;
        Ok(parse_queue(&json))
    }

    /// Server-side state of a job: history first, then the queue.
    pub async fn job_status(&self, job_id: &str) -> Result<JobSnapshot> {
        if let Some(snapshot) = self.history(job_id).await? {
            return Ok(snapshot);
        }
        let queue = self.queue_status().await?;
        Ok(match queue.position_of(job_id) {
            Some(status) => JobSnapshot::pending(status),
            None => {
                tracing::debug!(job_id, "Job not in history or queue yet");
                JobSnapshot::pending(JobStatus::Queued)
            }
        })
    }

    // ── Tracking ────────────────────────────────────────────────────

    /// Track `job` to a terminal state with the configured deadline.
    ///
    /// Uses the session's event channel when it can be opened, polling
    /// otherwise. `on_progress` is called for every sampling step.
    pub async fn track<F>(&self, job: Job, on_progress: F) -> Result<Job>
    where
        F: FnMut(&ProgressUpdate),
    {
        let events = match self.session.ensure_channel().await {
            Ok(()) => Some(self.session.subscribe(&job.id)),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Event channel unavailable; polling");
                None
            }
        };
        JobTracker::new(job)
            .run(events, self, &self.config.track_options(), on_progress)
            .await
    }

    // ── Artifacts ───────────────────────────────────────────────────

    /// Download a finished job's outputs. `dest` defaults to the configured
    /// output directory.
    pub async fn fetch(&self, job: &Job, dest: Option<&Path>) -> Result<FetchReport> {
        let dest = dest.unwrap_or(&self.config.output_dir);
        ArtifactFetcher::new(self)
            .delete_after(self.config.delete_after_download)
            .fetch(&job.outputs, dest)
            .await
    }

    /// Open a streaming download of one artifact via `/view`.
    pub async fn open_artifact(&self, output: &OutputRef) -> Result<ArtifactBody> {
        let url = reqwest::Url::parse_with_params(
            &self.session.url("/view"),
            &[
                ("filename", output.filename.as_str()),
                ("subfolder", output.subfolder.as_str()),
                ("type", output.kind.as_str()),
            ],
        )
        .map_err(|e| ComfyError::InvalidResponse(format!("Bad artifact URL: {}", e)))?;

        let resp = self
            .session
            .http()
            .get(url)
            .send()
            .await
            .map_err(|e| ComfyError::Transport {
                context: format!("Failed to fetch {} from ComfyUI", output.filename),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(ComfyError::Http {
                status: resp.status().as_u16(),
                body: format!("Failed to fetch {}", output.filename),
            });
        }

        let content_length = resp.content_length();
        let filename = output.filename.clone();
        let stream = resp
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| ComfyError::Transport {
                    context: format!("Download of {} interrupted", filename),
                    source: e,
                })
            })
            .boxed();

        Ok(ArtifactBody {
            content_length,
            stream,
        })
    }

    /// Ask the server to delete one artifact via the configured endpoint.
    pub async fn delete_artifact(&self, output: &OutputRef) -> Result<()> {
        let resp = self
            .session
            .http()
            .post(self.session.url(&self.config.delete_path))
            .json(&json!({
                "filename": output.filename,
                "subfolder": output.subfolder,
                "type": output.kind,
            }))
            .send()
            .await
            .map_err(|e| ComfyError::Transport {
                context: format!("Failed to delete {} on ComfyUI", output.filename),
                source: e,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ComfyError::Http { status, body });
        }
        Ok(())
    }

    // ── Pipeline ────────────────────────────────────────────────────

    /// Submit, track and fetch in one call.
    ///
    /// A job that ends Failed surfaces as [`ComfyError::GenerationFailed`]
    /// and nothing is downloaded.
    pub async fn generate<F>(&self, payload: &ResolvedJobPayload, on_progress: F) -> Result<Generation>
    where
        F: FnMut(&ProgressUpdate),
    {
        let job = self.submit_with_retry(payload).await?;
        let job = self.track(job, on_progress).await?;

        if job.status == JobStatus::Failed {
            let reason = job
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".into());
            return Err(ComfyError::GenerationFailed(reason));
        }

        let report = self.fetch(&job, None).await?;
        Ok(Generation { job, report })
    }

    // ── Model discovery ─────────────────────────────────────────────

    /// List available checkpoint models from ComfyUI.
    pub async fn checkpoints(&self) -> Result<Vec<String>> {
        self.object_info_list(
            "CheckpointLoaderSimple",
            "/CheckpointLoaderSimple/input/required/ckpt_name/0",
        )
        .await
    }

    /// List available sampler algorithms from ComfyUI.
    pub async fn samplers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/sampler_name/0")
            .await
    }

    /// List available scheduler algorithms from ComfyUI.
    pub async fn schedulers(&self) -> Result<Vec<String>> {
        self.object_info_list("KSampler", "/KSampler/input/required/scheduler/0")
            .await
    }

    /// Node definitions from `/object_info`, for one node class or all.
    pub async fn object_info(&self, node: Option<&str>) -> Result<Value> {
        let path = match node {
            Some(n) => format!("/object_info/{}", n),
            None => "/object_info".to_string(),
        };
        self.get_json(&path, "object_info").await
    }

    async fn object_info_list(&self, node: &str, pointer: &str) -> Result<Vec<String>> {
        let json = self.object_info(Some(node)).await?;
        Ok(string_list(&json, pointer))
    }

    async fn get_json(&self, path: &str, what: &str) -> Result<Value> {
        let resp = self
            .session
            .http()
            .get(self.session.url(path))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ComfyError::Http { status, body });
        }

        resp.json().await.map_err(|e| ComfyError::Transport {
            context: format!("Failed to parse ComfyUI {} response", what),
            source: e,
        })
    }
}

impl StatusSource for ComfyClient {
    async fn job_snapshot(&self, job_id: &str) -> Result<JobSnapshot> {
        self.job_status(job_id).await
    }
}

impl ArtifactSource for ComfyClient {
    async fn open(&self, output: &OutputRef) -> Result<ArtifactBody> {
        self.open_artifact(output).await
    }

    async fn delete(&self, output: &OutputRef) -> Result<()> {
        self.delete_artifact(output).await
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Map a `/prompt` response to an accepted job or a typed error.
pub(crate) fn parse_submit_response(status: u16, body: &str) -> Result<Accepted> {
    let json: Option<Value> = serde_json::from_str(body).ok();

    if !(200..300).contains(&status) {
        let rejected = (400..500).contains(&status)
            && json
                .as_ref()
                .is_some_and(|j| j.get("error").is_some() || j.get("node_errors").is_some());
        if rejected {
            let diagnostic = json
                .as_ref()
                .map(describe_rejection)
                .unwrap_or_else(|| body.to_string());
            return Err(ComfyError::Submission {
                status: Some(status),
                diagnostic,
            });
        }
        return Err(ComfyError::Http {
            status,
            body: body.to_string(),
        });
    }

    let json = json.ok_or_else(|| {
        ComfyError::InvalidResponse(format!("ComfyUI /prompt returned non-JSON body: {}", body))
    })?;

    if json
        .get("node_errors")
        .and_then(|v| v.as_object())
        .is_some_and(|errors| !errors.is_empty())
    {
        return Err(ComfyError::Submission {
            status: Some(status),
            diagnostic: describe_rejection(&json),
        });
    }

    let job_id = json
        .get("prompt_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ComfyError::InvalidResponse("Response missing prompt_id".into()))?;

    Ok(Accepted {
        job_id: job_id.to_string(),
        number: json.get("number").and_then(|v| v.as_u64()),
    })
}

/// Flatten ComfyUI's `{error, node_errors}` document into readable lines.
fn describe_rejection(json: &Value) -> String {
    let mut lines = Vec::new();

    if let Some(error) = json.get("error") {
        match error {
            Value::String(s) => lines.push(s.clone()),
            _ => lines.push(describe_error_item(error)),
        }
    }

    if let Some(nodes) = json.get("node_errors").and_then(|v| v.as_object()) {
        for (node_id, detail) in nodes {
            let class_type = detail
                .get("class_type")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let errors = detail
                .get("errors")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .map(describe_error_item)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            lines.push(format!("node {} ({}): {}", node_id, class_type, errors));
        }
    }

    if lines.is_empty() {
        json.to_string()
    } else {
        lines.join("\n")
    }
}

fn describe_error_item(item: &Value) -> String {
    let message = item
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error");
    match item.get("details").and_then(|v| v.as_str()) {
        Some(details) if !details.is_empty() => format!("{}: {}", message, details),
        _ => message.to_string(),
    }
}

/// Reduce one `/history/{id}` entry to a snapshot.
pub(crate) fn parse_history_entry(entry: &Value) -> JobSnapshot {
    let status_str = entry
        .pointer("/status/status_str")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let completed = entry
        .pointer("/status/completed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut outputs = Vec::new();
    if let Some(nodes) = entry.get("outputs").and_then(|o| o.as_object()) {
        for (node_id, node_output) in nodes {
            outputs.extend(OutputRef::from_node_output(node_id, node_output));
        }
    }

    if status_str == "error" {
        return JobSnapshot {
            status: JobStatus::Failed,
            outputs,
            error: Some(history_failure(entry)),
        };
    }
    let status = if completed || status_str == "success" {
        JobStatus::Completed
    } else {
        JobStatus::Running
    };
    JobSnapshot {
        status,
        outputs,
        error: None,
    }
}

/// Pull the failure detail out of a history entry's status messages.
fn history_failure(entry: &Value) -> ExecutionFailure {
    let messages = entry
        .pointer("/status/messages")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for message in messages.iter().rev() {
        let kind = message.get(0).and_then(|v| v.as_str());
        let data = message.get(1);
        match kind {
            Some("execution_error") => {
                let field = |name: &str| {
                    data.and_then(|d| d.get(name))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                };
                return ExecutionFailure {
                    message: field("exception_message")
                        .map(|m| m.trim().to_string())
                        .unwrap_or_else(|| "execution error".into()),
                    node_id: field("node_id"),
                    node_type: field("node_type"),
                    exception_type: field("exception_type"),
                };
            }
            Some("execution_interrupted") => return ExecutionFailure::new("interrupted"),
            _ => {}
        }
    }
    ExecutionFailure::new("ComfyUI generation failed")
}

/// Parse `/queue`. Entries are `[number, prompt_id, prompt, extra, outputs]`.
pub(crate) fn parse_queue(json: &Value) -> QueueStatus {
    let ids = |key: &str| -> Vec<String> {
        json.get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(1).and_then(|v| v.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };
    let count = |key: &str| {
        json.get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u32)
            .unwrap_or(0)
    };

    QueueStatus {
        running: count("queue_running"),
        pending: count("queue_pending"),
        running_ids: ids("queue_running"),
        pending_ids: ids("queue_pending"),
    }
}

fn string_list(json: &Value, pointer: &str) -> Vec<String> {
    json.pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
