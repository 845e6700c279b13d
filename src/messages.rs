//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON frames shaped `{"type": "<kind>", "data": {...}}`.
//! [`parse_message`] turns known kinds into a typed [`ServerMessage`];
//! [`ServerMessage::into_event`] reduces it to the per-job [`JobEvent`]
//! the tracker consumes.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{ExecutionFailure, OutputRef, ProgressUpdate};

/// Message kinds this crate understands. Anything else is ignored.
const KNOWN_TYPES: &[&str] = &[
    "status",
    "queued",
    "execution_start",
    "execution_cached",
    "executing",
    "progress",
    "executed",
    "execution_success",
    "execution_error",
    "execution_interrupted",
];

/// All handled ComfyUI WebSocket message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Server status broadcast (queue depth).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A job entered the queue.
    #[serde(rename = "queued")]
    Queued(JobRef),

    /// A job has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(JobRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node is executing, or the job finished when `node` is `None`.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress within a node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The whole job finished.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(JobRef),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: Option<StatusInfo>,
    #[serde(default)]
    pub sid: Option<String>,
}

impl StatusData {
    pub fn queue_remaining(&self) -> Option<u32> {
        self.status.as_ref().map(|s| s.exec_info.queue_remaining)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusInfo {
    #[serde(default)]
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecInfo {
    #[serde(default)]
    pub queue_remaining: u32,
}

/// Payload naming only the job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRef {
    #[serde(rename = "prompt_id", alias = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(rename = "prompt_id", alias = "job_id")]
    pub job_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    #[serde(alias = "node_id")]
    pub node: Option<String>,
    #[serde(rename = "prompt_id", alias = "job_id", default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    #[serde(alias = "progress")]
    pub value: u32,
    /// Zero when the server reports only the current step.
    #[serde(default)]
    pub max: u32,
    /// Absent on older servers; the registry attributes these to the
    /// currently executing job.
    #[serde(rename = "prompt_id", alias = "job_id", default)]
    pub job_id: Option<String>,
    #[serde(default, alias = "node_id")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    #[serde(alias = "node_id")]
    pub node: String,
    #[serde(default)]
    pub output: Value,
    #[serde(rename = "prompt_id", alias = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(rename = "prompt_id", alias = "job_id")]
    pub job_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default, alias = "error")]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    #[serde(rename = "prompt_id", alias = "job_id")]
    pub job_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse a WebSocket text frame.
///
/// Returns `Ok(None)` for message kinds this crate does not handle and
/// `Err` for malformed JSON or a known kind with a malformed payload.
pub fn parse_message(text: &str) -> Result<Option<ServerMessage>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if !KNOWN_TYPES.contains(&envelope.kind.as_str()) {
        tracing::debug!(kind = %envelope.kind, "Ignoring unknown ComfyUI message");
        return Ok(None);
    }
    serde_json::from_str(text).map(Some)
}

/// A state-relevant event for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Queued,
    Started,
    Executing { node: String },
    Progress(ProgressUpdate),
    Executed { node: String, outputs: Vec<OutputRef> },
    Cached { nodes: Vec<String> },
    /// All nodes finished.
    Finished,
    Failed(ExecutionFailure),
    Interrupted,
    /// The channel dropped and came back; events may have been missed.
    Resumed,
    /// The session's event channel is gone for good.
    ChannelLost(String),
}

impl ServerMessage {
    /// Job the message belongs to, if it names one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Status(_) => None,
            ServerMessage::Queued(d)
            | ServerMessage::ExecutionStart(d)
            | ServerMessage::ExecutionSuccess(d) => Some(d.job_id.as_str()),
            ServerMessage::ExecutionCached(d) => Some(d.job_id.as_str()),
            ServerMessage::Executing(d) => d.job_id.as_deref(),
            ServerMessage::Progress(d) => d.job_id.as_deref(),
            ServerMessage::Executed(d) => Some(d.job_id.as_str()),
            ServerMessage::ExecutionError(d) => Some(d.job_id.as_str()),
            ServerMessage::ExecutionInterrupted(d) => Some(d.job_id.as_str()),
        }
    }

    /// Reduce to a routing key and a job event. Server-wide messages
    /// yield `None`.
    pub fn into_event(self) -> Option<(Option<String>, JobEvent)> {
        let routed = match self {
            ServerMessage::Status(_) => return None,
            ServerMessage::Queued(d) => (Some(d.job_id), JobEvent::Queued),
            ServerMessage::ExecutionStart(d) => (Some(d.job_id), JobEvent::Started),
            ServerMessage::ExecutionCached(d) => {
                (Some(d.job_id), JobEvent::Cached { nodes: d.nodes })
            }
            ServerMessage::Executing(d) => match d.node {
                Some(node) => (d.job_id, JobEvent::Executing { node }),
                None => (d.job_id, JobEvent::Finished),
            },
            ServerMessage::Progress(d) => (
                d.job_id,
                JobEvent::Progress(ProgressUpdate {
                    node: d.node,
                    current_step: d.value,
                    total_steps: d.max,
                }),
            ),
            ServerMessage::Executed(d) => {
                let outputs = OutputRef::from_node_output(&d.node, &d.output);
                (
                    Some(d.job_id),
                    JobEvent::Executed {
                        node: d.node,
                        outputs,
                    },
                )
            }
            ServerMessage::ExecutionSuccess(d) => (Some(d.job_id), JobEvent::Finished),
            ServerMessage::ExecutionError(d) => {
                let message = if d.exception_message.is_empty() {
                    "execution error".to_string()
                } else {
                    d.exception_message.trim().to_string()
                };
                (
                    Some(d.job_id),
                    JobEvent::Failed(ExecutionFailure {
                        message,
                        node_id: d.node_id,
                        node_type: d.node_type,
                        exception_type: d.exception_type,
                    }),
                )
            }
            ServerMessage::ExecutionInterrupted(d) => (Some(d.job_id), JobEvent::Interrupted),
        };
        Some(routed)
    }
}
