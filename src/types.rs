use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Real-time progress update from ComfyUI's WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Node reporting progress, when the server includes it.
    pub node: Option<String>,
    pub current_step: u32,
    pub total_steps: u32,
}

impl ProgressUpdate {
    /// Completion of the current node as a fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            0.0
        } else {
            (self.current_step as f64 / self.total_steps as f64).min(1.0)
        }
    }
}

/// Reference to an artifact stored in ComfyUI's output (or temp) directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Node that produced the artifact.
    #[serde(default)]
    pub node_id: String,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage kind on the server: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

/// Output keys under which ComfyUI nodes report file artifacts.
const ARTIFACT_KEYS: &[&str] = &["images", "gifs"];

impl OutputRef {
    pub fn new(node_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            filename: filename.into(),
            subfolder: String::new(),
            kind: default_kind(),
        }
    }

    pub fn with_subfolder(mut self, subfolder: impl Into<String>) -> Self {
        self.subfolder = subfolder.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Extract artifact references from one node's output object, as found in
    /// both `executed` events and `/history` entries.
    pub fn from_node_output(node_id: &str, output: &Value) -> Vec<OutputRef> {
        let mut refs = Vec::new();
        for key in ARTIFACT_KEYS {
            let Some(items) = output.get(*key).and_then(|v| v.as_array()) else {
                continue;
            };
            for item in items {
                let Some(filename) = item.get("filename").and_then(|f| f.as_str()) else {
                    continue;
                };
                let subfolder = item.get("subfolder").and_then(|s| s.as_str()).unwrap_or("");
                let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("output");
                refs.push(
                    OutputRef::new(node_id, filename)
                        .with_subfolder(subfolder)
                        .with_kind(kind),
                );
            }
        }
        refs
    }
}

/// Lifecycle state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error detail reported by the server for a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub exception_type: Option<String>,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node_id: None,
            node_type: None,
            exception_type: None,
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => write!(f, " (node {} {})", id, ty),
            (Some(id), None) => write!(f, " (node {})", id),
            _ => Ok(()),
        }
    }
}

/// A job submitted to ComfyUI through one client session.
///
/// Created by a successful submission; its status only changes through the
/// execution tracker.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    pub outputs: Vec<OutputRef>,
    pub error: Option<ExecutionFailure>,
    /// Seed actually sent with the workflow, if the template had one.
    pub seed: Option<u64>,
    /// Nodes whose artifacts count as final outputs. Empty means any node.
    pub output_nodes: Vec<String>,
}

impl Job {
    /// A freshly queued job. Also used to resume tracking a known job id.
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            submitted_at: Utc::now(),
            status: JobStatus::Queued,
            outputs: Vec::new(),
            error: None,
            seed: None,
            output_nodes: Vec::new(),
        }
    }

    pub fn with_output_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Server-side view of a job, as read from `/history` and `/queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub outputs: Vec<OutputRef>,
    pub error: Option<ExecutionFailure>,
}

impl JobSnapshot {
    pub fn pending(status: JobStatus) -> Self {
        Self {
            status,
            outputs: Vec::new(),
            error: None,
        }
    }
}

/// Snapshot of ComfyUI's queue state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub running: u32,
    pub pending: u32,
    #[serde(default)]
    pub running_ids: Vec<String>,
    #[serde(default)]
    pub pending_ids: Vec<String>,
}

impl QueueStatus {
    /// Where a job currently sits in the queue, if it is there at all.
    pub fn position_of(&self, job_id: &str) -> Option<JobStatus> {
        if self.running_ids.iter().any(|id| id == job_id) {
            Some(JobStatus::Running)
        } else if self.pending_ids.iter().any(|id| id == job_id) {
            Some(JobStatus::Queued)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_refs_from_node_output() {
        let output = json!({
            "images": [
                {"filename": "fox_001.png", "subfolder": "", "type": "output"},
                {"filename": "fox_002.png", "subfolder": "batch"}
            ],
            "gifs": [{"filename": "anim.webp", "type": "temp"}],
            "text": ["ignored"]
        });
        let refs = OutputRef::from_node_output("9", &output);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0], OutputRef::new("9", "fox_001.png"));
        assert_eq!(refs[1].subfolder, "batch");
        assert_eq!(refs[1].kind, "output");
        assert_eq!(refs[2].kind, "temp");
    }

    #[test]
    fn test_output_ref_wire_name() {
        let r = OutputRef::new("9", "test.png");
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"type\":\"output\""));
        assert!(json.contains("\"filename\":\"test.png\""));
    }

    #[test]
    fn test_failure_display() {
        let mut failure = ExecutionFailure::new("OOM");
        assert_eq!(failure.to_string(), "OOM");
        failure.node_id = Some("5".into());
        failure.node_type = Some("KSampler".into());
        assert_eq!(failure.to_string(), "OOM (node 5 KSampler)");
    }

    #[test]
    fn test_progress_fraction() {
        let p = ProgressUpdate {
            node: None,
            current_step: 5,
            total_steps: 20,
        };
        assert_eq!(p.fraction(), 0.25);
        let zero = ProgressUpdate {
            node: None,
            current_step: 1,
            total_steps: 0,
        };
        assert_eq!(zero.fraction(), 0.0);
    }

    #[test]
    fn test_queue_position() {
        let status = QueueStatus {
            running: 1,
            pending: 1,
            running_ids: vec!["a".into()],
            pending_ids: vec!["b".into()],
        };
        assert_eq!(status.position_of("a"), Some(JobStatus::Running));
        assert_eq!(status.position_of("b"), Some(JobStatus::Queued));
        assert_eq!(status.position_of("c"), None);
    }

    #[test]
    fn test_job_starts_queued() {
        let job = Job::new("job-42", "client").with_output_nodes(["9"]);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.is_terminal());
        assert_eq!(job.output_nodes, vec!["9".to_string()]);
    }
}
