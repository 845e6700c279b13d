//! Session-scoped connection state.
//!
//! A [`ClientSession`] owns the HTTP client, the client id and at most one
//! WebSocket event channel. The channel is opened lazily by
//! [`ClientSession::ensure_channel`] and drained by a single reader task
//! that feeds the [`EventRegistry`], which routes events to per-job
//! [`JobEvents`] receivers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ComfyError, Result};
use crate::messages::{parse_message, JobEvent, ServerMessage};
use crate::proxy::ProxyConfig;
use crate::reconnect::{self, ReconnectConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Jobs whose early events are kept while nobody is subscribed.
const MAX_BACKLOG_JOBS: usize = 32;
/// Events kept per unsubscribed job.
const MAX_BACKLOG_EVENTS: usize = 512;

/// Normalize a server URL: default the scheme to `http`, strip trailing
/// slashes and a trailing `/api`.
pub fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    let mut base = with_scheme.trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/api") {
        base = stripped.trim_end_matches('/').to_string();
    }

    let parsed = reqwest::Url::parse(&base)
        .map_err(|e| ComfyError::InvalidConfig(format!("server URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(base),
        other => Err(ComfyError::InvalidConfig(format!(
            "server URL '{}' must use http or https, not {}",
            url, other
        ))),
    }
}

/// The WebSocket URL for `base` and `client_id`.
pub fn event_channel_url(base: &str, client_id: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| ComfyError::InvalidConfig(format!("server URL '{}': {}", base, e)))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| ComfyError::InvalidConfig(format!("cannot derive WebSocket URL from {}", base)))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("clientId", client_id);
    Ok(url.to_string())
}

// ── Event registry ──────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    waiters: HashMap<String, (u64, mpsc::UnboundedSender<JobEvent>)>,
    backlog: IndexMap<String, Vec<JobEvent>>,
    current_job: Option<String>,
    next_token: u64,
    /// Why no channel is feeding the registry, if none is.
    offline: Option<String>,
}

/// Routes parsed server events to the job they belong to.
pub struct EventRegistry {
    state: Mutex<RegistryState>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                offline: Some("event channel not opened".into()),
                ..Default::default()
            }),
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventRegistry")
            .field("waiters", &state.waiters.len())
            .field("backlog", &state.backlog.len())
            .field("offline", &state.offline)
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register interest in `job_id`. Events that arrived before the call
    /// are replayed first, in order.
    pub fn subscribe(self: &Arc<Self>, job_id: &str) -> JobEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(early) = state.backlog.shift_remove(job_id) {
            tracing::debug!(job_id, replayed = early.len(), "Replaying buffered events");
            for event in early {
                let _ = tx.send(event);
            }
        }
        if let Some(reason) = &state.offline {
            let _ = tx.send(JobEvent::ChannelLost(reason.clone()));
        }

        state.next_token += 1;
        let token = state.next_token;
        if state
            .waiters
            .insert(job_id.to_string(), (token, tx))
            .is_some()
        {
            tracing::warn!(job_id, "Replacing an existing subscription");
        }

        JobEvents {
            job_id: job_id.to_string(),
            token,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, job_id: &str, token: u64) {
        let mut state = self.lock();
        if state.waiters.get(job_id).is_some_and(|(t, _)| *t == token) {
            state.waiters.remove(job_id);
        }
    }

    /// Route one parsed frame.
    pub fn dispatch_message(&self, message: ServerMessage) {
        if let ServerMessage::Status(status) = &message {
            tracing::debug!(queue_remaining = ?status.queue_remaining(), "ComfyUI queue status");
        }
        if let Some((job_id, event)) = message.into_event() {
            self.dispatch(job_id, event);
        }
    }

    /// Route `event` to `job_id`, or to the job currently executing when the
    /// server did not name one.
    pub fn dispatch(&self, job_id: Option<String>, event: JobEvent) {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(job_id) = job_id.or_else(|| state.current_job.clone()) else {
            tracing::trace!(?event, "Dropping event with no job to attribute it to");
            return;
        };

        match &event {
            JobEvent::Started | JobEvent::Executing { .. } => {
                state.current_job = Some(job_id.clone());
            }
            JobEvent::Finished | JobEvent::Failed(_) | JobEvent::Interrupted => {
                if state.current_job.as_deref() == Some(job_id.as_str()) {
                    state.current_job = None;
                }
            }
            _ => {}
        }

        if let Some((_, tx)) = state.waiters.get(&job_id) {
            if tx.send(event).is_err() {
                state.waiters.remove(&job_id);
            }
            return;
        }

        let events = state.backlog.entry(job_id).or_default();
        if events.len() < MAX_BACKLOG_EVENTS {
            events.push(event);
        }
        while state.backlog.len() > MAX_BACKLOG_JOBS {
            state.backlog.shift_remove_index(0);
        }
    }

    /// Tell every waiter that events may have been missed.
    pub fn resume(&self) {
        let mut state = self.lock();
        state.offline = None;
        for (_, tx) in state.waiters.values() {
            let _ = tx.send(JobEvent::Resumed);
        }
    }

    /// Mark the registry as fed by a live channel.
    pub fn mark_online(&self) {
        self.lock().offline = None;
    }

    /// Deliver [`JobEvent::ChannelLost`] to every waiter and to later
    /// subscribers until a channel is open again.
    pub fn fail_all(&self, reason: &str) {
        let mut state = self.lock();
        state.offline = Some(reason.to_string());
        state.current_job = None;
        for (_, (_, tx)) in state.waiters.drain() {
            let _ = tx.send(JobEvent::ChannelLost(reason.to_string()));
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().offline.is_none()
    }
}

/// Receiver of one job's events. Unsubscribes when dropped.
#[derive(Debug)]
pub struct JobEvents {
    job_id: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<JobEvent>,
    registry: Weak<EventRegistry>,
}

impl JobEvents {
    /// A receiver not attached to any registry, fed through the returned
    /// sender. Useful for driving a tracker from another event source.
    pub fn channel(job_id: impl Into<String>) -> (mpsc::UnboundedSender<JobEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self {
            job_id: job_id.into(),
            token: 0,
            rx,
            registry: Weak::new(),
        };
        (tx, events)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event, or `None` once the feeding side is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

impl Drop for JobEvents {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.job_id, self.token);
        }
    }
}

// ── Event channel ───────────────────────────────────────────────────

/// Everything needed to (re)open the WebSocket, shareable with the reader.
#[derive(Debug)]
struct Connector {
    ws_url: String,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl Connector {
    async fn connect(&self) -> Result<WsStream> {
        let lost = |e: tokio_tungstenite::tungstenite::Error| {
            ComfyError::ConnectionLost(format!("WebSocket connect to {} failed: {}", self.ws_url, e))
        };
        let timed_out = |_| {
            ComfyError::ConnectionLost(format!(
                "WebSocket connect to {} timed out after {}s",
                self.ws_url,
                self.connect_timeout.as_secs()
            ))
        };

        let stream = match &self.proxy {
            None => {
                tokio::time::timeout(
                    self.connect_timeout,
                    tokio_tungstenite::connect_async(self.ws_url.as_str()),
                )
                .await
                .map_err(timed_out)?
                .map_err(lost)?
                .0
            }
            Some(proxy) => {
                let url = reqwest::Url::parse(&self.ws_url)
                    .map_err(|e| ComfyError::InvalidConfig(e.to_string()))?;
                let host = url.host_str().unwrap_or_default().to_string();
                let port = url.port_or_known_default().unwrap_or(80);
                let tcp = proxy.tunnel(&host, port, self.connect_timeout).await?;
                tokio::time::timeout(
                    self.connect_timeout,
                    tokio_tungstenite::client_async_tls(self.ws_url.as_str(), tcp),
                )
                .await
                .map_err(timed_out)?
                .map_err(lost)?
                .0
            }
        };

        tracing::info!(url = %self.ws_url, "ComfyUI event channel open");
        Ok(stream)
    }
}

struct ChannelHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drain frames until the socket drops (`Some(reason)`) or the session
/// cancels (`None`).
async fn read_frames(
    stream: &mut WsStream,
    registry: &EventRegistry,
    cancel: &CancellationToken,
) -> Option<String> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                Ok(Some(message)) => registry.dispatch_message(message),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, raw_message = %text, "Failed to parse ComfyUI message");
                }
            },
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary preview frame");
            }
            Some(Ok(Message::Close(frame))) => {
                return Some(match frame {
                    Some(f) => format!("server closed the connection: {}", f.reason),
                    None => "server closed the connection".to_string(),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Some(e.to_string()),
            None => return Some("connection ended".to_string()),
        }
    }
}

async fn run_reader(
    mut stream: WsStream,
    connector: Arc<Connector>,
    registry: Arc<EventRegistry>,
    reconnect_config: ReconnectConfig,
    cancel: CancellationToken,
) {
    loop {
        let Some(reason) = read_frames(&mut stream, &registry, &cancel).await else {
            let _ = stream.close(None).await;
            registry.fail_all("session closed");
            return;
        };
        tracing::warn!(%reason, "ComfyUI event channel dropped");

        match reconnect::reconnect(|| connector.connect(), &reconnect_config, &cancel).await {
            Some(fresh) => {
                stream = fresh;
                registry.resume();
            }
            None => {
                registry.fail_all(&reason);
                return;
            }
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Connection state shared by submission, tracking and fetching.
pub struct ClientSession {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
    connector: Arc<Connector>,
    reconnect: ReconnectConfig,
    registry: Arc<EventRegistry>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
    submit_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("ws_url", &self.connector.ws_url)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Build a session from resolved configuration. No connection is made.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let endpoint = normalize_base_url(&config.server_url)?;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ws_url = event_channel_url(&endpoint, &client_id)?;

        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(proxy.to_reqwest()?);
        }
        let http = builder.build().map_err(|e| ComfyError::Transport {
            context: "Failed to build HTTP client".into(),
            source: e,
        })?;

        Ok(Self {
            http,
            endpoint,
            client_id,
            connector: Arc::new(Connector {
                ws_url,
                proxy: config.proxy.clone(),
                connect_timeout: config.connect_timeout,
            }),
            reconnect: ReconnectConfig {
                initial_delay: config.reconnect_delay,
                max_attempts: config.reconnect_attempts,
                ..Default::default()
            },
            registry: EventRegistry::new(),
            channel: tokio::sync::Mutex::new(None),
            submit_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Normalized base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn ws_url(&self) -> &str {
        &self.connector.ws_url
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Held for the duration of one submission.
    pub(crate) async fn submit_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.submit_gate.lock().await
    }

    /// Open the event channel unless one is already running.
    pub async fn ensure_channel(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        if guard.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return Ok(());
        }

        let stream = self.connector.connect().await?;
        self.registry.mark_online();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reader(
            stream,
            Arc::clone(&self.connector),
            Arc::clone(&self.registry),
            self.reconnect.clone(),
            cancel.clone(),
        ));
        *guard = Some(ChannelHandle { cancel, task });
        Ok(())
    }

    /// Whether a reader task is currently running.
    pub async fn is_channel_open(&self) -> bool {
        let guard = self.channel.lock().await;
        guard.as_ref().is_some_and(|h| !h.task.is_finished()) && self.registry.is_online()
    }

    /// Subscribe to `job_id`'s events on this session's channel.
    pub fn subscribe(&self, job_id: &str) -> JobEvents {
        self.registry.subscribe(job_id)
    }

    /// Stop the reader and close the socket. Waiters get `ChannelLost`.
    pub async fn close(&self) {
        let handle = self.channel.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(error = %e, "Event reader ended abnormally");
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.channel.try_lock() {
            if let Some(handle) = guard.take() {
                handle.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressUpdate;

    #[test]
    fn normalizes_base_urls() {
        assert_eq!(
            normalize_base_url("http://127.0.0.1:8188/").unwrap(),
            "http://127.0.0.1:8188"
        );
        assert_eq!(
            normalize_base_url("https://comfy.example.com/api/").unwrap(),
            "https://comfy.example.com"
        );
        assert_eq!(
            normalize_base_url("gpu-box:8188").unwrap(),
            "http://gpu-box:8188"
        );
        assert!(normalize_base_url("ftp://host").is_err());
    }

    #[test]
    fn derives_event_channel_url() {
        assert_eq!(
            event_channel_url("http://127.0.0.1:8188", "abc").unwrap(),
            "ws://127.0.0.1:8188/ws?clientId=abc"
        );
        assert_eq!(
            event_channel_url("https://host/comfy", "abc").unwrap(),
            "wss://host/comfy/ws?clientId=abc"
        );
    }

    #[test]
    fn session_uses_uuid_client_id() {
        let session = ClientSession::new(&ClientConfig::default()).unwrap();
        assert!(Uuid::parse_str(session.client_id()).is_ok());
        assert!(session.ws_url().ends_with(session.client_id()));

        let fixed = ClientConfig::builder().with_client_id("mine").build();
        assert_eq!(ClientSession::new(&fixed).unwrap().client_id(), "mine");
    }

    #[tokio::test]
    async fn backlog_replays_early_events() {
        let registry = EventRegistry::new();
        registry.mark_online();
        registry.dispatch(Some("job-1".into()), JobEvent::Started);
        registry.dispatch(Some("job-1".into()), JobEvent::Finished);

        let mut events = registry.subscribe("job-1");
        assert_eq!(events.recv().await, Some(JobEvent::Started));
        assert_eq!(events.recv().await, Some(JobEvent::Finished));
    }

    #[tokio::test]
    async fn routes_by_job_and_attributes_anonymous_progress() {
        let registry = EventRegistry::new();
        registry.mark_online();
        let mut a = registry.subscribe("a");
        let mut b = registry.subscribe("b");

        registry.dispatch(Some("b".into()), JobEvent::Started);
        let progress = JobEvent::Progress(ProgressUpdate {
            node: None,
            current_step: 1,
            total_steps: 4,
        });
        registry.dispatch(None, progress.clone());
        registry.dispatch(Some("a".into()), JobEvent::Queued);

        assert_eq!(b.recv().await, Some(JobEvent::Started));
        assert_eq!(b.recv().await, Some(progress));
        assert_eq!(a.recv().await, Some(JobEvent::Queued));
    }

    #[tokio::test]
    async fn fail_all_reaches_current_and_later_waiters() {
        let registry = EventRegistry::new();
        registry.mark_online();
        let mut waiting = registry.subscribe("job");
        registry.fail_all("boom");
        assert_eq!(
            waiting.recv().await,
            Some(JobEvent::ChannelLost("boom".into()))
        );

        let mut late = registry.subscribe("other");
        assert_eq!(late.recv().await, Some(JobEvent::ChannelLost("boom".into())));
        assert!(!registry.is_online());
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let registry = EventRegistry::new();
        let events = registry.subscribe("job");
        drop(events);
        registry.dispatch(Some("job".into()), JobEvent::Started);
        // No waiter left, so the event went to the backlog.
        assert_eq!(registry.lock().backlog.get("job").map(Vec::len), Some(1));
    }
}
