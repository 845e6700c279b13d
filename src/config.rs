use std::path::PathBuf;
use std::time::Duration;

use crate::proxy::ProxyConfig;
use crate::tracker::TrackOptions;

/// Default ComfyUI address.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8188";

/// Resolved configuration for a [`crate::ComfyClient`].
///
/// Use [`ClientConfig::builder()`] for ergonomic construction, or
/// [`ClientConfig::default()`] for a local server with stock settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the ComfyUI server. A trailing `/` or `/api` is stripped.
    pub server_url: String,

    /// Proxy applied to both HTTP requests and the event channel.
    pub proxy: Option<ProxyConfig>,

    /// Fixed client id. `None` = a fresh UUID per session.
    pub client_id: Option<String>,

    /// Directory downloaded artifacts are written to.
    pub output_dir: PathBuf,

    /// Root of the template store.
    pub templates_dir: PathBuf,

    /// Prompt library file.
    pub prompts_path: PathBuf,

    /// Ask the server to delete each artifact after a verified download.
    pub delete_after_download: bool,

    /// Path of the server's delete endpoint, relative to the base URL.
    pub delete_path: String,

    /// How long to wait for a job to reach a terminal state.
    pub tracking_timeout: Duration,

    /// Status polling interval when the event channel is unavailable.
    pub poll_interval: Duration,

    /// Per-request timeout for HTTP calls.
    pub request_timeout: Duration,

    /// TCP connect timeout for both channels.
    pub connect_timeout: Duration,

    /// Pause before re-opening a dropped event channel.
    pub reconnect_delay: Duration,

    /// Reconnect attempts before waiters are told the channel is lost.
    pub reconnect_attempts: u32,

    /// Extra submission attempts after a retryable failure.
    pub submit_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            proxy: None,
            client_id: None,
            output_dir: PathBuf::from("output"),
            templates_dir: PathBuf::from("templates"),
            prompts_path: PathBuf::from("prompts.json"),
            delete_after_download: false,
            delete_path: "/delete".to_string(),
            tracking_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            reconnect_attempts: 1,
            submit_retries: 2,
        }
    }
}

impl ClientConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Tracking deadline and poll cadence as tracker options.
    pub fn track_options(&self) -> TrackOptions {
        TrackOptions {
            timeout: self.tracking_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.templates_dir = dir.into();
        self
    }

    pub fn with_prompts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.prompts_path = path.into();
        self
    }

    pub fn with_delete_after_download(mut self, enabled: bool) -> Self {
        self.config.delete_after_download = enabled;
        self
    }

    /// Set the delete endpoint path (e.g. `/api/delete` for a patched server).
    pub fn with_delete_path(mut self, path: impl Into<String>) -> Self {
        self.config.delete_path = path.into();
        self
    }

    pub fn with_tracking_timeout(mut self, timeout: Duration) -> Self {
        self.config.tracking_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect_attempts = attempts;
        self
    }

    pub fn with_submit_retries(mut self, retries: u32) -> Self {
        self.config.submit_retries = retries;
        self
    }

    /// Build the final [`ClientConfig`].
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
