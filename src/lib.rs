//! # comfy-remote
//!
//! Async remote client for [ComfyUI](https://github.com/comfyanonymous/ComfyUI).
//!
//! Turns a prompt plus parameters, or a saved workflow template, into a job
//! payload, submits it, follows the job over the server's WebSocket event
//! channel (polling `/history` when the channel is unavailable) and streams
//! the produced images to local files.
//!
//! ## Quick Start
//!
//! ```no_run
//! use comfy_remote::{ClientConfig, ComfyClient, Txt2ImgRequest};
//!
//! # async fn example() -> comfy_remote::Result<()> {
//! let client = ComfyClient::new(ClientConfig::default())?;
//!
//! // Discover models
//! let checkpoints = client.checkpoints().await?;
//! let checkpoint = &checkpoints[0];
//!
//! // Resolve the standard text-to-image graph; the seed is fixed here
//! let payload = Txt2ImgRequest::new("a sunset over mountains", checkpoint)
//!     .negative("lowres, blurry")
//!     .steps(25)
//!     .build()?;
//!
//! // Submit, track with progress, download
//! let generation = client
//!     .generate(&payload, |p| println!("Step {}/{}", p.current_step, p.total_steps))
//!     .await?;
//!
//! for path in generation.report.paths() {
//!     println!("saved {}", path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod messages;
pub mod prompts;
pub mod proxy;
pub mod reconnect;
pub mod seed;
pub mod session;
pub mod templates;
pub mod tracker;
pub mod types;
pub mod workflow;

pub use client::{ComfyClient, Generation};
pub use config::ClientConfig;
pub use error::{ComfyError, Result};
pub use fetcher::{ArtifactFetcher, ArtifactSource, FetchReport, SavedArtifact};
pub use messages::JobEvent;
pub use prompts::{PromptLibrary, PromptPair};
pub use proxy::ProxyConfig;
pub use seed::{SeedPolicy, SeedSource, RANDOM_SEED};
pub use session::{ClientSession, JobEvents};
pub use templates::TemplateStore;
pub use tracker::{JobTracker, StatusSource, TrackOptions};
pub use types::{ExecutionFailure, Job, JobSnapshot, JobStatus, OutputRef, ProgressUpdate, QueueStatus};
pub use workflow::{resolve, Overrides, ResolvedJobPayload, Resolver, Role, Txt2ImgRequest, WorkflowTemplate};
