//! Generate an image with real-time WebSocket progress tracking.
//!
//! Progress arrives over the session's event channel. If the channel
//! can't be opened or drops, tracking polls the server instead.
//!
//! ```sh
//! cargo run --example progress_tracking
//! ```

use std::time::Duration;

use comfy_remote::{ClientConfig, ComfyClient, ComfyError, Txt2ImgRequest};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("comfy_remote=debug")
        .init();

    let config = ClientConfig::builder()
        .with_client_id("progress-example")
        .with_tracking_timeout(Duration::from_secs(300))
        .build();
    let client = ComfyClient::new(config)?;

    let checkpoints = client.checkpoints().await?;
    if checkpoints.is_empty() {
        eprintln!("No checkpoints found");
        return Ok(());
    }

    let payload = Txt2ImgRequest::new("a cat wearing a tiny hat, digital art", &checkpoints[0])
        .steps(30)
        .cfg_scale(7.5)
        .build()?;

    let result = client
        .generate(&payload, |progress| {
            println!(
                "  Step {}/{} ({:.0}%)",
                progress.current_step,
                progress.total_steps,
                progress.fraction() * 100.0
            );
        })
        .await;

    match result {
        Ok(generation) => {
            println!("Done! Saved {} image(s)", generation.report.saved.len());
        }
        Err(ComfyError::GenerationFailed(error)) => eprintln!("Failed: {}", error),
        Err(ComfyError::TrackingTimeout { job_id, .. }) => {
            eprintln!("Timed out; job {} is still on the server", job_id)
        }
        Err(e) => return Err(e.into()),
    }

    client.close().await;
    Ok(())
}
