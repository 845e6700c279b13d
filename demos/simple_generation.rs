//! Generate a single image from a text prompt.
//!
//! Requires a running ComfyUI instance at http://127.0.0.1:8188
//! with at least one checkpoint installed.
//!
//! ```sh
//! cargo run --example simple_generation
//! ```

use comfy_remote::{ClientConfig, ComfyClient, Txt2ImgRequest};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let client = ComfyClient::new(ClientConfig::builder().with_output_dir("output").build())?;

    // Check connection
    if !client.health().await? {
        eprintln!("ComfyUI is not responding");
        return Ok(());
    }
    println!("ComfyUI is online");

    // List available checkpoints
    let checkpoints = client.checkpoints().await?;
    if checkpoints.is_empty() {
        eprintln!("No checkpoints found; install a model first");
        return Ok(());
    }
    println!("Using checkpoint: {}", checkpoints[0]);

    // Resolve the workflow
    let payload = Txt2ImgRequest::new("a beautiful sunset over mountains", &checkpoints[0])
        .negative("lowres, blurry, bad anatomy")
        .steps(25)
        .cfg_scale(7.5)
        .build()?;
    println!("Seed: {:?}", payload.seed());

    // Submit, wait, download
    let job = client.submit(&payload).await?;
    println!("Queued job: {}", job.id);

    let job = client.track(job, |_| {}).await?;
    if let Some(error) = &job.error {
        eprintln!("Generation failed: {}", error);
        return Ok(());
    }

    let report = client.fetch(&job, None).await?;
    for saved in &report.saved {
        println!("Saved: {}", saved.path.display());
    }

    client.close().await;
    Ok(())
}
