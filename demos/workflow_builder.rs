//! Demonstrate model discovery, role detection and template resolution.
//!
//! Lists available checkpoints, samplers, and schedulers, shows which
//! nodes of the default template carry each role, then resolves a
//! customized request and prints the JSON that would be submitted.
//!
//! ```sh
//! cargo run --example workflow_builder
//! ```

use comfy_remote::seed::FixedSeedSource;
use comfy_remote::workflow::{basic_template, detect_roles};
use comfy_remote::{ComfyClient, Overrides, Resolver, Role, SeedPolicy};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let client = ComfyClient::from_url("http://127.0.0.1:8188")?;

    // Discover available options
    let checkpoints = client.checkpoints().await?;
    let samplers = client.samplers().await?;
    let schedulers = client.schedulers().await?;

    println!("Checkpoints ({}):", checkpoints.len());
    for c in &checkpoints {
        println!("  - {}", c);
    }
    println!("\nSamplers ({}):", samplers.len());
    for s in &samplers {
        println!("  - {}", s);
    }
    println!("\nSchedulers ({}):", schedulers.len());
    for s in &schedulers {
        println!("  - {}", s);
    }

    let Some(checkpoint) = checkpoints.first() else {
        eprintln!("\nNo checkpoints found; install a model first");
        return Ok(());
    };

    let template = basic_template("landscape", checkpoint);
    let roles = detect_roles(&template);
    println!("\nDetected roles:");
    for role in [Role::Positive, Role::Negative, Role::Seed, Role::Width, Role::Checkpoint] {
        println!("  {:<16} {:?}", role.as_str(), roles.nodes(role));
    }

    // Resolve with every parameter overridden and a pinned seed source
    let overrides = Overrides::new()
        .positive("masterpiece, best quality, landscape painting")
        .negative("lowres, blurry, bad anatomy, watermark")
        .size(1024, 1024)
        .steps(30)
        .cfg(7.0)
        .sampler("dpmpp_2m")
        .scheduler("karras")
        .batch_size(2)
        .filename_prefix("my-project");

    let resolver = Resolver::new().with_seed_policy(SeedPolicy::new(FixedSeedSource(42)));
    let payload = resolver.resolve(&template, &overrides)?;

    println!("\nWorkflow JSON:");
    println!("{}", serde_json::to_string_pretty(&payload.to_prompt())?);
    println!("\nSeed: {:?}", payload.seed());

    Ok(())
}
