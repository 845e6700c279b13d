//! comfy-remote CLI
//!
//! Generate images on a remote ComfyUI server and manage local templates
//! and prompts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_remote::prompts::DEFAULT_PROMPT_KEY;
use comfy_remote::templates::DEFAULT_CHECKPOINT;
use comfy_remote::workflow::DEFAULT_TEMPLATE_NAME;
use comfy_remote::{
    ClientConfig, ComfyClient, ComfyError, Overrides, PromptLibrary, PromptPair, ProxyConfig,
    Resolver, Role, TemplateStore, Txt2ImgRequest, WorkflowTemplate, RANDOM_SEED,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "comfy-remote")]
#[command(about = "Generate and download images from a remote ComfyUI server", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// ComfyUI server URL
    #[arg(
        long,
        short = 's',
        global = true,
        env = "COMFYUI_SERVER",
        default_value = comfy_remote::config::DEFAULT_SERVER_URL
    )]
    server: String,

    /// Proxy, e.g. http://127.0.0.1:8080 or socks5://127.0.0.1:1080
    #[arg(long, global = true, env = "HTTP_PROXY")]
    proxy: Option<String>,

    /// Directory downloaded images are written to
    #[arg(long, short = 'o', global = true, env = "COMFYUI_OUTPUT_DIR", default_value = "output")]
    output: PathBuf,

    /// Seconds to wait for a job before giving up
    #[arg(long, global = true, env = "COMFYUI_TIMEOUT_SECS", default_value_t = 300)]
    timeout: u64,

    /// Delete images from the server once downloaded
    #[arg(
        long,
        global = true,
        env = "COMFYUI_DELETE_AFTER_DOWNLOAD",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    delete_after_download: bool,

    #[arg(long, global = true, default_value = "templates")]
    templates_dir: PathBuf,

    #[arg(long, global = true, default_value = "prompts.json")]
    prompts_file: PathBuf,

    /// Fixed client id for the event channel (random by default)
    #[arg(long, global = true)]
    client_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate with the built-in text-to-image workflow
    Generate {
        /// Checkpoint model to load
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: String,
        #[command(flatten)]
        prompt: PromptArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Generate with a saved template
    Template {
        /// Template name
        #[arg(long, short = 'n')]
        name: String,
        /// Node that receives the positive prompt
        #[arg(long)]
        prompt_node: Option<String>,
        /// Node that receives the negative prompt
        #[arg(long)]
        negative_node: Option<String>,
        /// Replace the template's checkpoint
        #[arg(long)]
        checkpoint: Option<String>,
        #[command(flatten)]
        prompt: PromptArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Save an API-format workflow file as a template
    SaveTemplate {
        #[arg(long, short = 'n')]
        name: String,
        /// Workflow JSON file ("Save (API Format)" in ComfyUI)
        #[arg(long, short = 'w')]
        workflow: PathBuf,
    },
    /// List templates for the server
    ListTemplates,
    /// Delete a template
    DeleteTemplate {
        #[arg(long, short = 'n')]
        name: String,
    },
    /// Manage the prompt library
    #[command(subcommand)]
    Prompts(PromptsCommand),
    /// Query the server
    #[command(subcommand)]
    Server(ServerCommand),
}

#[derive(Subcommand)]
enum PromptsCommand {
    /// List all prompts
    List,
    /// Show one prompt
    View { key: String },
    /// Add or replace a prompt
    Add {
        key: String,
        #[arg(long)]
        positive: String,
        #[arg(long, default_value = "")]
        negative: String,
        /// Replace an existing prompt
        #[arg(long)]
        force: bool,
    },
    /// Delete a prompt
    Delete { key: String },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Check the server responds
    Health,
    /// List checkpoints, samplers and schedulers
    Models,
    /// System stats and queue state
    Info,
    /// Save a text-to-image template for a checkpoint on this server
    CreateWorkflow {
        /// Template name
        #[arg(long, short = 'n')]
        name: String,
        /// Checkpoint file (lists the available ones when omitted)
        #[arg(long, short = 'm')]
        model: Option<String>,
    },
}

#[derive(Args)]
struct PromptArgs {
    /// Positive prompt (read from the prompt library when omitted)
    #[arg(long, short = 'p')]
    prompt: Option<String>,
    /// Prompt library key used for omitted prompts
    #[arg(long)]
    prompt_key: Option<String>,
    /// Negative prompt (read from the prompt library when omitted)
    #[arg(long)]
    negative: Option<String>,
}

#[derive(Args)]
struct SamplingArgs {
    /// Seed, -1 for random
    #[arg(long, default_value_t = RANDOM_SEED, allow_hyphen_values = true)]
    seed: i64,
    #[arg(long, short = 'W')]
    width: Option<u32>,
    #[arg(long, short = 'H')]
    height: Option<u32>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    cfg: Option<f64>,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(long)]
    scheduler: Option<String>,
    #[arg(long)]
    batch_size: Option<u32>,
}

impl SamplingArgs {
    fn apply(&self, mut overrides: Overrides) -> Overrides {
        overrides.seed = Some(self.seed);
        overrides.width = self.width.or(overrides.width);
        overrides.height = self.height.or(overrides.height);
        overrides.steps = self.steps.or(overrides.steps);
        overrides.cfg = self.cfg.or(overrides.cfg);
        overrides.sampler_name = self.sampler.clone().or(overrides.sampler_name);
        overrides.scheduler = self.scheduler.clone().or(overrides.scheduler);
        overrides.batch_size = self.batch_size.or(overrides.batch_size);
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfy_remote=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = client_config(&cli.global)?;

    match cli.command {
        Commands::Generate {
            checkpoint,
            prompt,
            sampling,
        } => {
            let pair = prompt_pair(&config, &prompt)?;
            let request = Txt2ImgRequest::new(pair.positive, checkpoint).negative(pair.negative);
            let overrides = sampling.apply(request.overrides());
            run_generation(config, &request.template(), &overrides, Resolver::new()).await
        }
        Commands::Template {
            name,
            prompt_node,
            negative_node,
            checkpoint,
            prompt,
            sampling,
        } => {
            let store = TemplateStore::new(&config.templates_dir, &config.server_url)?;
            let template = load_or_default(&store, &name)?;

            let pair = prompt_pair(&config, &prompt)?;
            let mut overrides = sampling.apply(Overrides::new().positive(pair.positive).negative(pair.negative));
            overrides.checkpoint = checkpoint;

            let mut resolver = Resolver::new();
            if let Some(node) = prompt_node {
                resolver = resolver.bind(Role::Positive, node);
            }
            if let Some(node) = negative_node {
                resolver = resolver.bind(Role::Negative, node);
            }
            run_generation(config, &template, &overrides, resolver).await
        }
        Commands::SaveTemplate { name, workflow } => {
            let text = std::fs::read_to_string(&workflow)
                .with_context(|| format!("Failed to read workflow file {}", workflow.display()))?;
            let template = WorkflowTemplate::from_json_str(&name, &text)?;
            let store = TemplateStore::new(&config.templates_dir, &config.server_url)?;
            let path = store.save(&name, &template)?;
            println!("Template '{}' saved to {}", name, path.display());
            Ok(())
        }
        Commands::ListTemplates => {
            let store = TemplateStore::new(&config.templates_dir, &config.server_url)?;
            let names = store.list()?;
            if names.is_empty() {
                println!("No templates in {}", store.server_dir().display());
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::DeleteTemplate { name } => {
            let store = TemplateStore::new(&config.templates_dir, &config.server_url)?;
            let path = store.delete(&name)?;
            println!("Deleted {}", path.display());
            Ok(())
        }
        Commands::Prompts(command) => prompts_command(&config, command),
        Commands::Server(command) => server_command(config, command).await,
    }
}

fn client_config(args: &GlobalArgs) -> Result<ClientConfig> {
    let mut builder = ClientConfig::builder()
        .with_server_url(&args.server)
        .with_output_dir(&args.output)
        .with_templates_dir(&args.templates_dir)
        .with_prompts_path(&args.prompts_file)
        .with_tracking_timeout(Duration::from_secs(args.timeout))
        .with_delete_after_download(args.delete_after_download);

    if let Some(proxy) = args.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        let proxy = ProxyConfig::parse(proxy).with_context(|| format!("Invalid proxy '{}'", proxy))?;
        builder = builder.with_proxy(proxy);
    }
    if let Some(id) = &args.client_id {
        builder = builder.with_client_id(id);
    }
    Ok(builder.build())
}

/// Explicit prompts win; missing ones come from the prompt library.
fn prompt_pair(config: &ClientConfig, args: &PromptArgs) -> Result<PromptPair> {
    if let (Some(positive), Some(negative)) = (&args.prompt, &args.negative) {
        return Ok(PromptPair::new(positive, negative));
    }
    let library = PromptLibrary::open(&config.prompts_path)
        .with_context(|| format!("Failed to load {}", config.prompts_path.display()))?;
    let stored = library.resolve(args.prompt_key.as_deref());
    Ok(PromptPair {
        positive: args.prompt.clone().unwrap_or(stored.positive),
        negative: args.negative.clone().unwrap_or(stored.negative),
    })
}

fn load_or_default(store: &TemplateStore, name: &str) -> Result<WorkflowTemplate> {
    if name == DEFAULT_PROMPT_KEY || name == DEFAULT_TEMPLATE_NAME {
        return Ok(store.ensure_default(name)?);
    }
    match store.load(name) {
        Ok(template) => Ok(template),
        Err(ComfyError::NotFound(what)) => {
            tracing::warn!(%what, "Template not found; using {}", DEFAULT_TEMPLATE_NAME);
            Ok(store.ensure_default(DEFAULT_TEMPLATE_NAME)?)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load template '{}'", name)),
    }
}

async fn run_generation(
    config: ClientConfig,
    template: &WorkflowTemplate,
    overrides: &Overrides,
    resolver: Resolver,
) -> Result<()> {
    let payload = resolver.resolve(template, overrides)?;
    for role in payload.unmatched() {
        eprintln!("warning: template '{}' has no {} field; ignored", template.name(), role);
    }
    if let Some(seed) = payload.seed() {
        println!("Seed: {}", seed);
    }

    let client = ComfyClient::new(config)?;
    let result = client
        .generate(&payload, |p| {
            eprintln!("  step {}/{} ({:.0}%)", p.current_step, p.total_steps, p.fraction() * 100.0);
        })
        .await;
    client.close().await;

    let generation = result.context("Generation failed")?;
    println!("Job {} completed", generation.job.id);

    let report = generation.report;
    for saved in &report.saved {
        println!("Saved {} ({} bytes)", saved.path.display(), saved.bytes);
    }
    for failure in &report.failures {
        eprintln!("Failed to download {}: {}", failure.reference.filename, failure.error);
    }
    if report.saved.is_empty() && report.failures.is_empty() {
        println!("No images were generated");
    }
    if !report.is_complete() {
        bail!(
            "{} of {} downloads failed",
            report.failures.len(),
            report.failures.len() + report.saved.len()
        );
    }
    Ok(())
}

fn prompts_command(config: &ClientConfig, command: PromptsCommand) -> Result<()> {
    let mut library = PromptLibrary::open(&config.prompts_path)
        .with_context(|| format!("Failed to load {}", config.prompts_path.display()))?;

    match command {
        PromptsCommand::List => {
            for (i, (key, pair)) in library.list().enumerate() {
                println!("{}. {}", i + 1, key);
                println!("   Positive: {}", pair.positive);
                println!("   Negative: {}", pair.negative);
            }
        }
        PromptsCommand::View { key } => {
            let pair = library
                .get(&key)
                .with_context(|| format!("Prompt '{}' does not exist", key))?;
            println!("Prompt: {}", key);
            println!("Positive: {}", pair.positive);
            println!("Negative: {}", pair.negative);
        }
        PromptsCommand::Add {
            key,
            positive,
            negative,
            force,
        } => {
            if library.get(&key).is_some() && !force {
                bail!("Prompt '{}' already exists; pass --force to replace it", key);
            }
            library.add(key.clone(), PromptPair::new(positive, negative));
            library.save()?;
            println!("Prompt '{}' saved", key);
        }
        PromptsCommand::Delete { key } => {
            library.delete(&key)?;
            library.save()?;
            println!("Prompt '{}' deleted", key);
        }
    }
    Ok(())
}

async fn server_command(config: ClientConfig, command: ServerCommand) -> Result<()> {
    let client = ComfyClient::new(config.clone())?;

    match command {
        ServerCommand::Health => {
            if !client.health().await? {
                bail!("ComfyUI at {} is not healthy", client.endpoint());
            }
            println!("ComfyUI at {} is online", client.endpoint());
        }
        ServerCommand::Models => {
            let checkpoints = client.checkpoints().await?;
            let samplers = client.samplers().await?;
            let schedulers = client.schedulers().await?;
            for (title, items) in [
                ("Checkpoints", checkpoints),
                ("Samplers", samplers),
                ("Schedulers", schedulers),
            ] {
                println!("{} ({}):", title, items.len());
                for item in items {
                    println!("  - {}", item);
                }
            }
        }
        ServerCommand::Info => {
            let stats = client.system_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            let queue = client.queue_status().await?;
            println!("Queue: {} running, {} pending", queue.running, queue.pending);
        }
        ServerCommand::CreateWorkflow { name, model } => {
            let checkpoints = client.checkpoints().await?;
            let model = match model {
                Some(model) => {
                    if !checkpoints.contains(&model) {
                        tracing::warn!(model = %model, "Checkpoint not reported by the server");
                    }
                    model
                }
                None => {
                    if checkpoints.is_empty() {
                        bail!("No checkpoints available on {}", client.endpoint());
                    }
                    println!("Available checkpoints:");
                    for (i, checkpoint) in checkpoints.iter().enumerate() {
                        println!("  {}. {}", i + 1, checkpoint);
                    }
                    bail!("Choose one with --model");
                }
            };
            let store = TemplateStore::new(&config.templates_dir, &config.server_url)?;
            let path = store.create_txt2img(&name, &model)?;
            println!("Saved template '{}' for {} to {}", name, model, path.display());
        }
    }
    Ok(())
}
