use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use novelai_batch::template::cost::estimate_cost;
use novelai_batch::template::expansion::expand;
use novelai_batch::{metadata, Config, GenerationTemplate, NovelAiClient, Runner, SubscriptionInfo};

#[derive(Parser, Debug)]
#[command(name = "naibatch", about = "Batch driver for the NovelAI image API", version)]
struct Cli {
    /// Override NOVELAI_API_URL
    #[arg(global = true, long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expand a template and run every generated task
    Run {
        #[command(flatten)]
        template: TemplateArgs,
    },
    /// Print the expanded prompt/seed list without submitting anything
    Expand {
        #[command(flatten)]
        template: TemplateArgs,
    },
    /// Estimate the cost of one template under a subscription
    Cost {
        #[command(flatten)]
        template: TemplateArgs,
        /// Subscription tier to price against (default: configured fallback)
        #[arg(long)]
        tier: Option<i64>,
        /// Whether the subscription is active
        #[arg(long)]
        active: Option<bool>,
    },
    /// Recover a template from a generated image's embedded metadata
    Metadata {
        /// PNG file produced by a previous run
        file: PathBuf,
        /// Write the recovered template here instead of printing it
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct TemplateArgs {
    /// Template JSON file; flags below override its fields
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Prompt text
    #[arg(long)]
    prompt: Option<String>,
    /// Negative prompt text
    #[arg(long)]
    negative_prompt: Option<String>,
    /// Model name, e.g. nai-diffusion-3
    #[arg(long)]
    model: Option<String>,
    /// Sampler name, e.g. k_euler_ancestral
    #[arg(long)]
    sampler: Option<String>,
    /// Noise schedule, e.g. karras
    #[arg(long)]
    noise_schedule: Option<String>,
    /// Steps
    #[arg(long)]
    steps: Option<u8>,
    /// Guidance scale
    #[arg(long)]
    scale: Option<f64>,
    /// Width
    #[arg(long)]
    width: Option<u32>,
    /// Height
    #[arg(long)]
    height: Option<u32>,
    /// Seed; drawn at random when absent
    #[arg(long)]
    seed: Option<i64>,
    /// Batch size
    #[arg(long, alias = "batchsize")]
    batch_size: Option<u32>,
    /// Enable SMEA
    #[arg(long)]
    smea: bool,
    /// Enable SMEA DYN (implies SMEA)
    #[arg(long = "dyn")]
    smea_dyn: bool,
    /// Reseed every batch member except the first
    #[arg(long)]
    all_random: bool,
    /// Retry failed tasks even when they bill
    #[arg(long)]
    retry_all: bool,
    /// Write a JPEG sibling next to every saved image
    #[arg(long)]
    save_jpeg: bool,
    /// Replacement spec file: find,alternative1,alternative2,... per line
    #[arg(long, value_name = "PATH")]
    replace_file: Option<PathBuf>,
    /// Base image for image-to-image
    #[arg(long, value_name = "PATH")]
    base_image: Option<PathBuf>,
    /// Image-to-image strength
    #[arg(long)]
    strength: Option<f64>,
    /// Image-to-image noise
    #[arg(long)]
    noise: Option<f64>,
    /// Output directory template
    #[arg(long)]
    output_path: Option<String>,
    /// Output filename template
    #[arg(long)]
    output_filename: Option<String>,
}

fn parse_wire_name<T: serde::de::DeserializeOwned>(kind: &str, value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("Unknown {kind}: {value}"))
}

fn build_template(
    args: &TemplateArgs,
    conf: &Config,
) -> Result<GenerationTemplate, Box<dyn std::error::Error>> {
    let mut template = match &args.file {
        Some(path) => GenerationTemplate::load(path)?,
        None => GenerationTemplate {
            output_path: conf.output_path.clone(),
            ..Default::default()
        },
    };

    if let Some(v) = &args.prompt {
        template.prompt = v.clone();
    }
    if let Some(v) = &args.negative_prompt {
        template.negative_prompt = v.clone();
    }
    if let Some(v) = &args.model {
        template.model = parse_wire_name("model", v)?;
    }
    if let Some(v) = &args.sampler {
        template.sampler = parse_wire_name("sampler", v)?;
    }
    if let Some(v) = &args.noise_schedule {
        template.noise_schedule = parse_wire_name("noise schedule", v)?;
    }
    if let Some(v) = args.steps {
        template.steps = v;
    }
    if let Some(v) = args.scale {
        template.scale = v;
    }
    if let Some(v) = args.width {
        template.width = v;
    }
    if let Some(v) = args.height {
        template.height = v;
    }
    if let Some(v) = args.seed {
        template.seed = Some(v);
    }
    if let Some(v) = args.batch_size {
        template.batch_size = v;
    }
    if args.smea {
        template.smea = true;
    }
    if args.smea_dyn {
        template.smea = true;
        template.smea_dyn = true;
    }
    if args.all_random {
        template.all_random = true;
    }
    if args.retry_all {
        template.retry_all = true;
    }
    if args.save_jpeg {
        template.save_jpeg = true;
    }
    if let Some(path) = &args.replace_file {
        template.replace_spec = std::fs::read_to_string(path)?;
    }
    if let Some(path) = &args.base_image {
        template.base_image = Some(std::fs::read(path)?);
        if template.strength.is_none() {
            template.strength = Some(0.7);
        }
    }
    if let Some(v) = args.strength {
        template.strength = Some(v);
    }
    if let Some(v) = args.noise {
        template.noise = Some(v);
    }
    if let Some(v) = &args.output_path {
        template.output_path = v.clone();
    }
    if let Some(v) = &args.output_filename {
        template.output_filename = v.clone();
    }
    Ok(template)
}

async fn fetch_subscription(client: &NovelAiClient, conf: &Config) -> SubscriptionInfo {
    match client.user_subscription().await {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(
                "Failed to fetch subscription, using configured fallback: {}",
                e
            );
            SubscriptionInfo {
                tier: conf.subscription_tier,
                active: conf.subscription_active,
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load env and parse CLI
    Config::dotenv_load();
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut conf = Config::new().expect("Failed to load config");
    if let Some(url) = cli.api_url {
        conf.api_url = url;
    }

    match cli.command {
        Commands::Run { template } => {
            let template = build_template(&template, &conf)?;
            let client = NovelAiClient::new(conf.api_url.clone(), conf.token.clone());
            let subscription = fetch_subscription(&client, &conf).await;

            let mut rng = rand::thread_rng();
            let tasks = expand(&template, &mut rng)?;
            println!(
                "Expanded {} task(s), estimated cost {} per batch",
                tasks.len(),
                estimate_cost(&template, subscription.tier, subscription.active)
            );

            let runner = Runner::new(client, subscription);
            let cancel = runner.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Cancellation requested, finishing the in-flight task");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let report = runner.run(&tasks).await;
            for file in &report.files {
                println!("{}", file.display());
            }
            println!(
                "Completed {}, failed {}, cancelled: {}",
                report.completed, report.failed, report.cancelled
            );
            if report.failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Expand { template } => {
            let template = build_template(&template, &conf)?;
            let mut rng = rand::thread_rng();
            let tasks = expand(&template, &mut rng)?;
            for (i, task) in tasks.iter().enumerate() {
                println!(
                    "{:4}  seed={}  {}",
                    i,
                    task.template.seed.unwrap_or_default(),
                    task.template.prompt
                );
            }
            println!("{} task(s)", tasks.len());
            Ok(())
        }
        Commands::Cost {
            template,
            tier,
            active,
        } => {
            let template = build_template(&template, &conf)?;
            let tier = tier.unwrap_or(conf.subscription_tier);
            let active = active.unwrap_or(conf.subscription_active);
            println!("{}", estimate_cost(&template, tier, active));
            Ok(())
        }
        Commands::Metadata { file, save } => {
            match metadata::read_template_from_file(&file) {
                Ok(template) => {
                    match save {
                        Some(path) => {
                            template.save(&path)?;
                            println!("Saved template to {}", path.display());
                        }
                        None => println!("{}", serde_json::to_string_pretty(&template)?),
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
