//! latentface CLI
//!
//! Edits semantic attributes of a face photo by inverting it into StyleGAN's
//! latent space, moving along principal directions and re-synthesizing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use latentface::config::Config;
use latentface::latent::{Attribute, AttributeVector, ComponentLibrary, SemanticMappingTable};
use latentface::service::{EditRequest, EditService};

#[derive(Parser)]
#[command(name = "latentface")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, env = "LATENTFACE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Edit attributes of a face photo
    Edit {
        /// Input image
        #[arg(short, long)]
        input: PathBuf,

        /// Output image; format follows the extension
        #[arg(short, long)]
        output: PathBuf,

        /// Attribute strength as name=value, repeatable (e.g. smile=2.5)
        #[arg(short, long = "set", value_parser = parse_attribute)]
        set: Vec<(String, f32)>,

        /// Blend toward the mean latent, in (0, 1]
        #[arg(short, long)]
        truncation: Option<f32>,

        /// Synthesis noise strength; 0 gives deterministic output
        #[arg(short, long)]
        noise_strength: Option<f32>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or (re)generate the principal component library
    Components {
        /// Replace the library with a freshly synthesized one
        #[arg(long)]
        synthesize: bool,
    },

    /// List editable attributes and their mapped components
    Attributes,

    /// Show model file availability
    Models,
}

fn parse_attribute(s: &str) -> Result<(String, f32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value = value
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("invalid strength '{}': {}", value, e))?;
    Ok((name.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref().unwrap_or(Config::default_path());
    let config = Config::load(config_path).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    match cli.command {
        Commands::Edit {
            input,
            output,
            set,
            truncation,
            noise_strength,
            json,
        } => {
            let mut request = EditRequest::from_config(
                AttributeVector::from_named(set.iter().map(|(name, value)| (name.as_str(), *value))),
                &config.output,
            );
            if let Some(t) = truncation {
                request = request.with_truncation(t);
            }
            if let Some(n) = noise_strength {
                request = request.with_noise_strength(n);
            }
            run_edit(&config, input, output, request, json).await
        }
        Commands::Components { synthesize } => components(&config, synthesize),
        Commands::Attributes => attributes(&config),
        Commands::Models => models(&config),
    }
}

async fn run_edit(
    config: &Config,
    input: PathBuf,
    output: PathBuf,
    request: EditRequest,
    json: bool,
) -> Result<()> {
    let service = EditService::from_config(config)?;
    if !service.models_available() {
        warn!("Some model files are missing; run `latentface models` for details");
    }

    // Start model cleanup task
    if let Some(pool) = service.pool() {
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            pool.start_cleanup_task().await;
        });
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling edit...");
            ctrl_c.cancel();
        }
    });

    let result = service.edit_file(input, output, request, cancel).await;
    if let Some(pool) = service.pool() {
        pool.shutdown();
    }
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Wrote {} ({}x{}) in {}ms",
            result.output_path, result.width, result.height, result.inference_time_ms
        );
    }
    Ok(())
}

fn components(config: &Config, synthesize: bool) -> Result<()> {
    let width = config.latent.num_layers * config.latent.latent_dim;
    let path = &config.components.path;

    let library = if synthesize {
        let library = ComponentLibrary::synthesize(
            config.components.synthetic_count,
            width,
            config.components.synthetic_seed,
        );
        library
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        library
    } else {
        ComponentLibrary::load_or_synthesize(
            path,
            width,
            config.components.synthetic_count,
            config.components.synthetic_seed,
        )
    };

    println!("Component library: {}", path.display());
    println!("  components: {}", library.len());
    println!("  width:      {}", library.width());
    Ok(())
}

fn attributes(config: &Config) -> Result<()> {
    let table = match &config.editing.mapping_path {
        Some(path) => SemanticMappingTable::load_json(path)?,
        None => SemanticMappingTable::default_ffhq(),
    };

    println!("{:<14} {:>9} {:>9} {:>8}", "attribute", "component", "direction", "strength");
    for attribute in Attribute::ALL {
        match table.get(attribute) {
            Some(record) => println!(
                "{:<14} {:>9} {:>9} {:>8.2}",
                attribute.as_str(),
                record.component,
                i8::from(record.direction),
                record.strength
            ),
            None => println!("{:<14} {:>9}", attribute.as_str(), "-"),
        }
    }
    Ok(())
}

fn models(config: &Config) -> Result<()> {
    let models = &config.models;
    for (name, path) in [
        ("detector", &models.detector),
        ("encoder", &models.encoder),
        ("mapping", &models.mapping),
        ("synthesis", &models.synthesis),
    ] {
        let state = if path.exists() { "ok" } else { "missing" };
        println!("{:<10} {:<8} {}", name, state, path.display());
    }
    Ok(())
}
