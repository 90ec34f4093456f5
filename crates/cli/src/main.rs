//! pllm CLI — the main entry point.
//!
//! Commands:
//! - `serve`    — Start the gateway (main API, admin API, metrics)
//! - `validate` — Parse and cross-check a configuration file

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pllm",
    about = "pllm — multi-tenant LLM proxy gateway. One OpenAI-compatible endpoint in front of every provider.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway servers
    Serve {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    Validate {
        /// Path to the YAML configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

fn init_tracing(config: &pllm_config::Config, verbose: bool) {
    let default_level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = pllm_config::Config::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(&config, cli.verbose);
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "pllm starting");
            pllm_gateway::serve(config)
                .await
                .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))?;
        }
        Commands::Validate { config } => {
            let path = config;
            match pllm_config::Config::load(&path) {
                Ok(config) => {
                    println!("{} is valid", path.display());
                    println!("  models:    {}", config.model_list.len());
                    println!("  aliases:   {}", config.model_aliases.len());
                    println!("  fallbacks: {}", config.router.fallbacks.len());
                    println!("  strategy:  {}", config.router.routing_strategy);
                }
                Err(e) => {
                    eprintln!("{}: {e}", path.display());
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
