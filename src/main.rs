//! Productivity pipeline service.
//!
//! Usage:
//!   productivity-pipeline serve
//!   productivity-pipeline analyze --image shot.png --subject E1 --window 09:00-10:00

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use productivity_pipeline::config::{Config, RuntimeConfig, load_env_file};
use productivity_pipeline::executions::ExecutionStore;
use productivity_pipeline::http::start_http_server;
use productivity_pipeline::models::{PatternLabel, PipelineInput};
use productivity_pipeline::pipeline::DefaultPipeline;

#[derive(Parser)]
#[command(name = "productivity-pipeline")]
#[command(about = "Screenshot productivity analysis pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve,
    /// Run one screenshot through the pipeline and print the report
    Analyze {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        subject: String,
        /// Observation window, HH:MM-HH:MM
        #[arg(long)]
        window: Option<String>,
        /// Prior pattern labels, oldest first
        #[arg(long, value_delimiter = ',')]
        history: Vec<PatternLabel>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Subscriber first so configuration loading can log
    load_env_file();
    let runtime = RuntimeConfig::load_from(|key| std::env::var(key).ok());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&runtime.log_level))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Analyze {
            image,
            subject,
            window,
            history,
        } => analyze(config, image, subject, window, history).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(
        "Starting productivity pipeline: state_machine={}, model={}",
        config.pipeline.state_machine, config.inference.model
    );
    let pipeline = DefaultPipeline::from_config(&config)?;
    let executions = ExecutionStore::new(config.pipeline.state_machine.clone(), Arc::new(pipeline))
        .with_retention(config.pipeline.max_retained_executions);
    start_http_server(Arc::new(config), executions).await
}

async fn analyze(
    config: Config,
    image: PathBuf,
    subject: String,
    window: Option<String>,
    history: Vec<PatternLabel>,
) -> Result<()> {
    let bytes = std::fs::read(&image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let input = PipelineInput {
        subject,
        window,
        image_data: base64::engine::general_purpose::STANDARD.encode(bytes),
        history,
    };

    let pipeline = DefaultPipeline::from_config(&config)?;
    let run = pipeline.run(input).await;
    match run.outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(error) => {
            println!("{}", serde_json::to_string_pretty(&error)?);
            std::process::exit(1);
        }
    }
}
