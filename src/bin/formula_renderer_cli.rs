//! Formula Renderer CLI
//!
//! Commands: check, render, status, serve
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation failure, 1 on any other failure

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use formula_renderer::{
    telemetry::{self, LogFormat},
    AsyncRenderer, Coordinator, Fingerprint, RenderError, RenderPipeline, Renderer, RendererConfig,
    Validator,
};

#[derive(Parser)]
#[command(name = "formula-renderer-cli")]
#[command(about = "Formula Renderer CLI - cached formula images via a shared worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file
    #[arg(short, long, env = "FORMULA_RENDERER_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact output directory
    #[arg(long, env = "FORMULA_RENDERER_IMAGE_DIR")]
    image_dir: Option<PathBuf>,

    /// Workspace root
    #[arg(long, env = "FORMULA_RENDERER_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Rendezvous socket path
    #[arg(long, env = "FORMULA_RENDERER_SERVICE_ADDRESS")]
    service_address: Option<PathBuf>,

    /// Keep failed workspaces
    #[arg(long)]
    debug: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a formula and print its fingerprint
    Check { formula: String },

    /// Render a formula
    Render {
        formula: String,

        /// Go through the shared worker instead of rendering inline
        #[arg(long)]
        queued: bool,
    },

    /// Ask the shared worker whether a fingerprint is still pending
    Status { fingerprint: String },

    /// Run the shared worker in the foreground
    Serve {
        /// Never exit on idle
        #[arg(long)]
        persistent: bool,
    },
}

fn load_config(cli: &Cli) -> Result<RendererConfig, RenderError> {
    let mut config = match &cli.config {
        Some(path) => RendererConfig::from_json_file(path)?,
        None => RendererConfig::default(),
    };
    if let Some(dir) = &cli.image_dir {
        config.image_dir = dir.clone();
    }
    if let Some(dir) = &cli.temp_dir {
        config.temp_dir = dir.clone();
    }
    if let Some(address) = &cli.service_address {
        config.service_address = Some(address.clone());
    }
    config.debug |= cli.debug;
    config.validate()?;
    Ok(config)
}

fn failure(err: &RenderError) -> ExitCode {
    let mut output = json!({
        "success": false,
        "error": err.to_string(),
    });
    if let RenderError::Validation(validation) = err {
        output["tokens"] = json!(validation.tokens());
        println!("{output}");
        return ExitCode::from(2);
    }
    println!("{output}");
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(cli.log_format, "info") {
        eprintln!("{e}");
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return failure(&e),
    };

    match run(cli.command, config).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => failure(&e),
    }
}

async fn run(command: Commands, config: RendererConfig) -> Result<serde_json::Value, RenderError> {
    match command {
        Commands::Check { formula } => {
            let validator = Validator::new(config.blacklist.clone());
            let cleaned = validator.validate(&formula)?;
            Ok(json!({
                "valid": true,
                "formula": cleaned,
                "fingerprint": Fingerprint::of(&cleaned),
            }))
        }

        Commands::Render { formula, queued } => {
            let rendered = if queued {
                let renderer = AsyncRenderer::new(config)?;
                let rendered = renderer.render_and_wait(&formula).await;
                // If this process became the worker, others may be queued on it.
                renderer.shutdown().await;
                rendered?
            } else {
                Renderer::new(config)?.render(&formula).await?
            };
            Ok(json!({ "success": true, "rendered": rendered }))
        }

        Commands::Status { fingerprint } => {
            let fingerprint = Fingerprint::parse(&fingerprint)?;
            let renderer = AsyncRenderer::new(config)?;
            let pending = renderer.coordinator().enqueued_status(&fingerprint).await?;
            Ok(json!({ "fingerprint": fingerprint, "pending": pending }))
        }

        Commands::Serve { persistent } => {
            let mut config = config;
            if persistent {
                config.idle_timeout_ms = None;
            }
            config.ensure_dirs()?;
            let validator = std::sync::Arc::new(Validator::new(config.blacklist.clone()));
            let pipeline = std::sync::Arc::new(RenderPipeline::latex(&config));
            let coordinator = Coordinator::new(&config, pipeline, validator);
            coordinator.serve().await?;
            Ok(json!({ "served": coordinator.address() }))
        }
    }
}
