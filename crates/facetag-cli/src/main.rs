use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facetag_core::{FaceOutcome, IdentificationResult, RejectionMode};
use facetag_hw::Camera;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod capture_loop;
mod config;
mod display;
mod models;
mod overlay;

use config::Config;
use models::Artifacts;
use overlay::Overlay;

#[derive(Parser)]
#[command(name = "facetag", about = "Live webcam face identification")]
struct Cli {
    /// Config file (default: ./facetag.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the model artifacts
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Acceptance distance threshold
    #[arg(long, global = true)]
    threshold: Option<f32>,

    /// Rejection mode: legacy-anchor or nearest-centroid
    #[arg(long, global = true)]
    rejection: Option<RejectionMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify faces on the live camera feed (default)
    Run {
        /// Capture device index (/dev/videoN)
        #[arg(short, long)]
        device: Option<u32>,
    },
    /// Identify faces in a still image and print the results as JSON
    Identify {
        image: PathBuf,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load every artifact and print a JSON summary
    Check,
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.model_dir {
        config.models.dir = dir;
    }
    if let Some(threshold) = cli.threshold {
        config.recognition.threshold = threshold;
    }
    if let Some(rejection) = cli.rejection {
        config.recognition.rejection = rejection;
    }

    match cli.command.unwrap_or(Commands::Run { device: None }) {
        Commands::Run { device } => {
            if let Some(index) = device {
                config.capture.device_index = index;
            }
            config.validate()?;
            run(&config)
        }
        Commands::Identify { image, output } => {
            config.validate()?;
            identify(&config, &image, output.as_deref())
        }
        Commands::Check => {
            config.validate()?;
            check(&config)
        }
        Commands::Devices => {
            devices();
            Ok(())
        }
    }
}

fn run(config: &Config) -> Result<()> {
    let artifacts = Artifacts::load(&config.models)?;
    for problem in artifacts.summary(config.recognition.rejection).problems {
        tracing::warn!(%problem, "artifact dimensions disagree");
    }
    let mut identifier = artifacts.into_identifier(config.pipeline());
    let overlay = Overlay::from_config(&config.display);

    let cap = &config.capture;
    let camera = Camera::open_index(cap.device_index, cap.width, cap.height)
        .with_context(|| format!("opening capture device {}", cap.device_index))?;
    let mut stream = camera.stream().context("starting capture stream")?;
    let mut window = display::WindowSink::open(&config.display.window_title, camera.width, camera.height)?;

    tracing::info!(
        device = %camera.device_path,
        format = ?camera.pixel_format(),
        threshold = config.recognition.threshold,
        rejection = %config.recognition.rejection,
        "capture loop starting"
    );
    capture_loop::run(&mut stream, &mut window, &mut identifier, &overlay)?;
    Ok(())
}

/// One JSON record per detected face.
#[derive(Serialize)]
#[serde(untagged)]
enum FaceReport {
    Identified(IdentificationResult),
    Failed { error: String },
}

impl From<&FaceOutcome> for FaceReport {
    fn from(outcome: &FaceOutcome) -> Self {
        match outcome {
            Ok(result) => FaceReport::Identified(result.clone()),
            Err(e) => FaceReport::Failed { error: e.to_string() },
        }
    }
}

fn identify(config: &Config, image_path: &Path, output: Option<&Path>) -> Result<()> {
    let mut frame = image::open(image_path)
        .with_context(|| format!("reading image {}", image_path.display()))?
        .to_rgb8();

    let mut identifier = Artifacts::load(&config.models)?.into_identifier(config.pipeline());
    let outcomes = identifier.identify_frame(&frame)?;

    let reports: Vec<FaceReport> = outcomes.iter().map(FaceReport::from).collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);

    if let Some(out) = output {
        Overlay::from_config(&config.display).draw(&mut frame, &outcomes);
        frame
            .save(out)
            .with_context(|| format!("writing annotated image {}", out.display()))?;
        tracing::info!(path = %out.display(), "annotated image written");
    }
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let artifacts = Artifacts::load(&config.models)?;
    let summary = artifacts.summary(config.recognition.rejection);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    summary.ensure_consistent()
}

fn devices() {
    let found = Camera::list_devices();
    if found.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in found {
        println!("{:>2}  {}  {} ({}, {})", dev.index, dev.path, dev.name, dev.driver, dev.bus);
    }
}
