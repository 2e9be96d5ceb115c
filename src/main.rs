use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::{
    config, storage::Gallery, IdentityMatcher, MatchOutcome, MatchResult, OnnxOracle,
};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facegate")]
#[command(
    version,
    about = "Match face images against a gallery of registered identities"
)]
struct Cli {
    /// Config file to use instead of the system-wide one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or replace) the face image of an identity
    Register {
        /// Identity to register
        #[arg(short, long)]
        id: String,
        /// Image to move into the gallery
        image: PathBuf,
    },
    /// Find the registered identity shown in an image
    Authenticate {
        image: PathBuf,
        /// Report "no face detected" separately from "no match"
        #[arg(long)]
        strict: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a registered identity
    Remove {
        #[arg(short, long)]
        id: String,
    },
    /// List registered identities
    List,
    /// Open config file in editor
    Config,
}

fn main() -> Result<ExitCode> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Register { id, image } => register(&cfg, &id, &image),
        Commands::Authenticate {
            image,
            strict,
            json,
        } => authenticate(&cfg, &image, strict, json),
        Commands::Remove { id } => remove(&cfg, &id),
        Commands::List => list(&cfg),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn open_matcher(cfg: &config::Config) -> Result<IdentityMatcher<OnnxOracle>> {
    let oracle =
        OnnxOracle::from_config(cfg).context("Failed to initialize face recognition pipeline")?;
    let gallery = Gallery::open(&cfg.gallery_dir, cfg.extensions.as_slice())?;
    let matcher = IdentityMatcher::with_gallery(gallery, oracle)
        .with_context(|| format!("Failed to open gallery {}", cfg.gallery_dir.display()))?;
    for d in matcher.diagnostics() {
        warn!("skipped {}", d);
    }
    Ok(matcher)
}

fn register(cfg: &config::Config, id: &str, image: &Path) -> Result<ExitCode> {
    info!("Registering {} from {}", id, image.display());
    let mut matcher = open_matcher(cfg)?;
    let path = matcher
        .register(id, image)
        .with_context(|| format!("Failed to register {}", id))?;

    if let Some(d) = matcher.diagnostics().first() {
        warn!("Stored {} but it cannot be matched: {}", path.display(), d);
        return Ok(ExitCode::FAILURE);
    }
    info!("✓ Registered {} at {}", id, path.display());
    Ok(ExitCode::SUCCESS)
}

fn authenticate(cfg: &config::Config, image: &Path, strict: bool, json: bool) -> Result<ExitCode> {
    let mut matcher = open_matcher(cfg)?;
    info!("Matching against {} registered identities", matcher.len());

    let outcome = matcher.authenticate_detailed(image)?;
    let matched = matches!(outcome, MatchOutcome::Identity(_));

    if json {
        let out = if strict {
            serde_json::to_string(&outcome)?
        } else {
            serde_json::to_string(&MatchResult::from(outcome))?
        };
        println!("{}", out);
    } else {
        match outcome {
            MatchOutcome::Identity(id) => println!("{}", id),
            MatchOutcome::NoFaceDetected if strict => println!("no face detected"),
            MatchOutcome::NoFaceDetected | MatchOutcome::NoMatch => println!("no match"),
        }
    }

    Ok(if matched {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn remove(cfg: &config::Config, id: &str) -> Result<ExitCode> {
    let gallery = Gallery::open(&cfg.gallery_dir, cfg.extensions.as_slice())?;
    if gallery.remove(id)? {
        info!("✓ Removed {}", id);
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("{} is not registered", id);
        Ok(ExitCode::FAILURE)
    }
}

fn list(cfg: &config::Config) -> Result<ExitCode> {
    let gallery = Gallery::open(&cfg.gallery_dir, cfg.extensions.as_slice())?;
    for face in gallery.list()? {
        println!("{}\t{}", face.identity_id, face.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn open_config(path: Option<&Path>) -> Result<ExitCode> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(ExitCode::SUCCESS)
}
