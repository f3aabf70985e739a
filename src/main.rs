use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use nounify::{
    config, FaceOutcome, FileSink, ModelCache, Nounifier, OnnxLoader, OverlayCache, SourceImage,
};

#[derive(Parser)]
#[command(name = "nounify")]
#[command(version, about = "Draw glasses over every face in a photo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image and export the composite as PNG
    Render {
        /// Image to process
        image: PathBuf,
        /// Minimum face confidence in [0, 1] (defaults to the config value)
        #[arg(short, long)]
        min_confidence: Option<f32>,
        /// Output PNG path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Glasses overlay image
        #[arg(long)]
        overlay: Option<PathBuf>,
    },
    /// Open config file in editor
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            image,
            min_confidence,
            output,
            model_dir,
            overlay,
        } => {
            let cfg = config::load_config(None)?;
            let cfg = config::Config {
                min_confidence: min_confidence.unwrap_or(cfg.min_confidence),
                output: output.unwrap_or(cfg.output),
                model_dir: model_dir.unwrap_or(cfg.model_dir),
                overlay: overlay.unwrap_or(cfg.overlay),
            };
            cfg.validate()?;
            render(&cfg, image).await
        }
        Commands::Config => open_config(),
    }
}

async fn render(cfg: &config::Config, image: PathBuf) -> Result<()> {
    info!("Models: {}", cfg.model_dir.display());
    info!("Overlay: {}", cfg.overlay.display());

    let models = Arc::new(ModelCache::new(OnnxLoader::in_dir(&cfg.model_dir)));
    let nounifier = Nounifier::new(models, OverlayCache::from_path(&cfg.overlay));

    let source = SourceImage::open(&image)
        .await
        .with_context(|| format!("Failed to read {}", image.display()))?;

    let outcome = nounifier
        .run(source, cfg.min_confidence)
        .await
        .context("Failed to render image")?;

    for (index, face) in outcome.faces.iter().enumerate() {
        match face {
            FaceOutcome::Drawn(t) => info!(
                "Face {}: glasses at ({:.1}, {:.1}), {:.1}x{:.1}, {:.1} deg",
                index + 1,
                t.anchor.x,
                t.anchor.y,
                t.width,
                t.height,
                t.angle_radians.to_degrees()
            ),
            FaceOutcome::Skipped { reason } => warn!("Face {}: skipped ({})", index + 1, reason),
        }
    }
    if outcome.faces.is_empty() {
        info!("No faces found; exporting the original image");
    }

    let mut sink = FileSink::at(&cfg.output);
    nounifier
        .export_to(&mut sink)
        .context("Failed to export render")?;

    info!("✓ Wrote {}", cfg.output.display());
    Ok(())
}

fn open_config() -> Result<()> {
    let path: &Path = &config::CONFIG_PATH;
    if config::ensure_config_file(path)? {
        info!("Created {} with default settings", path.display());
    }

    let editor = env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    info!("Editing {} with {}", path.display(), editor);

    let status = std::process::Command::new(&editor)
        .arg(path)
        .status()
        .with_context(|| format!("Failed to launch {}", editor))?;
    if !status.success() {
        anyhow::bail!("{} exited with {}", editor, status);
    }

    config::load_config(Some(path)).context("Edited config is invalid")?;
    info!("✓ Config saved");
    Ok(())
}
