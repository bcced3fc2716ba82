use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use snafu::ResultExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ferrdiag_core::compose::drawio::{load_drawio, save_drawio, to_json};
use ferrdiag_core::config::ReconstructConfig;
use ferrdiag_core::error::IoWriteSnafu;
use ferrdiag_core::debug::save_overlay;
use ferrdiag_core::evaluate::metrics::detection_metrics;
use ferrdiag_core::inference::model::JsonSegmentation;
use ferrdiag_core::inference::recognizer::StaticRecognizer;
use ferrdiag_core::pipeline::open_image;
use ferrdiag_core::{Reconstruction, Reconstructor};

#[derive(Parser)]
#[command(name = "reconstruct")]
#[command(about = "Rebuild an editable draw.io diagram from a raster image")]
struct Args {
    #[arg(short, long, help = "Input image path")]
    image: PathBuf,

    #[arg(short, long, help = "Segmentation regions as JSON")]
    segmentation: PathBuf,

    #[arg(short, long, help = "Recognized text blocks as JSON")]
    text: Option<PathBuf>,

    #[arg(short, long, help = "Reconstruction config as JSON")]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "diagram.drawio", help = "Output draw.io file")]
    output: PathBuf,

    #[arg(long, help = "Also write the document as JSON")]
    json: Option<PathBuf>,

    #[arg(long, help = "Write an overlay of the detected nodes")]
    debug: Option<PathBuf>,

    #[arg(long, help = "Reference draw.io file to compare detections against")]
    truth: Option<PathBuf>,

    #[arg(long, default_value = "0.5", help = "IoU needed to match a reference node")]
    match_iou: f32,
}

fn print_summary(result: &Reconstruction) {
    println!("\n=== Reconstruction Summary ===");
    println!("Run: {}", result.run_id);
    println!("Nodes: {}", result.document.len());
    println!("Score: {:.4}", result.score);
    println!("Iterations: {}", result.iterations);
    for record in &result.history {
        println!(
            "  {}. score {:.4}, {} nodes, {} elements and {} regions processed",
            record.iteration,
            record.score,
            record.nodes,
            record.processed_elements,
            record.processed_regions
        );
    }
    if !result.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &result.warnings {
            println!("  - {}", warning);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Input image: {:?}", args.image);
    info!("Segmentation: {:?}", args.segmentation);

    if !args.image.exists() {
        error!("Input image not found: {:?}", args.image);
        return Err(format!("Input image not found: {}", args.image.display()).into());
    }

    let config = match &args.config {
        Some(path) => ReconstructConfig::from_path(path)?,
        None => ReconstructConfig::default(),
    };
    let image = open_image(&args.image)?;
    let model = Arc::new(JsonSegmentation::from_path(&args.segmentation)?);
    let recognizer = Arc::new(match &args.text {
        Some(path) => StaticRecognizer::from_path(path)?,
        None => StaticRecognizer::default(),
    });

    let result = Reconstructor::new(model, recognizer)
        .reconstruct(&image, &config)
        .await?;

    save_drawio(&result.document, &args.output)?;
    info!("Wrote {:?}", args.output);

    if let Some(path) = &args.json {
        std::fs::write(path, to_json(&result.document)?).context(IoWriteSnafu {
            path: path.display().to_string(),
        })?;
        info!("Wrote {:?}", path);
    }
    if let Some(path) = &args.debug {
        save_overlay(&result.document, &image, path)?;
    }

    print_summary(&result);

    if let Some(path) = &args.truth {
        let truth = load_drawio(path)?;
        let metrics = detection_metrics(&result.document.nodes, &truth.nodes, args.match_iou);
        println!("\n=== Detection Metrics ===");
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }

    Ok(())
}
