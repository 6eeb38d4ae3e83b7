use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use console::style;
use efficientdet_prep::{
    run_pipeline, ConversionRequest, HttpArchivePorts, IndicatifProgressReporter,
    LineProgressReporter, MaxDetections, ModelId, PipelineConfig, ProgressReporter,
    QuantizationMode, Strictness, SystemCommandRunner,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Download an EfficientDet checkpoint and convert it to TFLite")]
struct Cli {
    /// EfficientDet version (d0, d2, lite0, lite2, ...)
    #[arg(long)]
    model: ModelId,

    /// Quantization option (INT8, FP16, FP32)
    #[arg(long)]
    quant: Option<QuantizationMode>,

    /// Maximum number of detections
    #[arg(long, default_value_t = MaxDetections::default())]
    max_detections: MaxDetections,

    #[arg(long, env = "EFFDET_CHECKPOINTS_DIR")]
    checkpoints_dir: Option<PathBuf>,

    #[arg(long, env = "EFFDET_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Checkout of automl/efficientdet holding the converter scripts
    #[arg(long, env = "EFFDET_AUTOML_DIR")]
    automl_dir: Option<PathBuf>,

    /// Where the COCO calibration corpus lives (defaults to the automl checkout)
    #[arg(long, env = "EFFDET_DATASET_DIR")]
    dataset_dir: Option<PathBuf>,

    #[arg(long, env = "EFFDET_PYTHON", default_value = "python")]
    python: PathBuf,

    #[arg(long, env = "EFFDET_CHECKPOINT_BASE_URL")]
    checkpoint_base_url: Option<String>,

    #[arg(long, env = "EFFDET_COCO_BASE_URL")]
    coco_base_url: Option<String>,

    #[arg(long, default_value_t = 3600)]
    download_timeout_secs: u64,

    #[arg(long, default_value_t = 7200)]
    process_timeout_secs: u64,

    /// Keep going when an external tool exits nonzero
    #[arg(long)]
    lenient: bool,

    /// Run `git submodule update --init --recursive` first
    #[arg(long)]
    update_submodules: bool,

    /// Line-based progress instead of a spinner
    #[arg(long)]
    plain: bool,
}

impl Cli {
    fn config(&self) -> std::io::Result<PipelineConfig> {
        let workspace = std::env::current_dir()?;
        let mut config = PipelineConfig::rooted_at(&workspace);

        if let Some(dir) = &self.checkpoints_dir {
            config.checkpoints_dir = dir.clone();
        }
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(dir) = &self.automl_dir {
            config.automl_dir = dir.clone();
            config.dataset_dir = dir.clone();
        }
        if let Some(dir) = &self.dataset_dir {
            config.dataset_dir = dir.clone();
        }
        if let Some(url) = &self.checkpoint_base_url {
            config.checkpoint_base_url = url.clone();
        }
        if let Some(url) = &self.coco_base_url {
            config.coco_base_url = url.clone();
        }

        config.python = self.python.clone();
        config.download_timeout = Duration::from_secs(self.download_timeout_secs);
        config.process_timeout = Duration::from_secs(self.process_timeout_secs);
        config.update_submodules = self.update_submodules;
        config.strictness = match self.lenient {
            true => Strictness::Lenient,
            false => Strictness::Strict,
        };

        config.absolutized()
    }
}

/// The spinner redraws in place, so info lines on stderr would tear it.
/// `RUST_LOG` still overrides either default.
fn default_log_directive(plain: bool) -> &'static str {
    match plain {
        true => "info",
        false => "warn",
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_directive(cli.plain))),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config()?;
    let request = ConversionRequest::new(cli.model.clone())
        .with_quant(cli.quant)
        .with_max_detections(cli.max_detections);

    let ports = HttpArchivePorts::new(config.download_timeout)?;
    let runner = SystemCommandRunner::new();
    let progress: Box<dyn ProgressReporter> = match cli.plain {
        true => Box::new(LineProgressReporter::new()),
        false => Box::new(IndicatifProgressReporter::new()),
    };

    let outcome = run_pipeline(&ports, &runner, progress.as_ref(), &config, &request)?;

    if let Some(resolution) = outcome.info.as_ref().and_then(|info| info.input_resolution) {
        println!("Input resolution: {resolution}x{resolution}");
    }
    for warning in &outcome.warnings {
        eprintln!("{}", style(format!("warning: {warning}")).yellow());
    }
    println!(
        "You can find the converted model in '{}'.",
        outcome.output_dir.display()
    );
    println!("{}", style("Done").green());

    Ok(())
}
