use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{PipelineConfig, Strictness};
use crate::domain::{
    checkpoint_dir, checkpoint_url, output_dir, ArchiveFormat, ArtifactInfo, ConversionRequest,
    CALIBRATION_STEPS, COCO_ARCHIVES, SAVED_MODEL_DIR_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    SyncSubmodules,
    FetchCheckpoint,
    CleanStaleState,
    EnsureOutputDir,
    PrepareDataset,
    Convert,
    PlaceArtifact,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::SyncSubmodules => "sync submodules",
            PipelineStep::FetchCheckpoint => "fetch checkpoint",
            PipelineStep::CleanStaleState => "clean stale saved model",
            PipelineStep::EnsureOutputDir => "create output directory",
            PipelineStep::PrepareDataset => "prepare calibration dataset",
            PipelineStep::Convert => "convert model",
            PipelineStep::PlaceArtifact => "place artifact",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("download of {url} failed: {reason}")]
    Network { url: String, reason: String },
    #[error("download of {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("archive {} is corrupt or unreadable: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {}{}", exit_label(*code), stderr_suffix(stderr_tail))]
    ProcessFailed {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("{what} timed out after {}s", after.as_secs())]
    Timeout { what: String, after: Duration },
    #[error("expected artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

fn stderr_suffix(tail: &str) -> String {
    match tail.trim() {
        "" => String::new(),
        tail => format!("\n{tail}"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct PipelineError {
    pub step: PipelineStep,
    #[source]
    pub source: StepError,
}

trait StepContext<T> {
    fn at(self, step: PipelineStep) -> Result<T, PipelineError>;
}

impl<T> StepContext<T> for Result<T, StepError> {
    fn at(self, step: PipelineStep) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError { step, source })
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StepError + '_ {
    move |source| StepError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Network and archive collaborators.
pub trait ArchivePorts: Send + Sync {
    /// Streams `url` into the file at `dest`, returning the number of bytes written.
    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<u64, StepError>;
    fn extract(&self, archive: &Path, format: ArchiveFormat, dest: &Path)
        -> Result<(), StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}={value}"))
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn display_program(&self) -> String {
        self.program.display().to_string()
    }

    pub fn display_line(&self) -> String {
        let mut line = self.display_program();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn flag_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{name}=");
        self.args.iter().find_map(|arg| arg.strip_prefix(&prefix))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external tools. Spawn failures and timeouts are errors; a nonzero exit
/// is returned as output for the pipeline to judge.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StepError>;
}

pub trait ProgressReporter: Send + Sync {
    fn on_start(&self, request: &ConversionRequest);
    fn on_step(&self, step: PipelineStep, detail: &str);
    fn on_download(&self, url: &str, downloaded: u64, total: Option<u64>);
    fn on_warning(&self, message: &str);
    fn on_finish(&self, outcome: &PipelineOutcome);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub artifact_path: PathBuf,
    pub output_dir: PathBuf,
    pub info: Option<ArtifactInfo>,
    pub calibration_records: Option<usize>,
    pub warnings: Vec<String>,
}

pub fn submodule_command(config: &PipelineConfig) -> CommandSpec {
    CommandSpec::new("git", config.process_timeout)
        .arg("submodule")
        .arg("update")
        .arg("--init")
        .arg("--recursive")
}

pub fn record_builder_command(config: &PipelineConfig) -> CommandSpec {
    CommandSpec::new(&config.python, config.process_timeout)
        .arg("-m")
        .arg("dataset.create_coco_tfrecord")
        .flag("image_dir", "val2017")
        .flag(
            "caption_annotations_file",
            "annotations/captions_val2017.json",
        )
        .flag("output_file_prefix", "tfrecord/val")
        .current_dir(&config.dataset_dir)
}

pub fn legacy_export_command(config: &PipelineConfig, request: &ConversionRequest) -> CommandSpec {
    let ckpt = checkpoint_dir(&config.checkpoints_dir, &request.model);
    let artifact = output_dir(&config.models_dir, &request.model).join(request.artifact_file_name());

    CommandSpec::new(&config.python, config.process_timeout)
        .arg(config.automl_dir.join("model_inspect.py").display().to_string())
        .flag("runmode", "saved_model")
        .flag("model_name", request.model.full_name())
        .flag("ckpt_path", ckpt.display())
        .flag("max_boxes_to_draw", request.max_detections)
        .flag("saved_model_dir", ckpt.join(SAVED_MODEL_DIR_NAME).display())
        .flag("min_score_thresh", "0.0")
        .flag("tflite_path", artifact.display())
}

pub fn quantized_export_command(
    config: &PipelineConfig,
    request: &ConversionRequest,
) -> Option<CommandSpec> {
    let mode = request.quant?;
    let ckpt = checkpoint_dir(&config.checkpoints_dir, &request.model);

    let spec = CommandSpec::new(&config.python, config.process_timeout)
        .arg("-m")
        .arg("tf2.inspector")
        .flag("mode", "export")
        .flag("file_pattern", config.calibration_pattern())
        .flag("model_name", request.model.full_name())
        .flag("model_dir", ckpt.display())
        .flag("num_calibration_steps", CALIBRATION_STEPS)
        .flag(
            "hparams",
            format!("tflite_max_detections={}", request.max_detections),
        )
        .flag("saved_model_dir", ckpt.join(SAVED_MODEL_DIR_NAME).display())
        .flag("tflite", mode)
        .current_dir(&config.automl_dir);

    Some(spec)
}

pub fn run_pipeline(
    ports: &dyn ArchivePorts,
    runner: &dyn CommandRunner,
    progress: &dyn ProgressReporter,
    config: &PipelineConfig,
    request: &ConversionRequest,
) -> Result<PipelineOutcome, PipelineError> {
    let mut warnings = Vec::new();
    progress.on_start(request);

    if config.update_submodules {
        let spec = submodule_command(config);
        progress.on_step(PipelineStep::SyncSubmodules, &spec.display_line());
        execute(runner, progress, config, &spec, &mut warnings).at(PipelineStep::SyncSubmodules)?;
    }

    let url = checkpoint_url(&config.checkpoint_base_url, &request.model);
    progress.on_step(PipelineStep::FetchCheckpoint, &url);
    fs::create_dir_all(&config.checkpoints_dir)
        .map_err(io_at(&config.checkpoints_dir))
        .at(PipelineStep::FetchCheckpoint)?;
    let format = ArchiveFormat::from_name(&url).unwrap_or(ArchiveFormat::TarGz);
    fetch_and_extract(ports, progress, &url, format, &config.checkpoints_dir)
        .at(PipelineStep::FetchCheckpoint)?;

    let ckpt = checkpoint_dir(&config.checkpoints_dir, &request.model);
    let saved_model = ckpt.join(SAVED_MODEL_DIR_NAME);
    progress.on_step(PipelineStep::CleanStaleState, &saved_model.display().to_string());
    remove_stale_saved_model(&saved_model).at(PipelineStep::CleanStaleState)?;

    let out_dir = output_dir(&config.models_dir, &request.model);
    progress.on_step(PipelineStep::EnsureOutputDir, &out_dir.display().to_string());
    fs::create_dir_all(&out_dir)
        .map_err(io_at(&out_dir))
        .at(PipelineStep::EnsureOutputDir)?;

    let mut calibration_records = None;
    if request.quant.is_some_and(|mode| mode.needs_calibration()) {
        let calibration_dir = config.calibration_dir();
        progress.on_step(
            PipelineStep::PrepareDataset,
            &calibration_dir.display().to_string(),
        );
        prepare_calibration_dataset(ports, runner, progress, config, &mut warnings)
            .at(PipelineStep::PrepareDataset)?;
        calibration_records = Some(count_records(&calibration_dir));
    }

    let spec = match quantized_export_command(config, request) {
        Some(spec) => spec,
        None => legacy_export_command(config, request),
    };
    progress.on_step(PipelineStep::Convert, &spec.display_line());
    execute(runner, progress, config, &spec, &mut warnings).at(PipelineStep::Convert)?;

    let artifact_path = out_dir.join(request.artifact_file_name());
    progress.on_step(PipelineStep::PlaceArtifact, &artifact_path.display().to_string());
    place_artifact(&saved_model, request, &artifact_path).at(PipelineStep::PlaceArtifact)?;

    let outcome = PipelineOutcome {
        info: ArtifactInfo::from_path(&artifact_path),
        artifact_path,
        output_dir: out_dir,
        calibration_records,
        warnings,
    };
    info!(artifact = %outcome.artifact_path.display(), "conversion finished");
    progress.on_finish(&outcome);

    Ok(outcome)
}

fn fetch_and_extract(
    ports: &dyn ArchivePorts,
    progress: &dyn ProgressReporter,
    url: &str,
    format: ArchiveFormat,
    dest: &Path,
) -> Result<(), StepError> {
    // Dropping the path removes the archive on every exit path.
    let archive = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(format.suffix())
        .tempfile_in(dest)
        .map_err(io_at(dest))?
        .into_temp_path();

    let bytes = ports.download(url, &archive, progress)?;
    info!(url, bytes, "downloaded archive");

    ports.extract(&archive, format, dest)?;
    debug!(dest = %dest.display(), "extracted archive");

    let archive_path = archive.to_path_buf();
    archive.close().map_err(io_at(&archive_path))?;
    Ok(())
}

fn remove_stale_saved_model(saved_model: &Path) -> Result<(), StepError> {
    if saved_model.is_dir() {
        info!(path = %saved_model.display(), "removing stale saved model");
        fs::remove_dir_all(saved_model).map_err(io_at(saved_model))?;
    }
    Ok(())
}

fn prepare_calibration_dataset(
    ports: &dyn ArchivePorts,
    runner: &dyn CommandRunner,
    progress: &dyn ProgressReporter,
    config: &PipelineConfig,
    warnings: &mut Vec<String>,
) -> Result<(), StepError> {
    let calibration_dir = config.calibration_dir();
    if calibration_dir.is_dir() {
        // Presence only; an incomplete directory is not detected.
        info!(path = %calibration_dir.display(), "reusing calibration records");
        return Ok(());
    }

    fs::create_dir_all(&config.dataset_dir).map_err(io_at(&config.dataset_dir))?;

    for archive in COCO_ARCHIVES {
        let target = config.dataset_dir.join(archive.extracted_dir);
        if target.exists() {
            debug!(path = %target.display(), "dataset component already present");
            continue;
        }

        let url = archive.url(&config.coco_base_url);
        fetch_and_extract(ports, progress, &url, ArchiveFormat::Zip, &config.dataset_dir)?;
    }

    fs::create_dir_all(&calibration_dir).map_err(io_at(&calibration_dir))?;

    let spec = record_builder_command(config);
    if let Err(err) = execute(runner, progress, config, &spec, warnings) {
        // Leaving the directory behind would make the next run skip this step.
        if let Err(cleanup) = fs::remove_dir_all(&calibration_dir) {
            warn!(path = %calibration_dir.display(), error = %cleanup, "failed to remove partial calibration records");
        }
        return Err(err);
    }

    if count_records(&calibration_dir) == 0 {
        fs::remove_dir_all(&calibration_dir).map_err(io_at(&calibration_dir))?;
        let message = format!(
            "no calibration records were written to {}, removed it so the next run rebuilds them",
            calibration_dir.display()
        );
        warn!("{message}");
        progress.on_warning(&message);
        warnings.push(message);
    }

    Ok(())
}

fn count_records(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "tfrecord")
        })
        .count()
}

fn execute(
    runner: &dyn CommandRunner,
    progress: &dyn ProgressReporter,
    config: &PipelineConfig,
    spec: &CommandSpec,
    warnings: &mut Vec<String>,
) -> Result<(), StepError> {
    debug!(command = %spec.display_line(), "running external tool");
    let output = runner.run(spec)?;

    if output.success() {
        return Ok(());
    }

    match config.strictness {
        Strictness::Strict => Err(StepError::ProcessFailed {
            program: spec.display_program(),
            code: output.code,
            stderr_tail: output.stderr_tail,
        }),
        Strictness::Lenient => {
            let message = format!(
                "{} exited with {}, continuing",
                spec.display_program(),
                exit_label(output.code)
            );
            warn!("{message}");
            progress.on_warning(&message);
            warnings.push(message);
            Ok(())
        }
    }
}

fn place_artifact(
    saved_model: &Path,
    request: &ConversionRequest,
    artifact_path: &Path,
) -> Result<(), StepError> {
    if let Some(mode) = request.quant {
        let produced = saved_model.join(format!("{}.tflite", mode.lower()));
        if !produced.is_file() {
            return Err(StepError::MissingArtifact(produced));
        }
        fs::copy(&produced, artifact_path).map_err(io_at(artifact_path))?;
    }

    if !artifact_path.is_file() {
        return Err(StepError::MissingArtifact(artifact_path.to_path_buf()));
    }

    Ok(())
}
