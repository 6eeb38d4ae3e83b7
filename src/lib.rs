pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use crate::application::{
    legacy_export_command, quantized_export_command, record_builder_command, run_pipeline,
    submodule_command, ArchivePorts, CommandOutput, CommandRunner, CommandSpec, PipelineError,
    PipelineOutcome, PipelineStep, ProgressReporter, StepError,
};
pub use crate::config::{PipelineConfig, Strictness};
pub use crate::domain::{
    artifact_file_name, checkpoint_url, ArchiveFormat, ArtifactInfo, ConversionRequest,
    MaxDetections, ModelId, ParseError, QuantizationMode,
};
pub use crate::infrastructure::{
    extract_tar_gz, extract_zip, HttpArchivePorts, IndicatifProgressReporter,
    LineProgressReporter, NoProgressReporter, SystemCommandRunner,
};
