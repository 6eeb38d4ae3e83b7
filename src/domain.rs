use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const MODEL_PREFIX: &str = "efficientdet-";
pub const SAVED_MODEL_DIR_NAME: &str = "saved_model";
pub const CALIBRATION_DIR_NAME: &str = "tfrecord";
pub const CALIBRATION_STEPS: u32 = 1000;
pub const DEFAULT_MAX_DETECTIONS: u32 = 100;

pub const DEFAULT_CHECKPOINT_BASE_URL: &str =
    "https://storage.googleapis.com/cloud-tpu-checkpoints/efficientdet";
pub const DEFAULT_COCO_BASE_URL: &str = "http://images.cocodataset.org";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("model identifier is empty")]
    EmptyModel,
    #[error("model identifier contains invalid character {0:?}")]
    InvalidModelChar(char),
    #[error("unknown quantization mode {0:?} (expected INT8, FP16 or FP32)")]
    UnknownQuantization(String),
    #[error("max detections must be a positive integer, got {0:?}")]
    InvalidMaxDetections(String),
}

/// Model family token such as `d0` or `lite2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId(String);

impl ModelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn full_name(&self) -> String {
        format!("{MODEL_PREFIX}{}", self.0)
    }

    /// Lite models live under a different bucket path and use `.tgz`.
    pub fn is_lite(&self) -> bool {
        self.0.contains("lite")
    }
}

impl FromStr for ModelId {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let token = trimmed.strip_prefix(MODEL_PREFIX).unwrap_or(trimmed);

        if token.is_empty() {
            return Err(ParseError::EmptyModel);
        }

        if let Some(bad) = token
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ParseError::InvalidModelChar(bad));
        }

        Ok(Self(token.to_string()))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizationMode {
    Int8,
    Fp16,
    Fp32,
}

impl QuantizationMode {
    /// Token the new exporter expects for `--tflite`.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationMode::Int8 => "INT8",
            QuantizationMode::Fp16 => "FP16",
            QuantizationMode::Fp32 => "FP32",
        }
    }

    pub fn lower(&self) -> &'static str {
        match self {
            QuantizationMode::Int8 => "int8",
            QuantizationMode::Fp16 => "fp16",
            QuantizationMode::Fp32 => "fp32",
        }
    }

    pub fn needs_calibration(&self) -> bool {
        matches!(self, QuantizationMode::Int8)
    }
}

impl FromStr for QuantizationMode {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INT8" => Ok(QuantizationMode::Int8),
            "FP16" => Ok(QuantizationMode::Fp16),
            "FP32" => Ok(QuantizationMode::Fp32),
            _ => Err(ParseError::UnknownQuantization(value.to_string())),
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDetections(u32);

impl MaxDetections {
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for MaxDetections {
    fn default() -> Self {
        Self(DEFAULT_MAX_DETECTIONS)
    }
}

impl FromStr for MaxDetections {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u32>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ParseError::InvalidMaxDetections(value.to_string()))
    }
}

impl fmt::Display for MaxDetections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub model: ModelId,
    pub quant: Option<QuantizationMode>,
    pub max_detections: MaxDetections,
}

impl ConversionRequest {
    pub fn new(model: ModelId) -> Self {
        Self {
            model,
            quant: None,
            max_detections: MaxDetections::default(),
        }
    }

    pub fn with_quant(mut self, quant: Option<QuantizationMode>) -> Self {
        self.quant = quant;
        self
    }

    pub fn with_max_detections(mut self, max_detections: MaxDetections) -> Self {
        self.max_detections = max_detections;
        self
    }

    pub fn artifact_file_name(&self) -> String {
        artifact_file_name(&self.model, self.quant)
    }
}

pub fn checkpoint_url(base_url: &str, model: &ModelId) -> String {
    let base = base_url.trim_end_matches('/');
    let name = model.full_name();

    if model.is_lite() {
        format!("{base}/coco/{name}.tgz")
    } else {
        format!("{base}/coco2/{name}.tar.gz")
    }
}

pub fn artifact_file_name(model: &ModelId, quant: Option<QuantizationMode>) -> String {
    match quant {
        Some(mode) => format!("{}-{}.tflite", model.full_name(), mode.lower()),
        None => format!("{}.tflite", model.full_name()),
    }
}

/// An archive of the COCO 2017 calibration corpus and the directory it unpacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetArchive {
    pub url_path: &'static str,
    pub extracted_dir: &'static str,
}

pub const COCO_ARCHIVES: [DatasetArchive; 2] = [
    DatasetArchive {
        url_path: "annotations/annotations_trainval2017.zip",
        extracted_dir: "annotations",
    },
    DatasetArchive {
        url_path: "zips/val2017.zip",
        extracted_dir: "val2017",
    },
];

impl DatasetArchive {
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.url_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
        }
    }
}

// Longer keys first so `d7x` wins over `d7` and `lite3x` over `lite3`.
const INPUT_RESOLUTIONS: [(&str, u32); 15] = [
    ("lite3x", 512),
    ("lite0", 320),
    ("lite1", 384),
    ("lite2", 448),
    ("lite3", 512),
    ("lite4", 512),
    ("d7x", 1536),
    ("d0", 512),
    ("d1", 640),
    ("d2", 768),
    ("d3", 896),
    ("d4", 1024),
    ("d5", 1280),
    ("d6", 1280),
    ("d7", 1536),
];

fn input_resolution_for(token: &str) -> Option<u32> {
    INPUT_RESOLUTIONS
        .iter()
        .find(|(key, _)| token.starts_with(key))
        .map(|(_, resolution)| *resolution)
}

/// What a runtime needs to know about a converted file, recovered from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub model_name: String,
    pub input_resolution: Option<u32>,
    /// Files produced by the new exporter carry their precision in the name and
    /// use a different output tensor layout from the legacy export.
    pub keras_export: bool,
}

impl ArtifactInfo {
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let start = stem.find(MODEL_PREFIX)?;
        let model_name = &stem[start..];
        let token = &model_name[MODEL_PREFIX.len()..];

        let keras_export = ["int8", "fp16", "fp32"]
            .iter()
            .any(|mode| stem.contains(mode));
        let model_name = match keras_export {
            true => model_name
                .rsplit_once('-')
                .map(|(head, _)| head)
                .unwrap_or(model_name),
            false => model_name,
        };

        Some(Self {
            model_name: model_name.to_string(),
            input_resolution: input_resolution_for(token),
            keras_export,
        })
    }
}

pub fn checkpoint_dir(checkpoints_root: &Path, model: &ModelId) -> PathBuf {
    checkpoints_root.join(model.full_name())
}

pub fn output_dir(models_root: &Path, model: &ModelId) -> PathBuf {
    models_root.join(model.full_name())
}
