use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{
    CALIBRATION_DIR_NAME, DEFAULT_CHECKPOINT_BASE_URL, DEFAULT_COCO_BASE_URL,
};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// How a nonzero exit from an external tool is treated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    #[default]
    Strict,
    /// Log and continue, matching tools that exit nonzero on cosmetic warnings.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub checkpoints_dir: PathBuf,
    pub models_dir: PathBuf,
    pub automl_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub python: PathBuf,
    pub checkpoint_base_url: String,
    pub coco_base_url: String,
    pub download_timeout: Duration,
    pub process_timeout: Duration,
    pub strictness: Strictness,
    pub update_submodules: bool,
}

impl PipelineConfig {
    /// Layout rooted at `workspace`, mirroring `checkpoints/`, `models/` and a
    /// sibling `automl/efficientdet` checkout.
    pub fn rooted_at(workspace: &Path) -> Self {
        let automl_dir = workspace.join("..").join("automl").join("efficientdet");
        Self {
            checkpoints_dir: workspace.join("checkpoints"),
            models_dir: workspace.join("models"),
            dataset_dir: automl_dir.clone(),
            automl_dir,
            python: PathBuf::from("python"),
            checkpoint_base_url: DEFAULT_CHECKPOINT_BASE_URL.to_string(),
            coco_base_url: DEFAULT_COCO_BASE_URL.to_string(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            strictness: Strictness::Strict,
            update_submodules: false,
        }
    }

    pub fn calibration_dir(&self) -> PathBuf {
        self.dataset_dir.join(CALIBRATION_DIR_NAME)
    }

    pub fn calibration_pattern(&self) -> String {
        format!("{}/*.tfrecord", self.calibration_dir().display())
    }

    /// Converter runs with its own working directory, so every root is made
    /// absolute before any step sees it.
    pub fn absolutized(mut self) -> std::io::Result<Self> {
        self.checkpoints_dir = std::path::absolute(&self.checkpoints_dir)?;
        self.models_dir = std::path::absolute(&self.models_dir)?;
        self.automl_dir = std::path::absolute(&self.automl_dir)?;
        self.dataset_dir = std::path::absolute(&self.dataset_dir)?;
        Ok(self)
    }
}
