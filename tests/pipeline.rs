use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;

use efficientdet_prep::{
    extract_tar_gz, extract_zip, run_pipeline, ArchiveFormat, ArchivePorts, CommandOutput,
    CommandRunner, CommandSpec, ConversionRequest, ModelId, NoProgressReporter, PipelineConfig,
    PipelineError, PipelineStep, ProgressReporter, QuantizationMode, StepError, Strictness,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const CHECKPOINT_BASE: &str = "http://mirror.test/efficientdet";
const COCO_BASE: &str = "http://coco.test";

struct FakeArchivePorts {
    archives: HashMap<String, Vec<u8>>,
    downloads: Mutex<Vec<String>>,
}

impl FakeArchivePorts {
    fn new() -> Self {
        Self {
            archives: HashMap::new(),
            downloads: Mutex::new(Vec::new()),
        }
    }

    fn serve(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.archives.insert(url.to_string(), bytes);
        self
    }

    fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

impl ArchivePorts for FakeArchivePorts {
    fn download(
        &self,
        url: &str,
        dest: &Path,
        _progress: &dyn ProgressReporter,
    ) -> Result<u64, StepError> {
        self.downloads.lock().unwrap().push(url.to_string());

        let bytes = self.archives.get(url).ok_or_else(|| StepError::HttpStatus {
            url: url.to_string(),
            status: 404,
        })?;
        fs::write(dest, bytes).map_err(|source| StepError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

        Ok(bytes.len() as u64)
    }

    fn extract(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        dest: &Path,
    ) -> Result<(), StepError> {
        match format {
            ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
            ArchiveFormat::Zip => extract_zip(archive, dest),
        }
    }
}

#[derive(Debug, Clone)]
struct Invocation {
    spec: CommandSpec,
    saved_model_existed: bool,
}

/// Emulates the converter, record builder and git by writing the files each would produce.
struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    failing: Option<(&'static str, i32)>,
    produce_artifacts: bool,
}

impl FakeRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: None,
            produce_artifacts: true,
        }
    }

    fn failing_on(mut self, needle: &'static str, code: i32) -> Self {
        self.failing = Some((needle, code));
        self
    }

    fn without_artifacts(mut self) -> Self {
        self.produce_artifacts = false;
        self
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    fn converter_calls(&self) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .map(|call| call.spec)
            .filter(|spec| spec.flag_value("saved_model_dir").is_some())
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StepError> {
        let saved_model_existed = spec
            .flag_value("saved_model_dir")
            .is_some_and(|dir| Path::new(dir).exists());
        self.calls.lock().unwrap().push(Invocation {
            spec: spec.clone(),
            saved_model_existed,
        });

        if let Some((needle, code)) = self.failing {
            if spec.display_line().contains(needle) {
                return Ok(CommandOutput {
                    code: Some(code),
                    stderr_tail: format!("{needle} blew up"),
                });
            }
        }

        if self.produce_artifacts {
            write_tool_outputs(spec).map_err(|source| StepError::Io {
                path: PathBuf::from("fake-runner"),
                source,
            })?;
        }

        Ok(CommandOutput {
            code: Some(0),
            stderr_tail: String::new(),
        })
    }
}

fn write_tool_outputs(spec: &CommandSpec) -> std::io::Result<()> {
    if spec.args.iter().any(|arg| arg == "tf2.inspector") {
        let saved_model = Path::new(spec.flag_value("saved_model_dir").unwrap_or_default());
        let mode = spec.flag_value("tflite").unwrap_or_default().to_lowercase();
        fs::create_dir_all(saved_model)?;
        fs::write(saved_model.join(format!("{mode}.tflite")), b"quantized")?;
    } else if let Some(path) = spec.flag_value("tflite_path") {
        fs::write(path, b"legacy")?;
    } else if spec.args.iter().any(|arg| arg == "dataset.create_coco_tfrecord") {
        let dir = spec.current_dir.clone().unwrap_or_default();
        fs::write(dir.join("tfrecord").join("val-00000-of-00001.tfrecord"), b"records")?;
    }
    Ok(())
}

fn checkpoint_tarball(name: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let contents = b"model_checkpoint_path: \"model\"\n";

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, format!("{name}/checkpoint"), &contents[..])?;

    Ok(builder.into_inner()?.finish()?)
}

fn coco_zip(entries: Vec<(&str, &str)>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();

    for (name, contents) in entries {
        zip.start_file(name, options)?;
        zip.write_all(contents.as_bytes())?;
    }

    Ok(zip.finish()?.into_inner())
}

fn test_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::rooted_at(root);
    config.automl_dir = root.join("automl").join("efficientdet");
    config.dataset_dir = config.automl_dir.clone();
    config.checkpoint_base_url = CHECKPOINT_BASE.to_string();
    config.coco_base_url = COCO_BASE.to_string();
    config
}

fn request(model: &str, quant: Option<QuantizationMode>) -> ConversionRequest {
    let model: ModelId = model.parse().unwrap();
    ConversionRequest::new(model).with_quant(quant)
}

fn ports_for(model: &str) -> Result<FakeArchivePorts, Box<dyn std::error::Error>> {
    let name = format!("efficientdet-{model}");
    let url = match model.contains("lite") {
        true => format!("{CHECKPOINT_BASE}/coco/{name}.tgz"),
        false => format!("{CHECKPOINT_BASE}/coco2/{name}.tar.gz"),
    };
    Ok(FakeArchivePorts::new().serve(&url, checkpoint_tarball(&name)?))
}

fn with_coco(ports: FakeArchivePorts) -> Result<FakeArchivePorts, Box<dyn std::error::Error>> {
    Ok(ports
        .serve(
            &format!("{COCO_BASE}/annotations/annotations_trainval2017.zip"),
            coco_zip(vec![("annotations/captions_val2017.json", "{}")])?,
        )
        .serve(
            &format!("{COCO_BASE}/zips/val2017.zip"),
            coco_zip(vec![("val2017/000000000139.jpg", "jpeg")])?,
        ))
}

fn leftover_downloads(dir: &Path) -> Result<usize, std::io::Error> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.file_name().to_string_lossy().starts_with(".download-") {
            count += 1;
        }
    }
    Ok(count)
}

#[test]
fn converts_d0_with_legacy_exporter() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = ports_for("d0")?;
    let runner = FakeRunner::new();

    let outcome = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", None),
    )?;

    assert_eq!(
        ports.downloads(),
        vec![format!("{CHECKPOINT_BASE}/coco2/efficientdet-d0.tar.gz")]
    );
    assert!(config
        .checkpoints_dir
        .join("efficientdet-d0")
        .join("checkpoint")
        .is_file());
    assert_eq!(leftover_downloads(&config.checkpoints_dir)?, 0);

    let expected = temp_dir
        .path()
        .join("models")
        .join("efficientdet-d0")
        .join("efficientdet-d0.tflite");
    assert_eq!(outcome.artifact_path, expected);
    assert_eq!(fs::read(&expected)?, b"legacy");

    let converter = runner.converter_calls();
    assert_eq!(converter.len(), 1);
    assert_eq!(converter[0].flag_value("runmode"), Some("saved_model"));
    assert_eq!(converter[0].flag_value("min_score_thresh"), Some("0.0"));
    assert_eq!(converter[0].flag_value("max_boxes_to_draw"), Some("100"));

    let info = outcome.info.unwrap();
    assert_eq!(info.input_resolution, Some(512));
    assert!(!info.keras_export);
    assert_eq!(outcome.calibration_records, None);

    Ok(())
}

#[test]
fn removes_stale_saved_model_before_conversion() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let stale = config
        .checkpoints_dir
        .join("efficientdet-d0")
        .join("saved_model");
    fs::create_dir_all(stale.join("variables"))?;
    fs::write(stale.join("saved_model.pb"), b"old")?;

    let ports = ports_for("d0")?;
    let runner = FakeRunner::new();
    run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", None),
    )?;

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].saved_model_existed);

    Ok(())
}

#[test]
fn converts_lite2_int8_and_builds_calibration_records() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = with_coco(ports_for("lite2")?)?;
    let runner = FakeRunner::new();

    let outcome = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("lite2", Some(QuantizationMode::Int8)),
    )?;

    assert_eq!(
        ports.downloads(),
        vec![
            format!("{CHECKPOINT_BASE}/coco/efficientdet-lite2.tgz"),
            format!("{COCO_BASE}/annotations/annotations_trainval2017.zip"),
            format!("{COCO_BASE}/zips/val2017.zip"),
        ]
    );
    assert!(config
        .dataset_dir
        .join("annotations")
        .join("captions_val2017.json")
        .is_file());
    assert_eq!(leftover_downloads(&config.dataset_dir)?, 0);

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    let builder = &calls[0].spec;
    assert_eq!(builder.args[1], "dataset.create_coco_tfrecord");
    assert_eq!(builder.flag_value("image_dir"), Some("val2017"));
    assert_eq!(builder.current_dir.as_deref(), Some(config.dataset_dir.as_path()));

    let exporter = &calls[1].spec;
    assert_eq!(exporter.flag_value("mode"), Some("export"));
    assert_eq!(exporter.flag_value("tflite"), Some("INT8"));
    assert_eq!(exporter.flag_value("num_calibration_steps"), Some("1000"));
    assert_eq!(
        exporter.flag_value("file_pattern"),
        Some(config.calibration_pattern().as_str())
    );
    assert_eq!(exporter.current_dir.as_deref(), Some(config.automl_dir.as_path()));

    let expected = temp_dir
        .path()
        .join("models")
        .join("efficientdet-lite2")
        .join("efficientdet-lite2-int8.tflite");
    assert_eq!(outcome.artifact_path, expected);
    assert_eq!(fs::read(&expected)?, b"quantized");
    assert_eq!(outcome.calibration_records, Some(1));

    let info = outcome.info.unwrap();
    assert_eq!(info.model_name, "efficientdet-lite2");
    assert_eq!(info.input_resolution, Some(448));
    assert!(info.keras_export);

    Ok(())
}

#[test]
fn reuses_existing_calibration_records_without_network() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    fs::create_dir_all(config.calibration_dir())?;

    let ports = ports_for("d0")?;
    let runner = FakeRunner::new();
    run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", Some(QuantizationMode::Int8)),
    )?;

    assert_eq!(
        ports.downloads(),
        vec![format!("{CHECKPOINT_BASE}/coco2/efficientdet-d0.tar.gz")]
    );
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].spec.args.iter().any(|arg| arg == "tf2.inspector"));

    Ok(())
}

#[test]
fn fetches_only_missing_dataset_components() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    fs::create_dir_all(config.dataset_dir.join("annotations"))?;

    let ports = with_coco(ports_for("d0")?)?;
    let runner = FakeRunner::new();
    run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", Some(QuantizationMode::Int8)),
    )?;

    assert_eq!(
        ports.downloads(),
        vec![
            format!("{CHECKPOINT_BASE}/coco2/efficientdet-d0.tar.gz"),
            format!("{COCO_BASE}/zips/val2017.zip"),
        ]
    );

    Ok(())
}

#[test]
fn fp16_skips_dataset_preparation() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = ports_for("lite0")?;
    let runner = FakeRunner::new();

    let outcome = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("lite0", Some(QuantizationMode::Fp16)),
    )?;

    assert_eq!(ports.downloads().len(), 1);
    assert!(!config.calibration_dir().exists());
    assert!(outcome
        .artifact_path
        .ends_with("efficientdet-lite0/efficientdet-lite0-fp16.tflite"));

    Ok(())
}

#[test]
fn repeated_runs_issue_identical_invocations() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = with_coco(ports_for("lite2")?)?;
    let runner = FakeRunner::new();
    let request = request("lite2", Some(QuantizationMode::Int8));

    run_pipeline(&ports, &runner, &NoProgressReporter::new(), &config, &request)?;
    run_pipeline(&ports, &runner, &NoProgressReporter::new(), &config, &request)?;

    let converter = runner.converter_calls();
    assert_eq!(converter.len(), 2);
    assert_eq!(converter[0], converter[1]);
    // Second run found the records and skipped the builder.
    assert_eq!(runner.calls().len(), 3);

    Ok(())
}

#[test]
fn strict_mode_aborts_on_converter_failure() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = ports_for("d0")?;
    let runner = FakeRunner::new().failing_on("model_inspect.py", 1);

    let err = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", None),
    )
    .unwrap_err();

    assert_eq!(err.step, PipelineStep::Convert);
    match err {
        PipelineError {
            source: StepError::ProcessFailed { code, stderr_tail, .. },
            ..
        } => {
            assert_eq!(code, Some(1));
            assert!(stderr_tail.contains("blew up"));
        }
        other => panic!("unexpected error: {other}"),
    }

    Ok(())
}

#[test]
fn strict_mode_discards_partial_calibration_records() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = with_coco(ports_for("d0")?)?;
    let runner = FakeRunner::new().failing_on("create_coco_tfrecord", 2);

    let err = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", Some(QuantizationMode::Int8)),
    )
    .unwrap_err();

    assert_eq!(err.step, PipelineStep::PrepareDataset);
    assert!(!config.calibration_dir().exists());
    assert!(config.dataset_dir.join("val2017").is_dir());

    Ok(())
}

#[test]
fn lenient_mode_records_warning_and_continues() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let mut config = test_config(temp_dir.path());
    config.strictness = Strictness::Lenient;
    let ports = with_coco(ports_for("d0")?)?;
    let runner = FakeRunner::new().failing_on("create_coco_tfrecord", 2);

    let outcome = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", Some(QuantizationMode::Int8)),
    )?;

    assert_eq!(outcome.warnings.len(), 2);
    assert!(outcome.warnings[0].contains("status 2"));
    assert!(outcome.warnings[1].contains("no calibration records"));
    assert_eq!(outcome.calibration_records, Some(0));
    // An empty directory would make the next run skip the record builder.
    assert!(!config.calibration_dir().exists());
    assert!(outcome.artifact_path.is_file());

    Ok(())
}

#[test]
fn run_after_lenient_builder_failure_rebuilds_records() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let mut config = test_config(temp_dir.path());
    config.strictness = Strictness::Lenient;
    let ports = with_coco(ports_for("d0")?)?;
    let request = request("d0", Some(QuantizationMode::Int8));

    let failing = FakeRunner::new().failing_on("create_coco_tfrecord", 2);
    run_pipeline(&ports, &failing, &NoProgressReporter::new(), &config, &request)?;

    let runner = FakeRunner::new();
    let outcome = run_pipeline(&ports, &runner, &NoProgressReporter::new(), &config, &request)?;

    assert!(runner
        .calls()
        .iter()
        .any(|call| call.spec.display_line().contains("create_coco_tfrecord")));
    assert!(outcome.warnings.is_empty());
    assert!(outcome.calibration_records.is_some_and(|count| count > 0));

    Ok(())
}

#[test]
fn missing_converter_output_is_reported() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = ports_for("d0")?;
    let runner = FakeRunner::new().without_artifacts();

    let err = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", Some(QuantizationMode::Fp32)),
    )
    .unwrap_err();

    assert_eq!(err.step, PipelineStep::PlaceArtifact);
    assert!(matches!(
        err,
        PipelineError {
            source: StepError::MissingArtifact(ref path),
            ..
        } if path.ends_with("saved_model/fp32.tflite")
    ));

    Ok(())
}

#[test]
fn download_failure_stops_before_any_staging() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = FakeArchivePorts::new();
    let runner = FakeRunner::new();

    let err = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d3", None),
    )
    .unwrap_err();

    assert_eq!(err.step, PipelineStep::FetchCheckpoint);
    assert!(matches!(
        err,
        PipelineError {
            source: StepError::HttpStatus { status: 404, .. },
            ..
        }
    ));
    assert!(!config.models_dir.exists());
    assert!(runner.calls().is_empty());
    assert_eq!(leftover_downloads(&config.checkpoints_dir)?, 0);

    Ok(())
}

#[test]
fn corrupt_checkpoint_archive_is_an_archive_error() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let config = test_config(temp_dir.path());
    let ports = FakeArchivePorts::new().serve(
        &format!("{CHECKPOINT_BASE}/coco2/efficientdet-d1.tar.gz"),
        b"definitely not gzip".to_vec(),
    );
    let runner = FakeRunner::new();

    let err = run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d1", None),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError {
            step: PipelineStep::FetchCheckpoint,
            source: StepError::Archive { .. },
        }
    ));
    assert_eq!(leftover_downloads(&config.checkpoints_dir)?, 0);

    Ok(())
}

#[test]
fn submodule_sync_runs_first_when_enabled() -> TestResult {
    let temp_dir = tempfile::tempdir()?;
    let mut config = test_config(temp_dir.path());
    config.update_submodules = true;
    let ports = ports_for("d0")?;
    let runner = FakeRunner::new();

    run_pipeline(
        &ports,
        &runner,
        &NoProgressReporter::new(),
        &config,
        &request("d0", None),
    )?;

    let calls = runner.calls();
    assert_eq!(calls[0].spec.program, PathBuf::from("git"));
    assert_eq!(
        calls[0].spec.args,
        vec!["submodule", "update", "--init", "--recursive"]
    );

    Ok(())
}
