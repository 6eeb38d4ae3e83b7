use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use console::style;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, warn};

use crate::application::{
    ArchivePorts, CommandOutput, CommandRunner, CommandSpec, PipelineOutcome, PipelineStep,
    ProgressReporter, StepError,
};
use crate::domain::{ArchiveFormat, ConversionRequest};

const DOWNLOAD_CHUNK: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;

pub struct HttpArchivePorts {
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl HttpArchivePorts {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { client, timeout })
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> StepError {
        if err.is_timeout() {
            StepError::Timeout {
                what: format!("download of {url}"),
                after: self.timeout,
            }
        } else {
            StepError::Network {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// The client timeout covers the whole request, so a failure past the
    /// deadline is a timeout even when the body reader reports it otherwise.
    fn read_error(&self, url: &str, err: io::Error, started: Instant) -> StepError {
        if io_timed_out(&err) || started.elapsed() >= self.timeout {
            StepError::Timeout {
                what: format!("download of {url}"),
                after: self.timeout,
            }
        } else {
            StepError::Network {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

fn io_timed_out(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::TimedOut {
        return true;
    }

    let mut cause = err
        .get_ref()
        .map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(current) = cause {
        if let Some(reqwest_err) = current.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_timeout() {
                return true;
            }
        }
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        cause = current.source();
    }

    false
}

impl ArchivePorts for HttpArchivePorts {
    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<u64, StepError> {
        let started = Instant::now();
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| self.request_error(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StepError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let io_error = |source| StepError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(dest).map_err(io_error)?;
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK];
        let mut downloaded = 0u64;

        progress.on_download(url, 0, total);
        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.read_error(url, err, started)),
            };

            file.write_all(&buffer[..read]).map_err(io_error)?;
            downloaded += read as u64;
            progress.on_download(url, downloaded, total);
        }
        file.flush().map_err(io_error)?;

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(StepError::Network {
                    url: url.to_string(),
                    reason: format!("truncated body: {downloaded} of {expected} bytes"),
                });
            }
        }

        Ok(downloaded)
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

fn archive_error(archive: &Path, reason: impl ToString) -> StepError {
    StepError::Archive {
        path: archive.to_path_buf(),
        reason: reason.to_string(),
    }
}

pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), StepError> {
    let file = fs::File::open(archive).map_err(|source| StepError::Io {
        path: archive.to_path_buf(),
        source,
    })?;

    let decoder = GzDecoder::new(BufReader::new(file));
    let mut tarball = tar::Archive::new(decoder);

    // `unpack` refuses entries that would land outside `dest`.
    tarball
        .unpack(dest)
        .map_err(|err| archive_error(archive, err))
}

pub fn extract_zip(archive: &Path, dest: &Path) -> Result<(), StepError> {
    let file = fs::File::open(archive).map_err(|source| StepError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| archive_error(archive, err))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| archive_error(archive, err))?;

        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!(entry = entry.name(), "skipping zip entry outside target");
                continue;
            }
        };
        let out_path = dest.join(&relative);
        let io_error = |source| StepError::Io {
            path: out_path.clone(),
            source,
        };

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(io_error)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut output = fs::File::create(&out_path).map_err(io_error)?;
        io::copy(&mut entry, &mut output)
            .map_err(|err| archive_error(archive, format!("{}: {err}", relative.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode)).ok();
            }
        }
    }

    Ok(())
}

pub struct SystemCommandRunner {
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(200))
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// How long to wait for output readers once the tool has exited.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StepError> {
        let program = spec.display_program();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| StepError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = child.stdout.take().map(|out| forward_lines(out, "stdout"));
        let stderr = child.stderr.take().map(|err| forward_lines(err, "stderr"));

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(StepError::Spawn {
                        program: program.clone(),
                        source,
                    });
                }
            }

            if started.elapsed() >= spec.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StepError::Timeout {
                    what: program,
                    after: spec.timeout,
                });
            }

            thread::sleep(self.poll_interval);
        };

        // A grandchild that inherited the pipes keeps them open past our child's exit.
        let deadline = Instant::now() + self.drain_timeout;
        if let Some(lines) = stdout {
            let _ = lines.recv_timeout(deadline.saturating_duration_since(Instant::now()));
        }
        let stderr_tail = stderr
            .and_then(|lines| {
                lines
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .ok()
            })
            .unwrap_or_default();

        debug!(program = %program, code = ?status.code(), "external tool exited");
        Ok(CommandOutput {
            code: status.code(),
            stderr_tail,
        })
    }
}

fn forward_lines<R: Read + Send + 'static>(stream: R, label: &'static str) -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            debug!(target: "efficientdet_prep::tool", stream = label, "{line}");

            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let _ = sender.send(Vec::from(tail).join("\n"));
    });
    receiver
}

pub struct NoProgressReporter;

impl NoProgressReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for NoProgressReporter {
    fn on_start(&self, _request: &ConversionRequest) {}

    fn on_step(&self, _step: PipelineStep, _detail: &str) {}

    fn on_download(&self, _url: &str, _downloaded: u64, _total: Option<u64>) {}

    fn on_warning(&self, _message: &str) {}

    fn on_finish(&self, _outcome: &PipelineOutcome) {}
}

pub struct IndicatifProgressReporter {
    bar: ProgressBar,
    downloading: Mutex<Option<String>>,
}

impl IndicatifProgressReporter {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(draw_target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(None, draw_target);
        bar.set_style(spinner_style());
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            bar,
            downloading: Mutex::new(None),
        }
    }
}

impl Default for IndicatifProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.yellow} {msg:.blue}")
        .expect("invalid progress style template")
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
}

fn download_style(total_known: bool) -> ProgressStyle {
    let template = if total_known {
        "{spinner:.yellow} {msg:.blue} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})"
    } else {
        "{spinner:.yellow} {msg:.blue} {bytes} ({binary_bytes_per_sec})"
    };
    ProgressStyle::with_template(template)
        .expect("invalid progress style template")
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
        .progress_chars("=> ")
}

impl ProgressReporter for IndicatifProgressReporter {
    fn on_start(&self, request: &ConversionRequest) {
        let _ = self.bar.println(describe_request(request));
    }

    fn on_step(&self, step: PipelineStep, detail: &str) {
        let mut downloading = match self.downloading.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };
        if downloading.take().is_some() {
            self.bar.set_style(spinner_style());
            self.bar.set_length(0);
            self.bar.set_position(0);
        }
        self.bar.set_message(format!("{step}: {detail}"));
    }

    fn on_download(&self, url: &str, downloaded: u64, total: Option<u64>) {
        let mut downloading = match self.downloading.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };

        if downloading.as_deref() != Some(url) {
            self.bar.set_style(download_style(total.is_some()));
            self.bar.set_length(total.unwrap_or(0));
            self.bar.set_message(file_name_of(url).to_string());
            *downloading = Some(url.to_string());
        }
        self.bar.set_position(downloaded);
    }

    fn on_warning(&self, message: &str) {
        let _ = self.bar.println(style(format!("warning: {message}")).yellow().to_string());
    }

    fn on_finish(&self, outcome: &PipelineOutcome) {
        self.bar.disable_steady_tick();
        self.bar
            .finish_with_message(format!("converted: {}", outcome.artifact_path.display()));
    }
}

struct LineProgressState<W: Write> {
    writer: W,
    last_download: Option<(String, u64)>,
}

pub struct LineProgressReporter<W: Write + Send> {
    state: Mutex<LineProgressState<W>>,
}

impl LineProgressReporter<std::io::Stderr> {
    pub fn new() -> Self {
        Self::with_writer(std::io::stderr())
    }
}

impl Default for LineProgressReporter<std::io::Stderr> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> LineProgressReporter<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            state: Mutex::new(LineProgressState {
                writer,
                last_download: None,
            }),
        }
    }

    pub fn into_inner(self) -> W {
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };
        state.writer
    }

    fn write_line(&self, line: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };
        let _ = writeln!(state.writer, "{line}");
        let _ = state.writer.flush();
    }
}

const UNKNOWN_SIZE_BUCKET: u64 = 50 * 1024 * 1024;

impl<W: Write + Send> ProgressReporter for LineProgressReporter<W> {
    fn on_start(&self, request: &ConversionRequest) {
        self.write_line(&describe_request(request));
    }

    fn on_step(&self, step: PipelineStep, detail: &str) {
        self.write_line(&format!("[{step}] {detail}"));
    }

    fn on_download(&self, url: &str, downloaded: u64, total: Option<u64>) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(err) => err.into_inner(),
        };

        // One line per 10% (or per 50 MiB when the size is unknown).
        let bucket = match total {
            Some(0) => 10,
            Some(total) => downloaded.saturating_mul(10) / total,
            None => downloaded / UNKNOWN_SIZE_BUCKET,
        };
        let fresh = match &state.last_download {
            Some((last_url, last_bucket)) => last_url != url || *last_bucket != bucket,
            None => true,
        };
        if !fresh {
            return;
        }

        let line = match total {
            Some(total) => format!(
                "download {}: {}% ({downloaded}/{total} bytes)",
                file_name_of(url),
                bucket * 10
            ),
            None => format!("download {}: {downloaded} bytes", file_name_of(url)),
        };
        let _ = writeln!(state.writer, "{line}");
        let _ = state.writer.flush();
        state.last_download = Some((url.to_string(), bucket));
    }

    fn on_warning(&self, message: &str) {
        self.write_line(&format!("warning: {message}"));
    }

    fn on_finish(&self, outcome: &PipelineOutcome) {
        self.write_line(&format!("converted: {}", outcome.artifact_path.display()));
    }
}

fn describe_request(request: &ConversionRequest) -> String {
    let mode = request
        .quant
        .map(|mode| mode.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "model: {} quant: {} max detections: {}",
        request.model.full_name(),
        mode,
        request.max_detections
    )
}

fn file_name_of(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
