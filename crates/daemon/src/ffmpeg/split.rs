//! Split job runner
//!
//! Runs one ffmpeg segment-muxer invocation that cuts an input file into
//! fixed-duration chunks named `Part.<index>.<input file name>`, streaming
//! progress events to a channel while the child runs.

use super::progress::{ProgressEvent, ProgressParser};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Command, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default minimum interval between progress reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Errors that prevent a split job from starting
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Input file does not exist: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("Input path is not a file: {}", .0.display())]
    InputNotFile(PathBuf),

    #[error("Output directory does not exist: {}", .0.display())]
    OutputDirMissing(PathBuf),

    #[error("Output path is not a directory: {}", .0.display())]
    OutputNotDir(PathBuf),

    #[error("Chunk duration must be greater than zero")]
    ZeroChunkDuration,

    #[error("Input path has no file name: {}", .0.display())]
    NoFileName(PathBuf),

    #[error("Failed to start transcoder {}: {}", .path.display(), .source)]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything needed to run one split
#[derive(Debug, Clone, PartialEq)]
pub struct SplitJobSpec {
    /// Media file to split
    pub input_path: PathBuf,
    /// Directory receiving the part files
    pub output_dir: PathBuf,
    /// Length of each part
    pub chunk_duration: Duration,
    /// Length of the input, enables total percent reporting
    pub total_duration: Option<Duration>,
}

impl SplitJobSpec {
    pub fn new(
        input_path: PathBuf,
        output_dir: PathBuf,
        chunk_duration: Duration,
        total_duration: Option<Duration>,
    ) -> Self {
        Self {
            input_path,
            output_dir,
            chunk_duration,
            total_duration,
        }
    }

    /// Check paths and chunk duration before starting a job
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.chunk_duration.is_zero() {
            return Err(SplitError::ZeroChunkDuration);
        }
        if !self.input_path.exists() {
            return Err(SplitError::InputMissing(self.input_path.clone()));
        }
        if !self.input_path.is_file() {
            return Err(SplitError::InputNotFile(self.input_path.clone()));
        }
        if !self.output_dir.exists() {
            return Err(SplitError::OutputDirMissing(self.output_dir.clone()));
        }
        if !self.output_dir.is_dir() {
            return Err(SplitError::OutputNotDir(self.output_dir.clone()));
        }
        Ok(())
    }

    /// Segment muxer output pattern, e.g. `/out/Part.%d.movie.mkv`
    pub fn output_pattern(&self) -> Result<PathBuf, SplitError> {
        let file_name = self
            .input_path
            .file_name()
            .ok_or_else(|| SplitError::NoFileName(self.input_path.clone()))?;
        let mut name = std::ffi::OsString::from("Part.%d.");
        name.push(file_name);
        Ok(self.output_dir.join(name))
    }
}

/// Runtime knobs for a split job
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOptions {
    /// Minimum interval between progress events
    pub report_interval: Duration,
    /// Kill the transcoder and fail the job after this long
    pub timeout: Option<Duration>,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            report_interval: DEFAULT_REPORT_INTERVAL,
            timeout: None,
        }
    }
}

/// Outcome of a split job, produced exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct SplitJobResult {
    /// Part files announced by the transcoder, in creation order
    pub output_files: Vec<PathBuf>,
    pub success: bool,
    pub error: Option<String>,
}

impl SplitJobResult {
    /// A failed result with no output
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output_files: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Build the ffmpeg segment command for a split
///
/// ```text
/// ffmpeg -y -hide_banner -progress pipe:2 -nostdin -i <input> -c copy -map 0
///        -segment_time <secs> -f segment <output_dir>/Part.%d.<input name>
/// ```
///
/// Progress and segment notices share stderr so they are read in the order
/// ffmpeg wrote them.
pub fn build_split_command(transcoder: &Path, spec: &SplitJobSpec) -> Result<Command, SplitError> {
    let pattern = spec.output_pattern()?;
    let mut cmd = Command::new(transcoder);

    cmd.arg("-y").arg("-hide_banner");
    cmd.arg("-progress").arg("pipe:2");
    cmd.arg("-nostdin");
    cmd.arg("-i").arg(&spec.input_path);
    cmd.arg("-c").arg("copy");
    cmd.arg("-map").arg("0");
    cmd.arg("-segment_time").arg(format_seconds(spec.chunk_duration));
    cmd.arg("-f").arg("segment");
    cmd.arg(pattern);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    Ok(cmd)
}

/// Whole seconds print without a fraction, as ffmpeg's own examples do
fn format_seconds(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

/// A running split job
///
/// Awaiting the job yields its [`SplitJobResult`]. Dropping the handle does
/// not stop the job; use [`SplitJob::cancel`] for that.
#[derive(Debug)]
pub struct SplitJob {
    handle: JoinHandle<SplitJobResult>,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl SplitJob {
    /// Spawn the transcoder and start monitoring it on a worker task.
    ///
    /// Fails without spawning anything if the transcoder cannot be started.
    /// Every parsed [`ProgressEvent`] is sent to `sink`; a closed sink is not
    /// an error, the job keeps running.
    pub fn start(
        transcoder: &Path,
        spec: SplitJobSpec,
        options: SplitOptions,
        sink: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<Self, SplitError> {
        Self::start_with_cancel(transcoder, spec, options, sink, CancellationToken::new())
    }

    /// Like [`SplitJob::start`], but cancelled through `cancel`, typically a
    /// child of a daemon-wide shutdown token.
    pub fn start_with_cancel(
        transcoder: &Path,
        spec: SplitJobSpec,
        options: SplitOptions,
        sink: mpsc::UnboundedSender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, SplitError> {
        let command = build_split_command(transcoder, &spec)?;
        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SplitError::Spawn {
            path: transcoder.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        info!(
            input = %spec.input_path.display(),
            output_dir = %spec.output_dir.display(),
            chunk_secs = spec.chunk_duration.as_secs_f64(),
            pid = ?pid,
            "split started"
        );

        let stderr = child.stderr.take().ok_or_else(|| SplitError::Spawn {
            path: transcoder.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "transcoder stderr unavailable"),
        })?;

        let parser = ProgressParser::new(spec.chunk_duration, spec.total_duration);
        let monitor = Monitor {
            child,
            parser,
            sink,
            options,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(monitor.run(BufReader::new(stderr)));

        Ok(Self {
            handle,
            cancel,
            pid,
        })
    }

    /// Ask the job to kill its transcoder; the result reports failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Process id of the transcoder
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Future for SplitJob {
    type Output = SplitJobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => SplitJobResult::failed(format!("split worker failed: {}", e)),
        })
    }
}

/// Worker-side state of a split job
struct Monitor {
    child: Child,
    parser: ProgressParser,
    sink: mpsc::UnboundedSender<ProgressEvent>,
    options: SplitOptions,
    cancel: CancellationToken,
}

impl Monitor {
    async fn run<R>(mut self, mut output: R) -> SplitJobResult
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut open = true;

        let mut ticker = tokio::time::interval(self.options.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let cancel = self.cancel.clone();
        let mut aborted: Option<String> = None;

        // The pipe is drained until EOF so the child never blocks on a full pipe.
        while open {
            tokio::select! {
                line = read_line_lossy(&mut output, &mut buf) => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => open = false,
                    Err(e) => {
                        warn!(error = %e, "failed reading transcoder output");
                        open = false;
                    }
                },
                _ = ticker.tick() => self.report(),
                _ = cancel.cancelled() => {
                    aborted = Some("split cancelled".to_string());
                    break;
                }
                _ = &mut timeout => {
                    aborted = Some(format!(
                        "split timed out after {}s",
                        self.options.timeout.unwrap_or_default().as_secs()
                    ));
                    break;
                }
            }
        }

        if aborted.is_some() {
            if let Err(e) = self.child.kill().await {
                warn!(error = %e, "failed to kill transcoder");
            }
        }

        let status = self.child.wait().await;
        self.report();

        let output_files = self.parser.into_output_files();
        let (success, error) = match (aborted, status) {
            (Some(reason), _) => (false, Some(reason)),
            (None, Ok(status)) if status.success() => (true, None),
            (None, Ok(status)) => (false, Some(format!("transcoder exited with {}", status))),
            (None, Err(e)) => (false, Some(format!("failed waiting for transcoder: {}", e))),
        };

        if success {
            info!(files = output_files.len(), "split finished");
        } else {
            warn!(files = output_files.len(), error = ?error, "split failed");
        }

        SplitJobResult {
            output_files,
            success,
            error,
        }
    }

    fn handle_line(&mut self, line: &str) {
        // Stats lines are separated by carriage returns rather than newlines.
        for piece in line.split('\r') {
            if let Some(event) = self.parser.feed_line(piece) {
                debug!(?event, "segment opened");
                let _ = self.sink.send(event);
            }
        }
    }

    fn report(&mut self) {
        if let Some(event) = self.parser.sample() {
            let _ = self.sink.send(event);
        }
    }
}

/// Read one `\n` terminated line, replacing invalid UTF-8.
///
/// Partial reads stay in `buf`, which makes this safe to use in `select!`.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    Ok(Some(line))
}
