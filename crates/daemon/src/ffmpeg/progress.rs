//! Streaming parser for ffmpeg `-progress` output
//!
//! With `-progress pipe:2` ffmpeg interleaves machine readable `key=value`
//! progress lines with its free text log on stderr. The segment muxer
//! announces every new chunk with a log line such as:
//!
//! ```text
//! [segment @ 0x55d0c8a4c740] Opening '/out/Part.3.movie.mkv' for writing
//! ```
//!
//! The parser keeps just enough state to turn those lines into
//! [`ProgressEvent`]s. New files are reported as soon as they are seen;
//! percent/speed reports are produced by [`ProgressParser::sample`], which the
//! caller drives from a timer.

use std::path::{Path, PathBuf};
use std::time::Duration;

const OUT_TIME_KEY: &str = "out_time_us=";
const SPEED_KEY: &str = "speed=";
const SEGMENT_PREFIX: &str = "[segment";
const SEGMENT_OPENING: &str = "Opening";

/// A structured notification of split progress
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The segment muxer opened a new output file
    NewFile {
        path: PathBuf,
        /// 1-based position of the file in the output list
        sequence_index: usize,
    },
    /// Periodic position report
    Progress {
        current_time: Duration,
        speed: Option<String>,
        /// Approximate completion of the current segment, 0..=100
        segment_percent: f64,
        /// Completion of the whole input, 0..=100, when its length is known
        total_percent: Option<f64>,
    },
}

/// Line-by-line ffmpeg progress parser
#[derive(Debug, Clone)]
pub struct ProgressParser {
    chunk_duration: Duration,
    total_duration: Option<Duration>,
    current_time: Duration,
    segment_start: Duration,
    segment_percent: f64,
    speed: Option<String>,
    output_files: Vec<PathBuf>,
    dirty: bool,
}

impl ProgressParser {
    /// Create a parser for segments of `chunk_duration`.
    ///
    /// A zero `total_duration` is treated as unknown.
    pub fn new(chunk_duration: Duration, total_duration: Option<Duration>) -> Self {
        Self {
            chunk_duration,
            total_duration: total_duration.filter(|d| !d.is_zero()),
            current_time: Duration::ZERO,
            segment_start: Duration::ZERO,
            segment_percent: 0.0,
            speed: None,
            output_files: Vec::new(),
            dirty: false,
        }
    }

    /// Feed one line of transcoder output.
    ///
    /// Returns a [`ProgressEvent::NewFile`] when the line announces a new
    /// segment. Everything else only updates internal state.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(value) = line.strip_prefix(OUT_TIME_KEY) {
            if let Some(time) = parse_out_time_us(value) {
                self.update_time(time);
            }
            None
        } else if let Some(value) = line.strip_prefix(SPEED_KEY) {
            let value = value.trim();
            self.speed = match value {
                "" | "N/A" => None,
                speed => Some(speed.to_string()),
            };
            self.dirty = true;
            None
        } else if line.starts_with(SEGMENT_PREFIX) && line.contains(SEGMENT_OPENING) {
            let path = parse_opened_path(line)?;
            Some(self.open_segment(path))
        } else {
            None
        }
    }

    /// Produce a position report if anything changed since the last sample.
    pub fn sample(&mut self) -> Option<ProgressEvent> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    /// Current position report, regardless of whether it changed.
    pub fn snapshot(&self) -> ProgressEvent {
        ProgressEvent::Progress {
            current_time: self.current_time,
            speed: self.speed.clone(),
            segment_percent: self.segment_percent,
            total_percent: self.total_percent(),
        }
    }

    pub fn current_time(&self) -> Duration {
        self.current_time
    }

    pub fn speed(&self) -> Option<&str> {
        self.speed.as_deref()
    }

    pub fn segment_percent(&self) -> f64 {
        self.segment_percent
    }

    pub fn total_percent(&self) -> Option<f64> {
        let total = self.total_duration?;
        let percent = self.current_time.as_secs_f64() / total.as_secs_f64() * 100.0;
        Some(percent.clamp(0.0, 100.0))
    }

    /// Files announced so far, in announcement order
    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    pub fn into_output_files(self) -> Vec<PathBuf> {
        self.output_files
    }

    fn update_time(&mut self, time: Duration) {
        self.current_time = time;
        self.dirty = true;

        if self.chunk_duration.is_zero() {
            return;
        }
        let into_segment = time.saturating_sub(self.segment_start);
        let percent = into_segment.as_secs_f64() / self.chunk_duration.as_secs_f64() * 100.0;
        // Never report a segment going backwards.
        self.segment_percent = percent.min(100.0).max(self.segment_percent);
    }

    fn open_segment(&mut self, path: PathBuf) -> ProgressEvent {
        self.output_files.push(path.clone());
        self.segment_start = self.current_time;
        self.segment_percent = 0.0;
        self.dirty = true;
        ProgressEvent::NewFile {
            path,
            sequence_index: self.output_files.len(),
        }
    }
}

/// Parse the value of an `out_time_us` line.
///
/// ffmpeg reports `N/A` or a large negative sentinel before the first packet
/// is muxed; negative values clamp to zero.
fn parse_out_time_us(value: &str) -> Option<Duration> {
    let micros: i64 = value.trim().parse().ok()?;
    Some(Duration::from_micros(micros.max(0) as u64))
}

/// Extract the quoted path from a segment muxer `Opening '...'` line.
fn parse_opened_path(line: &str) -> Option<PathBuf> {
    let start = line.find('\'')? + 1;
    let len = line[start..].find('\'')?;
    let path = &line[start..start + len];
    if path.is_empty() {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}
