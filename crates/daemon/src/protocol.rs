//! Wire protocol: command envelopes, validation and replies
//!
//! Every message is one JSON object per line. Requests look like
//!
//! ```text
//! {"protocolVersion":"1.0.0","command":"split","inputFile":"%shared%/in.mkv",
//!  "outputDir":"%shared%/out","chunkSize":300,"length":3600}
//! ```
//!
//! and are checked in a fixed order by [`Validator`]: envelope shape,
//! protocol version, command name, then the command's parameters as listed in
//! its [`ParamSpec`] table. The first failure becomes a [`ProtocolError`] with
//! a stable error number.

use crate::ffmpeg::{
    AudioCodec, ProgressEvent, SplitJobResult, SplitJobSpec, TranscoderInfo, VideoCodec,
};
use crate::paths::PathResolver;
use crate::state::DaemonState;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// The only protocol version this daemon speaks
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Commands understood by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Report,
    Status,
    Split,
    CopyInput,
    Encode,
    CopyOutput,
    Combine,
    Hash,
    Shutdown,
    Close,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Report,
        Command::Status,
        Command::Split,
        Command::CopyInput,
        Command::Encode,
        Command::CopyOutput,
        Command::Combine,
        Command::Hash,
        Command::Shutdown,
        Command::Close,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Report => "report",
            Command::Status => "status",
            Command::Split => "split",
            Command::CopyInput => "copy_input",
            Command::Encode => "encode",
            Command::CopyOutput => "copy_output",
            Command::Combine => "combine",
            Command::Hash => "hash",
            Command::Shutdown => "shutdown",
            Command::Close => "close",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Parameter schema of the command
    pub fn params(self) -> &'static [ParamSpec] {
        match self {
            Command::Split => SPLIT_PARAMS,
            _ => &[],
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    /// Seconds as a JSON number, or an `HH:MM:SS[.fff]` string
    Duration,
    /// Path to an existing regular file, placeholders expanded
    FilePath,
    /// Path to an existing directory, placeholders expanded
    DirPath,
}

impl ParamType {
    fn describe(self) -> &'static str {
        match self {
            ParamType::Integer => "an integer",
            ParamType::Duration => "a duration",
            ParamType::FilePath => "a file path",
            ParamType::DirPath => "a directory path",
        }
    }
}

/// One row of a command's parameter table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    /// Smallest accepted value for integer parameters
    pub min: Option<i64>,
}

impl ParamSpec {
    pub const fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: true,
            min: None,
        }
    }

    pub const fn optional(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: false,
            min: None,
        }
    }

    pub const fn at_least(mut self, min: i64) -> Self {
        self.min = Some(min);
        self
    }
}

const SPLIT_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("inputFile", ParamType::FilePath),
    ParamSpec::required("outputDir", ParamType::DirPath),
    ParamSpec::required("chunkSize", ParamType::Integer).at_least(1),
    ParamSpec::optional("length", ParamType::Duration),
];

/// A rejected request
///
/// Everything except [`ProtocolError::Busy`] ends the connection after the
/// error reply has been sent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Command is not a JSON object")]
    NotAnObject,

    #[error("Missing protocolVersion")]
    MissingVersion,

    #[error("protocolVersion must be a string")]
    VersionNotString,

    #[error("Unsupported protocol version {}, expected {}", .0, PROTOCOL_VERSION)]
    UnsupportedVersion(String),

    #[error("Missing command")]
    MissingCommand,

    #[error("command must be a string")]
    CommandNotString,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing parameter {0}")]
    MissingParam(&'static str),

    #[error("Parameter {name} must be {}", .expected.describe())]
    WrongParamType {
        name: &'static str,
        expected: ParamType,
    },

    #[error("Parameter {name} is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },

    #[error("Path given for {name} does not exist: {}", .path.display())]
    PathMissing { name: &'static str, path: PathBuf },

    #[error("Path given for {name} is not {}: {}", .expected.describe(), .path.display())]
    WrongPathType {
        name: &'static str,
        path: PathBuf,
        expected: ParamType,
    },

    #[error("Daemon is busy with another split job")]
    Busy,
}

impl ProtocolError {
    /// Stable machine-readable error number
    pub fn number(&self) -> u32 {
        match self {
            ProtocolError::NotAnObject => 1,
            ProtocolError::MissingVersion => 2,
            ProtocolError::VersionNotString => 3,
            ProtocolError::UnsupportedVersion(_) => 4,
            ProtocolError::MissingCommand => 5,
            ProtocolError::CommandNotString => 6,
            ProtocolError::UnknownCommand(_) => 7,
            ProtocolError::InvalidJson(_) => 8,
            ProtocolError::MissingParam(_) => 20,
            ProtocolError::WrongParamType { .. } => 21,
            ProtocolError::OutOfRange { .. } => 22,
            ProtocolError::PathMissing { .. } => 30,
            ProtocolError::WrongPathType { .. } => 31,
            ProtocolError::Busy => 41,
        }
    }

    /// Whether the connection is closed after reporting this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Busy)
    }
}

/// A validated parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Integer(i64),
    Duration(Duration),
    Path(PathBuf),
}

/// Validated parameters of one request, keyed by wire name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: HashMap<&'static str, ParamValue>,
}

impl Params {
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        match self.values.get(name)? {
            ParamValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        match self.values.get(name)? {
            ParamValue::Path(p) => Some(p),
            _ => None,
        }
    }
}

/// Parameters of a `split` request
#[derive(Debug, Clone, PartialEq)]
pub struct SplitRequest {
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub chunk_size: Duration,
    /// Input length; zero means unknown
    pub length: Option<Duration>,
}

impl SplitRequest {
    fn from_params(params: &Params) -> Result<Self, ProtocolError> {
        let input_file = params
            .path("inputFile")
            .ok_or(ProtocolError::MissingParam("inputFile"))?
            .to_path_buf();
        let output_dir = params
            .path("outputDir")
            .ok_or(ProtocolError::MissingParam("outputDir"))?
            .to_path_buf();
        let chunk_size = params
            .integer("chunkSize")
            .ok_or(ProtocolError::MissingParam("chunkSize"))?;
        Ok(Self {
            input_file,
            output_dir,
            chunk_size: Duration::from_secs(chunk_size.unsigned_abs()),
            length: params.duration("length").filter(|d| !d.is_zero()),
        })
    }

    pub fn into_job_spec(self) -> SplitJobSpec {
        SplitJobSpec::new(self.input_file, self.output_dir, self.chunk_size, self.length)
    }
}

/// A validated request ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Report,
    Status,
    Split(SplitRequest),
    Close,
    Shutdown,
    /// Recognized command without a handler yet
    Reserved(Command),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Report => Command::Report,
            Request::Status => Command::Status,
            Request::Split(_) => Command::Split,
            Request::Close => Command::Close,
            Request::Shutdown => Command::Shutdown,
            Request::Reserved(command) => *command,
        }
    }
}

/// Turns raw envelopes into [`Request`]s
#[derive(Debug, Clone)]
pub struct Validator {
    resolver: PathResolver,
}

impl Validator {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Validate one line received from the connection.
    pub fn validate_line(&self, line: &str) -> Result<Request, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        self.validate(&value)
    }

    pub fn validate(&self, envelope: &Value) -> Result<Request, ProtocolError> {
        let envelope = envelope.as_object().ok_or(ProtocolError::NotAnObject)?;

        match envelope.get("protocolVersion") {
            None => return Err(ProtocolError::MissingVersion),
            Some(Value::String(version)) if version == PROTOCOL_VERSION => {}
            Some(Value::String(version)) => {
                return Err(ProtocolError::UnsupportedVersion(version.clone()))
            }
            Some(_) => return Err(ProtocolError::VersionNotString),
        }

        let command = match envelope.get("command") {
            None => return Err(ProtocolError::MissingCommand),
            Some(Value::String(name)) => Command::from_wire(name)
                .ok_or_else(|| ProtocolError::UnknownCommand(name.clone()))?,
            Some(_) => return Err(ProtocolError::CommandNotString),
        };

        let params = self.validate_params(command, envelope)?;

        Ok(match command {
            Command::Report => Request::Report,
            Command::Status => Request::Status,
            Command::Split => Request::Split(SplitRequest::from_params(&params)?),
            Command::Close => Request::Close,
            Command::Shutdown => Request::Shutdown,
            other => Request::Reserved(other),
        })
    }

    fn validate_params(
        &self,
        command: Command,
        envelope: &Map<String, Value>,
    ) -> Result<Params, ProtocolError> {
        let mut params = Params::default();
        for spec in command.params() {
            match envelope.get(spec.name) {
                None if spec.required => return Err(ProtocolError::MissingParam(spec.name)),
                None => {}
                Some(value) => {
                    let value = self.validate_param(spec, value)?;
                    params.values.insert(spec.name, value);
                }
            }
        }
        Ok(params)
    }

    fn validate_param(&self, spec: &ParamSpec, value: &Value) -> Result<ParamValue, ProtocolError> {
        let wrong_type = || ProtocolError::WrongParamType {
            name: spec.name,
            expected: spec.ty,
        };

        match spec.ty {
            ParamType::Integer => {
                let n = value.as_i64().ok_or_else(wrong_type)?;
                if let Some(min) = spec.min {
                    if n < min {
                        return Err(ProtocolError::OutOfRange {
                            name: spec.name,
                            reason: format!("{} is less than {}", n, min),
                        });
                    }
                }
                Ok(ParamValue::Integer(n))
            }
            ParamType::Duration => parse_duration_value(value)
                .map(ParamValue::Duration)
                .ok_or_else(wrong_type),
            ParamType::FilePath | ParamType::DirPath => {
                let raw = value.as_str().ok_or_else(wrong_type)?;
                let path = self
                    .resolver
                    .expand(raw)
                    .map_err(|e| ProtocolError::OutOfRange {
                        name: spec.name,
                        reason: e.to_string(),
                    })?;
                check_path(spec, &path)?;
                Ok(ParamValue::Path(path))
            }
        }
    }
}

fn check_path(spec: &ParamSpec, path: &Path) -> Result<(), ProtocolError> {
    if !path.exists() {
        return Err(ProtocolError::PathMissing {
            name: spec.name,
            path: path.to_path_buf(),
        });
    }
    let matches = match spec.ty {
        ParamType::FilePath => path.is_file(),
        ParamType::DirPath => path.is_dir(),
        _ => true,
    };
    if !matches {
        return Err(ProtocolError::WrongPathType {
            name: spec.name,
            path: path.to_path_buf(),
            expected: spec.ty,
        });
    }
    Ok(())
}

/// Parse a duration parameter.
///
/// Numbers are seconds; negative numbers clamp to zero. Strings must be
/// `HH:MM:SS` with optional fractional seconds.
pub fn parse_duration_value(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            Duration::try_from_secs_f64(secs.max(0.0)).ok()
        }
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// Parse `HH:MM:SS[.fff]`
pub fn parse_timestamp(s: &str) -> Option<Duration> {
    let mut parts = s.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds_str = parts.next()?;
    if parts.next().is_some() || minutes >= 60 {
        return None;
    }
    if seconds_str.is_empty() || !seconds_str.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let seconds: f64 = seconds_str.parse().ok()?;
    if seconds >= 60.0 {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

/// Reply status strings for split events
pub const STATUS_NEW_FILE: &str = "splitting new file";
pub const STATUS_SPLIT_REPORT: &str = "splitting report";
pub const STATUS_SPLIT_FINISHED: &str = "split finished";
pub const STATUS_ERROR: &str = "error";

/// One outgoing message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    protocol_version: &'static str,
    #[serde(flatten)]
    body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Status(StatusReply),
    Report(ReportReply),
    NewFile(NewFileReply),
    Progress(ProgressReply),
    Finished(FinishedReply),
    Error(ErrorReply),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReply {
    pub status: DaemonState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportReply {
    pub status: DaemonState,
    pub daemon_version: String,
    pub transcoder_version: Option<String>,
    pub num_chunks: u32,
    pub is_file_host: bool,
    pub audio_encoders: Vec<AudioCodec>,
    pub video_encoders: Vec<VideoCodec>,
}

impl ReportReply {
    pub fn new(
        status: DaemonState,
        daemon_version: impl Into<String>,
        transcoder: &TranscoderInfo,
        num_chunks: u32,
        is_file_host: bool,
    ) -> Self {
        Self {
            status,
            daemon_version: daemon_version.into(),
            transcoder_version: transcoder.version.clone(),
            num_chunks,
            is_file_host,
            audio_encoders: transcoder.audio_codecs.clone(),
            video_encoders: transcoder.video_codecs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFileReply {
    pub status: &'static str,
    pub file_path: String,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReply {
    pub status: &'static str,
    /// Seconds into the input
    pub current_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    pub segment_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedReply {
    pub status: &'static str,
    pub success: bool,
    pub output_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub status: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub number: u32,
    pub message: String,
}

impl Reply {
    fn new(body: ReplyBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            body,
        }
    }

    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    pub fn status(state: DaemonState) -> Self {
        Self::new(ReplyBody::Status(StatusReply { status: state }))
    }

    pub fn report(report: ReportReply) -> Self {
        Self::new(ReplyBody::Report(report))
    }

    pub fn error(error: &ProtocolError) -> Self {
        Self::new(ReplyBody::Error(ErrorReply {
            status: STATUS_ERROR,
            error: ErrorDetail {
                number: error.number(),
                message: error.to_string(),
            },
        }))
    }

    pub fn progress(event: ProgressEvent) -> Self {
        let body = match event {
            ProgressEvent::NewFile {
                path,
                sequence_index,
            } => ReplyBody::NewFile(NewFileReply {
                status: STATUS_NEW_FILE,
                file_path: path.to_string_lossy().into_owned(),
                file_count: sequence_index,
            }),
            ProgressEvent::Progress {
                current_time,
                speed,
                segment_percent,
                total_percent,
            } => ReplyBody::Progress(ProgressReply {
                status: STATUS_SPLIT_REPORT,
                current_time: current_time.as_secs_f64(),
                speed,
                segment_percent,
                total_percent,
            }),
        };
        Self::new(body)
    }

    pub fn split_finished(result: &SplitJobResult) -> Self {
        Self::new(ReplyBody::Finished(FinishedReply {
            status: STATUS_SPLIT_FINISHED,
            success: result.success,
            output_files: result
                .output_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            error: result.error.clone(),
        }))
    }

    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        validator: Validator,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("in.mkv"), b"media").unwrap();
        fs::create_dir(root.join("out")).unwrap();
        Fixture {
            validator: Validator::new(PathResolver::new(&root, &root)),
            root,
            _dir: dir,
        }
    }

    fn split_envelope() -> Value {
        json!({
            "protocolVersion": "1.0.0",
            "command": "split",
            "inputFile": "%shared%/in.mkv",
            "outputDir": "%shared%/out",
            "chunkSize": 300,
            "length": 3600
        })
    }

    fn error_number(validator: &Validator, envelope: Value) -> u32 {
        validator.validate(&envelope).unwrap_err().number()
    }

    #[test]
    fn test_envelope_errors_have_distinct_numbers() {
        let f = fixture();
        let v = &f.validator;

        assert_eq!(error_number(v, json!([1, 2, 3])), 1);
        assert_eq!(error_number(v, json!("status")), 1);
        assert_eq!(error_number(v, json!({"command": "status"})), 2);
        assert_eq!(
            error_number(v, json!({"protocolVersion": 1, "command": "status"})),
            3
        );
        assert_eq!(
            error_number(v, json!({"protocolVersion": "0.9.0", "command": "status"})),
            4
        );
        assert_eq!(error_number(v, json!({"protocolVersion": "1.0.0"})), 5);
        assert_eq!(
            error_number(v, json!({"protocolVersion": "1.0.0", "command": 7})),
            6
        );
        assert_eq!(
            error_number(v, json!({"protocolVersion": "1.0.0", "command": "dance"})),
            7
        );
        assert_eq!(v.validate_line("{not json").unwrap_err().number(), 8);
    }

    #[test]
    fn test_version_checked_before_command() {
        let f = fixture();
        let err = f
            .validator
            .validate(&json!({"protocolVersion": "2.0.0", "command": "dance"}))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion("2.0.0".to_string()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_simple_commands() {
        let f = fixture();
        let request = |cmd: &str| {
            f.validator
                .validate(&json!({"protocolVersion": "1.0.0", "command": cmd}))
                .unwrap()
        };
        assert_eq!(request("report"), Request::Report);
        assert_eq!(request("status"), Request::Status);
        assert_eq!(request("close"), Request::Close);
        assert_eq!(request("shutdown"), Request::Shutdown);
        assert_eq!(request("combine"), Request::Reserved(Command::Combine));
        assert_eq!(request("hash").command(), Command::Hash);
    }

    #[test]
    fn test_split_request_expands_placeholders() {
        let f = fixture();
        let request = f.validator.validate(&split_envelope()).unwrap();
        assert_eq!(
            request,
            Request::Split(SplitRequest {
                input_file: f.root.join("in.mkv"),
                output_dir: f.root.join("out"),
                chunk_size: Duration::from_secs(300),
                length: Some(Duration::from_secs(3600)),
            })
        );
    }

    #[test]
    fn test_split_length_is_optional() {
        let f = fixture();
        let mut envelope = split_envelope();
        envelope.as_object_mut().unwrap().remove("length");
        match f.validator.validate(&envelope).unwrap() {
            Request::Split(split) => assert_eq!(split.length, None),
            other => panic!("expected split, got {:?}", other),
        }

        envelope["length"] = json!(0);
        match f.validator.validate(&envelope).unwrap() {
            Request::Split(split) => assert_eq!(split.length, None),
            other => panic!("expected split, got {:?}", other),
        }
    }

    #[test]
    fn test_split_parameter_errors() {
        let f = fixture();
        let with = |key: &str, value: Value| {
            let mut envelope = split_envelope();
            envelope[key] = value;
            f.validator.validate(&envelope).unwrap_err()
        };
        let without = |key: &str| {
            let mut envelope = split_envelope();
            envelope.as_object_mut().unwrap().remove(key);
            f.validator.validate(&envelope).unwrap_err()
        };

        assert_eq!(without("inputFile"), ProtocolError::MissingParam("inputFile"));
        assert_eq!(without("chunkSize").number(), 20);
        assert_eq!(with("chunkSize", json!("300")).number(), 21);
        assert_eq!(with("chunkSize", json!(2.5)).number(), 21);
        assert_eq!(with("chunkSize", json!(0)).number(), 22);
        assert_eq!(with("chunkSize", json!(-5)).number(), 22);
        assert_eq!(with("length", json!(true)).number(), 21);
        assert_eq!(with("length", json!("an hour")).number(), 21);
        assert_eq!(with("inputFile", json!(42)).number(), 21);
        assert_eq!(with("inputFile", json!("%shared%/missing.mkv")).number(), 30);
        assert_eq!(with("inputFile", json!("%shared%/out")).number(), 31);
        assert_eq!(with("outputDir", json!("%local%/in.mkv")).number(), 31);
        assert_eq!(with("outputDir", json!("%shared%/../out")).number(), 22);
    }

    #[test]
    fn test_first_failing_parameter_wins() {
        let f = fixture();
        let envelope = json!({
            "protocolVersion": "1.0.0",
            "command": "split",
            "inputFile": "%shared%/missing.mkv",
            "chunkSize": "bad"
        });
        assert_eq!(f.validator.validate(&envelope).unwrap_err().number(), 30);
    }

    #[test]
    fn test_duration_values() {
        assert_eq!(parse_duration_value(&json!(90)), Some(Duration::from_secs(90)));
        assert_eq!(
            parse_duration_value(&json!(1.5)),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_duration_value(&json!(-10)), Some(Duration::ZERO));
        assert_eq!(
            parse_duration_value(&json!("01:00:00")),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            parse_duration_value(&json!("00:02:03.250")),
            Some(Duration::from_millis(123_250))
        );
        assert_eq!(parse_duration_value(&json!("00:61:00")), None);
        assert_eq!(parse_duration_value(&json!("00:00:-1")), None);
        assert_eq!(parse_duration_value(&json!("1:2")), None);
        assert_eq!(parse_duration_value(&json!(null)), None);
    }

    #[test]
    fn test_huge_timestamps_are_rejected() {
        assert_eq!(parse_timestamp("9999999999999999:00:00"), None);
        assert_eq!(parse_timestamp("18446744073709551615:59:59"), None);
        assert_eq!(
            parse_timestamp("5124095576030431:00:15"),
            Some(Duration::from_secs(5_124_095_576_030_431 * 3600 + 15))
        );

        let f = fixture();
        let mut envelope = split_envelope();
        envelope["length"] = json!("9999999999999999:00:00");
        assert_eq!(error_number(&f.validator, envelope), 21);
    }

    #[test]
    fn test_busy_is_not_fatal() {
        assert_eq!(ProtocolError::Busy.number(), 41);
        assert!(!ProtocolError::Busy.is_fatal());
        assert!(ProtocolError::MissingParam("chunkSize").is_fatal());
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = Reply::error(&ProtocolError::MissingCommand);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "protocolVersion": "1.0.0",
                "status": "error",
                "error": {"number": 5, "message": "Missing command"}
            })
        );
    }

    #[test]
    fn test_status_and_report_reply_shape() {
        let status = serde_json::to_value(Reply::status(DaemonState::Idle)).unwrap();
        assert_eq!(status, json!({"protocolVersion": "1.0.0", "status": "idle"}));

        let info = TranscoderInfo {
            version: Some("6.1.1".to_string()),
            audio_codecs: vec![AudioCodec::Copy, AudioCodec::Aac],
            video_codecs: vec![VideoCodec::Copy, VideoCodec::X264],
        };
        let report = Reply::report(ReportReply::new(
            DaemonState::Reporting,
            "1.0.0",
            &info,
            4,
            true,
        ));
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "protocolVersion": "1.0.0",
                "status": "reporting",
                "daemonVersion": "1.0.0",
                "transcoderVersion": "6.1.1",
                "numChunks": 4,
                "isFileHost": true,
                "audioEncoders": ["copy", "aac"],
                "videoEncoders": ["copy", "libx264"]
            })
        );
    }

    #[test]
    fn test_split_reply_shapes() {
        let new_file = Reply::progress(ProgressEvent::NewFile {
            path: PathBuf::from("/out/Part.1.in.mkv"),
            sequence_index: 1,
        });
        assert_eq!(
            serde_json::to_value(new_file).unwrap(),
            json!({
                "protocolVersion": "1.0.0",
                "status": "splitting new file",
                "filePath": "/out/Part.1.in.mkv",
                "fileCount": 1
            })
        );

        let progress = Reply::progress(ProgressEvent::Progress {
            current_time: Duration::from_secs(30),
            speed: None,
            segment_percent: 10.0,
            total_percent: None,
        });
        assert_eq!(
            serde_json::to_value(progress).unwrap(),
            json!({
                "protocolVersion": "1.0.0",
                "status": "splitting report",
                "currentTime": 30.0,
                "segmentPercent": 10.0
            })
        );

        let finished = Reply::split_finished(&SplitJobResult::failed("boom"));
        let line = finished.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap(),
            json!({
                "protocolVersion": "1.0.0",
                "status": "split finished",
                "success": false,
                "outputFiles": [],
                "error": "boom"
            })
        );
    }

    // Property: known commands with the supported version always validate,
    // anything else in the command field is rejected with number 7.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_known_commands_accepted(index in 0usize..Command::ALL.len()) {
            let command = Command::ALL[index];
            prop_assume!(command != Command::Split);
            let f = fixture();
            let request = f.validator
                .validate(&json!({"protocolVersion": "1.0.0", "command": command.as_str()}))
                .unwrap();
            prop_assert_eq!(request.command(), command);
        }

        #[test]
        fn prop_unknown_commands_rejected(name in "[a-z_]{1,16}") {
            prop_assume!(Command::from_wire(&name).is_none());
            let f = fixture();
            let err = f.validator
                .validate(&json!({"protocolVersion": "1.0.0", "command": name}))
                .unwrap_err();
            prop_assert_eq!(err.number(), 7);
        }

        #[test]
        fn prop_other_versions_rejected(version in "[0-9]\\.[0-9]\\.[0-9]") {
            prop_assume!(version != PROTOCOL_VERSION);
            let f = fixture();
            let err = f.validator
                .validate(&json!({"protocolVersion": version, "command": "status"}))
                .unwrap_err();
            prop_assert_eq!(err.number(), 4);
        }
    }
}
