//! Startup checks for the cluster encode daemon
//!
//! Run once before the listener is bound:
//! - both working directories exist and are directories
//! - the ffmpeg binary can be resolved (explicit path or `PATH` lookup)
//! - `ffmpeg -version` runs and reports a parsable version

use crate::config::Config;
use crate::ffmpeg::{TranscoderInfo, TranscoderInspector};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Binary looked up on `PATH` when no transcoder path is configured
pub const DEFAULT_TRANSCODER: &str = "ffmpeg";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{name} working directory does not exist: {}", .path.display())]
    WorkingDirMissing { name: &'static str, path: PathBuf },

    #[error("{name} working directory is not a directory: {}", .path.display())]
    WorkingDirNotDir { name: &'static str, path: PathBuf },

    #[error("Transcoder not found: {0}")]
    TranscoderNotFound(String),

    #[error("Transcoder version check failed for {}", .0.display())]
    TranscoderVersion(PathBuf),
}

/// What the checks learned about the environment
#[derive(Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub transcoder: PathBuf,
    pub transcoder_info: TranscoderInfo,
}

/// Check that a configured working directory is usable
pub fn check_working_dir(name: &'static str, path: &Path) -> Result<(), StartupError> {
    if !path.exists() {
        return Err(StartupError::WorkingDirMissing {
            name,
            path: path.to_path_buf(),
        });
    }
    if !path.is_dir() {
        return Err(StartupError::WorkingDirNotDir {
            name,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Resolve the transcoder binary.
///
/// A configured value containing a path separator is used as is; a bare name
/// (or the default `ffmpeg`) is searched on `PATH`.
pub fn resolve_transcoder(configured: Option<&Path>) -> Result<PathBuf, StartupError> {
    let candidate = configured.unwrap_or_else(|| Path::new(DEFAULT_TRANSCODER));

    if candidate.components().count() > 1 || candidate.is_absolute() {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(StartupError::TranscoderNotFound(format!(
            "{} is not a file",
            candidate.display()
        )));
    }

    which::which(candidate)
        .map_err(|e| StartupError::TranscoderNotFound(format!("{}: {}", candidate.display(), e)))
}

/// Query the transcoder's version, failing if it cannot be determined
pub fn check_transcoder_version(transcoder: &Path) -> Result<String, StartupError> {
    TranscoderInspector::new(transcoder)
        .version()
        .ok_or_else(|| StartupError::TranscoderVersion(transcoder.to_path_buf()))
}

/// Run all startup checks in order
///
/// 1. Shared working directory
/// 2. Local working directory
/// 3. Transcoder resolution
/// 4. Transcoder version, then the encoder listing
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    check_working_dir("Shared", &cfg.dirs.shared_working_dir)?;
    check_working_dir("Local", &cfg.dirs.local_working_dir)?;

    let transcoder = resolve_transcoder(cfg.transcoder.path.as_deref())?;
    let version = check_transcoder_version(&transcoder)?;
    info!(path = %transcoder.display(), version = %version, "transcoder found");

    let transcoder_info = TranscoderInspector::new(&transcoder).info();
    Ok(StartupReport {
        transcoder,
        transcoder_info,
    })
}
