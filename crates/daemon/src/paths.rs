//! Working directory placeholder expansion
//!
//! Clients refer to files relative to the cluster's shared directory or the
//! daemon's local directory with `%shared%/...` and `%local%/...`, since each
//! daemon may mount those directories at a different location.

use crate::config::DirsConfig;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const SHARED_PLACEHOLDER: &str = "%shared%";
pub const LOCAL_PLACEHOLDER: &str = "%local%";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("{0} leaves its working directory")]
    EscapesRoot(String),
}

/// Expands path placeholders against the configured roots
#[derive(Debug, Clone, PartialEq)]
pub struct PathResolver {
    shared_root: PathBuf,
    local_root: PathBuf,
}

impl PathResolver {
    pub fn new(shared_root: impl Into<PathBuf>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            shared_root: shared_root.into(),
            local_root: local_root.into(),
        }
    }

    pub fn from_config(dirs: &DirsConfig) -> Self {
        Self::new(&dirs.shared_working_dir, &dirs.local_working_dir)
    }

    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Replace a leading `%shared%` or `%local%` with its root.
    ///
    /// Paths without a placeholder are returned unchanged. A placeholder path
    /// may not climb out of its root with `..`.
    pub fn expand(&self, raw: &str) -> Result<PathBuf, PathError> {
        let (root, rest) = if let Some(rest) = strip_placeholder(raw, SHARED_PLACEHOLDER) {
            (&self.shared_root, rest)
        } else if let Some(rest) = strip_placeholder(raw, LOCAL_PLACEHOLDER) {
            (&self.local_root, rest)
        } else {
            return Ok(PathBuf::from(raw));
        };

        if Path::new(rest)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(PathError::EscapesRoot(raw.to_string()));
        }
        Ok(join_relative(root, rest))
    }
}

/// Strip `placeholder` when it is the whole first path component.
fn strip_placeholder<'a>(raw: &'a str, placeholder: &str) -> Option<&'a str> {
    let rest = raw.strip_prefix(placeholder)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn join_relative(root: &Path, rest: &str) -> PathBuf {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rest)
    }
}
