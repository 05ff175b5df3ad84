//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum length of the connection shared secret
pub const MIN_SECRET_LEN: usize = 8;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
    /// A value failed validation
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to access config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Working directory roots used for `%shared%` / `%local%` path expansion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirsConfig {
    /// Directory shared between all daemons (usually an NFS mount)
    #[serde(default = "default_shared_working_dir")]
    pub shared_working_dir: PathBuf,
    /// Directory local to this daemon
    #[serde(default = "default_local_working_dir")]
    pub local_working_dir: PathBuf,
}

fn default_shared_working_dir() -> PathBuf {
    PathBuf::from("/mnt/convert")
}

fn default_local_working_dir() -> PathBuf {
    PathBuf::from("/var/tmp/convert")
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            shared_working_dir: default_shared_working_dir(),
            local_working_dir: default_local_working_dir(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// IP address to listen on
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Secret shared with clients, used by the connection handshake
    #[serde(default = "default_shared_secret")]
    pub shared_secret: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    65500
}

fn default_shared_secret() -> String {
    "change-this-secret".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shared_secret: default_shared_secret(),
        }
    }
}

/// What this daemon contributes to the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Number of chunks this daemon encodes simultaneously
    #[serde(default = "default_num_chunks")]
    pub num_chunks: u32,
    /// Whether this daemon hosts the shared files (is the NFS server)
    #[serde(default)]
    pub is_file_host: bool,
}

fn default_num_chunks() -> u32 {
    2
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            num_chunks: default_num_chunks(),
            is_file_host: false,
        }
    }
}

impl NodeConfig {
    /// A file host may opt out of encoding entirely; every other node must take chunks.
    pub fn min_num_chunks(&self) -> u32 {
        if self.is_file_host {
            0
        } else {
            1
        }
    }
}

/// Transcoder (ffmpeg) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscoderConfig {
    /// Explicit ffmpeg path (looked up on PATH if None)
    pub path: Option<PathBuf>,
    /// Minimum interval between split progress reports in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    /// Abort a split that runs longer than this many seconds
    pub split_timeout_secs: Option<u64>,
}

fn default_report_interval_ms() -> u64 {
    500
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            path: None,
            report_interval_ms: default_report_interval_ms(),
            split_timeout_secs: None,
        }
    }
}

impl TranscoderConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn split_timeout(&self) -> Option<Duration> {
        self.split_timeout_secs.map(Duration::from_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and optional fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to a TOML file, replacing any previous content
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load the config file, writing a default one first if it does not exist yet
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Config::default().save(path)?;
        }
        Self::load_from_file(path)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CED_SHARED_WORKING_DIR -> dirs.shared_working_dir
    /// - CED_LOCAL_WORKING_DIR -> dirs.local_working_dir
    /// - CED_HOST -> listen.host
    /// - CED_PORT -> listen.port
    /// - CED_SHARED_SECRET -> listen.shared_secret
    /// - CED_NUM_CHUNKS -> node.num_chunks
    /// - CED_IS_FILE_HOST -> node.is_file_host
    /// - CED_FFMPEG_PATH -> transcoder.path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CED_SHARED_WORKING_DIR") {
            self.dirs.shared_working_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("CED_LOCAL_WORKING_DIR") {
            self.dirs.local_working_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("CED_HOST") {
            self.listen.host = val;
        }

        if let Ok(val) = env::var("CED_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.listen.port = port;
            }
        }

        if let Ok(val) = env::var("CED_SHARED_SECRET") {
            self.listen.shared_secret = val;
        }

        if let Ok(val) = env::var("CED_NUM_CHUNKS") {
            if let Ok(chunks) = val.parse::<u32>() {
                self.node.num_chunks = chunks;
            }
        }

        if let Ok(val) = env::var("CED_IS_FILE_HOST") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.node.is_file_host = true,
                "false" | "0" | "no" => self.node.is_file_host = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("CED_FFMPEG_PATH") {
            self.transcoder.path = Some(PathBuf::from(val));
        }
    }

    /// Check value constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "host '{}' is not an IP address",
                self.listen.host
            )));
        }

        if self.listen.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be between 1 and 65535".to_string(),
            ));
        }

        if self.listen.shared_secret.chars().count() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "shared secret must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }

        if self.node.num_chunks < self.node.min_num_chunks() {
            return Err(ConfigError::Invalid(
                "num_chunks must be at least 1 unless this daemon is the file host".to_string(),
            ));
        }

        if self.transcoder.report_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "report_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
