//! Cluster Encode Daemon
//!
//! Worker daemon of the cluster encoder: accepts one authenticated client at
//! a time, answers status queries and splits media files into fixed-length
//! chunks with ffmpeg while streaming progress back to the client.

pub mod auth;
pub mod client;
pub mod daemon;
pub mod ffmpeg;
pub mod jobs;
pub mod paths;
pub mod protocol;
pub mod session;
pub mod startup;
pub mod state;

pub use cluster_encode_daemon_config as config;
pub use cluster_encode_daemon_config::Config;
pub use client::{ClientError, DaemonClient};
pub use daemon::{Daemon, DaemonError, DAEMON_VERSION};
pub use ffmpeg::{
    AudioCodec, ProgressEvent, ProgressParser, SplitJob, SplitJobResult, SplitJobSpec,
    TranscoderInfo, TranscoderInspector, VideoCodec,
};
pub use jobs::{ActiveJob, JobSlot, JobStartError, JobUpdate};
pub use paths::{PathError, PathResolver};
pub use protocol::{Command, ProtocolError, Reply, Request, Validator, PROTOCOL_VERSION};
pub use session::{SessionEnd, SessionError};
pub use startup::{run_startup_checks, StartupError, StartupReport};
pub use state::{DaemonState, SharedState};
