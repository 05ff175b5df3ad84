//! CLI entry point for the Cluster Encode Daemon
//!
//! Loads the configuration (creating a default file on first run), applies
//! environment and command line overrides, then serves clients until a
//! `shutdown` command or Ctrl-C.

use clap::Parser;
use cluster_encode_daemon::{Config, Daemon, DaemonError, DAEMON_VERSION};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cluster Encode Daemon - splits media into chunks for distributed encoding
#[derive(Parser, Debug)]
#[command(name = "cluster-encode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file, created with defaults if missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    debug: bool,

    /// Directory shared between all daemons
    #[arg(long)]
    shared_working_dir: Option<PathBuf>,

    /// Directory local to this daemon
    #[arg(long)]
    local_working_dir: Option<PathBuf>,

    /// IP address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Secret shared by all members of the cluster
    #[arg(long)]
    shared_secret: Option<String>,

    /// Number of chunks this daemon encodes at once
    #[arg(long)]
    num_chunks: Option<u32>,

    /// Whether this daemon hosts the shared files
    #[arg(long)]
    is_file_host: Option<bool>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Write the merged configuration back to the config file and exit
    #[arg(long)]
    save_config: bool,

    /// Skip startup checks (working directories, ffmpeg). For testing only.
    #[arg(long)]
    skip_checks: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.shared_working_dir {
            config.dirs.shared_working_dir = dir.clone();
        }
        if let Some(dir) = &self.local_working_dir {
            config.dirs.local_working_dir = dir.clone();
        }
        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(secret) = &self.shared_secret {
            config.listen.shared_secret = secret.clone();
        }
        if let Some(num_chunks) = self.num_chunks {
            config.node.num_chunks = num_chunks;
        }
        if let Some(is_file_host) = self.is_file_host {
            config.node.is_file_host = is_file_host;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.transcoder.path = Some(ffmpeg.clone());
        }
    }
}

fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = Config::load_or_create(&args.config)?;
    config.apply_env_overrides();
    args.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn build_daemon(args: &Args, config: Config) -> Result<Daemon, DaemonError> {
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        let transcoder = config
            .transcoder
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(cluster_encode_daemon::startup::DEFAULT_TRANSCODER));
        Ok(Daemon::new_without_checks(config, transcoder))
    } else {
        Daemon::with_config(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    info!(version = DAEMON_VERSION, config = %args.config.display(), "cluster encode daemon starting");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.save_config {
        return match config.save(&args.config) {
            Ok(()) => {
                info!(path = %args.config.display(), "configuration saved");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to save configuration");
                ExitCode::FAILURE
            }
        };
    }

    let daemon = match build_daemon(&args, config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}
