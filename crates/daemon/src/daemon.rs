//! Daemon startup and accept loop
//!
//! The daemon serves one authenticated connection at a time. A second client
//! simply waits in the listen backlog until the current session ends.

use crate::config::{Config, ConfigError};
use crate::ffmpeg::{SplitOptions, TranscoderInfo, TranscoderInspector};
use crate::jobs::JobSlot;
use crate::paths::PathResolver;
use crate::protocol::Validator;
use crate::session::{self, NodeInfo, SessionContext, SessionEnd};
use crate::startup::{run_startup_checks, StartupError};
use crate::state::{new_shared_state, DaemonState, SharedState};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Version reported by the `report` command
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Invalid listen host: {0}")]
    ListenHost(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// The daemon and everything its sessions share
pub struct Daemon {
    pub config: Config,
    context: SessionContext,
}

impl Daemon {
    /// Load, validate and check a configuration file, then build the daemon
    pub fn from_config_file<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Validate `config` and run the startup checks
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let report = run_startup_checks(&config)?;
        Ok(Self::from_parts(config, report.transcoder, report.transcoder_info))
    }

    /// Build the daemon without validation or startup checks
    ///
    /// The transcoder is still queried for the `report` command; a missing
    /// binary just yields an empty report entry.
    pub fn new_without_checks(config: Config, transcoder: PathBuf) -> Self {
        let info = TranscoderInspector::new(&transcoder).info();
        Self::from_parts(config, transcoder, info)
    }

    fn from_parts(config: Config, transcoder: PathBuf, transcoder_info: TranscoderInfo) -> Self {
        let state = new_shared_state();
        let shutdown = CancellationToken::new();
        let options = SplitOptions {
            report_interval: config.transcoder.report_interval(),
            timeout: config.transcoder.split_timeout(),
        };
        let slot = JobSlot::new(state.clone(), transcoder, options, shutdown.clone());

        let context = SessionContext {
            validator: Validator::new(PathResolver::from_config(&config.dirs)),
            state,
            slot,
            node: NodeInfo {
                daemon_version: DAEMON_VERSION.to_string(),
                num_chunks: config.node.num_chunks,
                is_file_host: config.node.is_file_host,
                transcoder: transcoder_info,
            },
            secret: config.listen.shared_secret.clone(),
            shutdown,
        };

        Self { config, context }
    }

    pub fn state(&self) -> SharedState {
        self.context.state.clone()
    }

    /// Cancelling this token stops the daemon and any running split
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    pub fn transcoder(&self) -> &Path {
        self.context.slot.transcoder()
    }

    pub fn transcoder_info(&self) -> &TranscoderInfo {
        &self.context.node.transcoder
    }

    /// Socket address from the `[listen]` section
    pub fn listen_addr(&self) -> Result<SocketAddr, DaemonError> {
        let host: IpAddr = self
            .config
            .listen
            .host
            .parse()
            .map_err(|_| DaemonError::ListenHost(self.config.listen.host.clone()))?;
        Ok(SocketAddr::new(host, self.config.listen.port))
    }

    pub async fn bind(&self) -> Result<TcpListener, DaemonError> {
        let addr = self.listen_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(&self) -> Result<(), DaemonError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections one at a time until a `shutdown` command arrives or
    /// the shutdown token is cancelled.
    ///
    /// Failed handshakes are logged and the loop keeps accepting. On exit any
    /// running split is cancelled and awaited.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DaemonError> {
        let shutdown = self.context.shutdown.clone();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "daemon listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            info!(%peer, "client connected");

            match session::run(&self.context, stream).await {
                Ok(SessionEnd::Closed) => info!(%peer, "client disconnected"),
                Ok(SessionEnd::Shutdown) => {
                    info!(%peer, "shutdown requested");
                    break;
                }
                Err(e) => warn!(%peer, error = %e, "connection rejected"),
            }
        }

        shutdown.cancel();
        self.context.slot.wait_idle().await;
        *self.context.state.write().await = DaemonState::ShuttingDown;
        info!("daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DaemonClient;
    use crate::protocol::Command;
    use tempfile::TempDir;

    fn create_test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.dirs.shared_working_dir = dir.to_path_buf();
        config.dirs.local_working_dir = dir.to_path_buf();
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.listen.shared_secret = "daemon-test-secret".to_string();
        config.node.num_chunks = 5;
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(dir.path());
        let daemon = Daemon::new_without_checks(config.clone(), PathBuf::from("/nonexistent"));

        assert_eq!(daemon.config, config);
        assert_eq!(daemon.transcoder(), Path::new("/nonexistent"));
        assert_eq!(daemon.transcoder_info().version, None);
        assert_eq!(*daemon.state().read().await, DaemonState::Idle);
    }

    #[test]
    fn test_listen_addr() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.listen.port = 65500;
        let daemon = Daemon::new_without_checks(config.clone(), PathBuf::from("/nonexistent"));
        assert_eq!(
            daemon.listen_addr().unwrap(),
            "127.0.0.1:65500".parse::<SocketAddr>().unwrap()
        );

        config.listen.host = "localhost".to_string();
        let daemon = Daemon::new_without_checks(config, PathBuf::from("/nonexistent"));
        assert!(matches!(
            daemon.listen_addr(),
            Err(DaemonError::ListenHost(host)) if host == "localhost"
        ));
    }

    #[test]
    fn test_with_config_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.listen.port = 65500;
        config.listen.shared_secret = "short".to_string();
        assert!(matches!(
            Daemon::with_config(config),
            Err(DaemonError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_on_token() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(
            create_test_config(dir.path()),
            PathBuf::from("/nonexistent"),
        );
        let listener = daemon.bind().await.unwrap();
        let token = daemon.shutdown_token();

        let serving = tokio::spawn(async move { daemon.serve(listener).await });
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_serve_survives_bad_handshake() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(
            create_test_config(dir.path()),
            PathBuf::from("/nonexistent"),
        );
        let listener = daemon.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(async move { daemon.serve(listener).await });

        let rejected = DaemonClient::connect(addr, "wrong-secret").await;
        assert!(rejected.is_err());

        let mut client = DaemonClient::connect(addr, "daemon-test-secret").await.unwrap();
        let status = client.request(Command::Status).await.unwrap().unwrap();
        assert_eq!(status["status"], "idle");

        client.send_command(Command::Shutdown).await.unwrap();
        assert!(client.recv().await.unwrap().is_none());
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
