//! Minimal async client for the daemon protocol
//!
//! Performs the shared-secret handshake and exchanges newline-delimited JSON
//! envelopes. Used by the integration tests and by front-ends that drive a
//! daemon.

use crate::auth::{self, AuthError};
use crate::protocol::{Command, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid reply: {0}")]
    Json(#[from] serde_json::Error),
}

/// An authenticated connection to a daemon
#[derive(Debug)]
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A, secret: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        auth::connect(&mut reader, &mut writer, secret).await?;
        Ok(Self { reader, writer })
    }

    /// Envelope for a command without parameters
    pub fn envelope(command: Command) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "command": command.as_str(),
        })
    }

    /// Send any JSON value as one line
    pub async fn send(&mut self, envelope: &Value) -> Result<(), ClientError> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_command(&mut self, command: Command) -> Result<(), ClientError> {
        self.send(&Self::envelope(command)).await
    }

    /// Next reply, or `None` once the daemon closed the connection
    pub async fn recv(&mut self) -> Result<Option<Value>, ClientError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Ok(Some(serde_json::from_str(&line)?));
            }
        }
    }

    /// Send a parameterless command and wait for its reply
    pub async fn request(&mut self, command: Command) -> Result<Option<Value>, ClientError> {
        self.send_command(command).await?;
        self.recv().await
    }

    /// Half-close the connection; the daemon sees end of stream.
    pub async fn shutdown_write(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
