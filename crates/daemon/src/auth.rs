//! Shared-secret connection handshake
//!
//! Before any command is read the daemon proves that the peer knows the
//! cluster secret:
//!
//! ```text
//! daemon -> #CHALLENGE#<nonce>
//! client -> hex(HMAC-SHA256(secret, nonce))
//! daemon -> #WELCOME#   or   #FAILURE#
//! ```
//!
//! The secret itself never crosses the wire.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_PREFIX: &str = "#CHALLENGE#";
pub const WELCOME: &str = "#WELCOME#";
pub const FAILURE: &str = "#FAILURE#";

/// Upper bound for a complete handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest handshake line accepted from a peer
const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Peer closed the connection during the handshake")]
    Closed,

    #[error("Peer failed to authenticate")]
    Rejected,

    #[error("Malformed handshake line: {0}")]
    Malformed(String),

    #[error("Invalid shared secret: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),
}

/// Hex encoded HMAC of `nonce` keyed by `secret`
pub fn sign(secret: &str, nonce: &str) -> Result<String, AuthError> {
    let mac = HmacSha256::new_from_slice(secret.as_bytes())?.chain_update(nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex encoded response
pub fn verify(secret: &str, nonce: &str, response: &str) -> bool {
    let (Ok(bytes), Ok(mac)) = (
        hex::decode(response.trim()),
        HmacSha256::new_from_slice(secret.as_bytes()),
    ) else {
        return false;
    };
    mac.chain_update(nonce.as_bytes()).verify_slice(&bytes).is_ok()
}

/// Fresh random challenge
pub fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Server side of the handshake, bounded by [`HANDSHAKE_TIMEOUT`].
pub async fn accept<R, W>(reader: &mut R, writer: &mut W, secret: &str) -> Result<(), AuthError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_inner(reader, writer, secret))
        .await
        .map_err(|_| AuthError::Timeout)?
}

async fn accept_inner<R, W>(reader: &mut R, writer: &mut W, secret: &str) -> Result<(), AuthError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nonce = new_nonce();
    write_line(writer, &format!("{}{}", CHALLENGE_PREFIX, nonce)).await?;

    let response = read_line(reader).await?;
    if verify(secret, &nonce, &response) {
        write_line(writer, WELCOME).await?;
        Ok(())
    } else {
        write_line(writer, FAILURE).await?;
        Err(AuthError::Rejected)
    }
}

/// Client side of the handshake, bounded by [`HANDSHAKE_TIMEOUT`].
pub async fn connect<R, W>(reader: &mut R, writer: &mut W, secret: &str) -> Result<(), AuthError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_inner(reader, writer, secret))
        .await
        .map_err(|_| AuthError::Timeout)?
}

async fn connect_inner<R, W>(reader: &mut R, writer: &mut W, secret: &str) -> Result<(), AuthError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let challenge = read_line(reader).await?;
    let nonce = challenge
        .strip_prefix(CHALLENGE_PREFIX)
        .ok_or_else(|| AuthError::Malformed(challenge.clone()))?;
    write_line(writer, &sign(secret, nonce)?).await?;

    match read_line(reader).await?.as_str() {
        WELCOME => Ok(()),
        FAILURE => Err(AuthError::Rejected),
        other => Err(AuthError::Malformed(other.to_string())),
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, AuthError> {
    let mut line = String::new();
    let read = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Err(AuthError::Closed);
    }
    if !line.ends_with('\n') {
        return Err(AuthError::Malformed(line));
    }
    Ok(line.trim_end().to_string())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), AuthError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
