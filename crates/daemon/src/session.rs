//! One client connection
//!
//! A session authenticates the peer, then reads newline-delimited command
//! envelopes until the peer leaves, sends `close`/`shutdown`, or breaks the
//! protocol. All outgoing messages go through a single writer task fed by an
//! unbounded channel, so progress events from a running split and command
//! replies reach the client in the order they were produced.
//!
//! While a split is attached to the session the loop keeps reading commands:
//! `status` and `report` are answered, a second `split` is refused as busy.
//! If the session ends early the job is detached and keeps running.

use crate::auth::{self, AuthError};
use crate::ffmpeg::{SplitJobResult, TranscoderInfo};
use crate::jobs::{ActiveJob, JobSlot, JobStartError, JobUpdate};
use crate::protocol::{ProtocolError, ReportReply, Reply, Request, SplitRequest, Validator};
use crate::state::{DaemonState, SharedState};
use std::io;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    WriteHalf,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest command line accepted from a client, newline included
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Connection closed; keep accepting
    Closed,
    /// The client asked the daemon to stop
    Shutdown,
}

/// Static facts reported by the `report` command
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub daemon_version: String,
    pub num_chunks: u32,
    pub is_file_host: bool,
    pub transcoder: TranscoderInfo,
}

/// Everything a session needs from the daemon
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub validator: Validator,
    pub state: SharedState,
    pub slot: JobSlot,
    pub node: NodeInfo,
    pub secret: String,
    /// Daemon-wide shutdown; ends the session and cancels its job
    pub shutdown: CancellationToken,
}

/// What the command loop does after handling one line
enum Flow {
    Continue,
    Close,
    Shutdown,
}

/// Result of reading one command line
enum ReadLine {
    Line(String),
    TooLong,
    Eof,
}

enum Input {
    Line(io::Result<ReadLine>),
    Job(JobUpdate),
    Shutdown,
}

/// Serve one connection until it ends.
///
/// Returns an error only when the handshake fails; every later problem is
/// reported to the client (if possible) and ends the session normally.
pub async fn run<S>(ctx: &SessionContext, stream: S) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    auth::accept(&mut reader, &mut write_half, &ctx.secret).await?;

    let (replies, outbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(write_half, outbox));

    let mut session = Session {
        ctx,
        replies,
        job: None,
    };
    let end = session.command_loop(&mut reader).await;
    let Session { replies, job, .. } = session;

    if let Some(job) = job {
        match end {
            SessionEnd::Closed => job.detach(),
            SessionEnd::Shutdown => {
                let result = job.cancel().await;
                debug!(error = ?result.error, "split cancelled by shutdown");
            }
        }
    }
    if end == SessionEnd::Shutdown {
        *ctx.state.write().await = DaemonState::ShuttingDown;
    }

    // Let the writer flush what is queued, e.g. a final error reply.
    drop(replies);
    if let Err(e) = writer.await {
        warn!(error = %e, "reply writer task failed");
    }
    Ok(end)
}

async fn write_replies<S>(mut writer: WriteHalf<S>, mut outbox: mpsc::UnboundedReceiver<Reply>)
where
    S: AsyncWrite,
{
    while let Some(reply) = outbox.recv().await {
        let line = match reply.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize reply");
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "client connection lost while writing");
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "client connection lost while flushing");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct Session<'a> {
    ctx: &'a SessionContext,
    replies: mpsc::UnboundedSender<Reply>,
    job: Option<ActiveJob>,
}

impl Session<'_> {
    async fn command_loop<R>(&mut self, reader: &mut R) -> SessionEnd
    where
        R: AsyncBufRead + Unpin,
    {
        let shutdown = self.ctx.shutdown.clone();
        let mut buf = Vec::new();
        loop {
            let input = match self.job.as_mut() {
                Some(job) => tokio::select! {
                    _ = shutdown.cancelled() => Input::Shutdown,
                    line = read_command(reader, &mut buf) => Input::Line(line),
                    update = job.next() => Input::Job(update),
                },
                None => tokio::select! {
                    _ = shutdown.cancelled() => Input::Shutdown,
                    line = read_command(reader, &mut buf) => Input::Line(line),
                },
            };

            let flow = match input {
                Input::Job(JobUpdate::Event(event)) => {
                    self.send(Reply::progress(event));
                    Flow::Continue
                }
                Input::Job(JobUpdate::Finished(result)) => {
                    self.finish_job(result).await;
                    Flow::Continue
                }
                Input::Line(Ok(ReadLine::Line(line))) if line.trim().is_empty() => Flow::Continue,
                Input::Line(Ok(ReadLine::Line(line))) => self.handle_line(&line).await,
                Input::Line(Ok(ReadLine::TooLong)) => {
                    let e = ProtocolError::InvalidJson(format!(
                        "command longer than {} bytes",
                        MAX_COMMAND_LEN
                    ));
                    warn!(number = e.number(), error = %e, "rejected command");
                    self.send(Reply::error(&e));
                    Flow::Close
                }
                Input::Line(Ok(ReadLine::Eof)) => {
                    debug!("client closed the connection");
                    Flow::Close
                }
                Input::Line(Err(e)) => {
                    debug!(error = %e, "failed reading from client");
                    Flow::Close
                }
                Input::Shutdown => Flow::Shutdown,
            };

            match flow {
                Flow::Continue => {}
                Flow::Close => return SessionEnd::Closed,
                Flow::Shutdown => return SessionEnd::Shutdown,
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let request = match self.ctx.validator.validate_line(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(number = e.number(), error = %e, "rejected command");
                self.send(Reply::error(&e));
                return Flow::Close;
            }
        };
        debug!(command = %request.command(), "command received");

        match request {
            Request::Status => {
                let state = *self.ctx.state.read().await;
                self.send(Reply::status(state));
            }
            Request::Report => self.report().await,
            Request::Split(split) => self.split(split).await,
            Request::Close => return Flow::Close,
            Request::Shutdown => {
                info!("shutdown requested by client");
                return Flow::Shutdown;
            }
            Request::Reserved(command) => {
                debug!(command = %command, "command has no handler yet");
            }
        }
        Flow::Continue
    }

    async fn report(&mut self) {
        let node = &self.ctx.node;
        let status = {
            let mut state = self.ctx.state.write().await;
            if *state == DaemonState::Idle {
                *state = DaemonState::Reporting;
            }
            *state
        };

        self.send(Reply::report(ReportReply::new(
            status,
            node.daemon_version.clone(),
            &node.transcoder,
            node.num_chunks,
            node.is_file_host,
        )));

        let mut state = self.ctx.state.write().await;
        if *state == DaemonState::Reporting {
            *state = DaemonState::Idle;
        }
    }

    async fn split(&mut self, split: SplitRequest) {
        if self.job.is_some() {
            self.send(Reply::error(&ProtocolError::Busy));
            return;
        }

        info!(
            input = %split.input_file.display(),
            output_dir = %split.output_dir.display(),
            chunk_secs = split.chunk_size.as_secs(),
            "split requested"
        );
        match self.ctx.slot.start_split(split.into_job_spec()).await {
            Ok(job) => self.job = Some(job),
            Err(JobStartError::Busy) => {
                warn!("split refused, another job is running");
                self.send(Reply::error(&ProtocolError::Busy));
            }
            Err(JobStartError::Split(e)) => {
                warn!(error = %e, "split could not be started");
                self.send(Reply::split_finished(&SplitJobResult::failed(e.to_string())));
            }
        }
    }

    async fn finish_job(&mut self, result: SplitJobResult) {
        self.send(Reply::split_finished(&result));
        if let Some(job) = self.job.take() {
            job.release().await;
        }
    }

    fn send(&self, reply: Reply) {
        // A closed outbox means the writer saw the client go away; the read
        // side notices on its next read.
        let _ = self.replies.send(reply);
    }
}

/// Read one `\n` terminated command, giving up after [`MAX_COMMAND_LEN`] bytes.
///
/// Partial reads stay in `buf`, so this is safe to use in `select!`.
async fn read_command<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<ReadLine>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = MAX_COMMAND_LEN.saturating_sub(buf.len()) as u64;
    let read = (&mut *reader).take(remaining).read_until(b'\n', buf).await?;
    if buf.last() != Some(&b'\n') && buf.len() >= MAX_COMMAND_LEN {
        buf.clear();
        return Ok(ReadLine::TooLong);
    }
    if read == 0 && buf.is_empty() {
        return Ok(ReadLine::Eof);
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    Ok(ReadLine::Line(line))
}
