//! Split job slot
//!
//! The daemon runs at most one split at a time. The slot is a one-permit
//! semaphore: starting a job takes the permit with `try_acquire_owned`, so two
//! concurrent `split` commands can never both pass the check. The permit lives
//! inside [`ActiveJob`] and is released when the job is finished, whether the
//! requesting session is still attached or not.

use crate::ffmpeg::{ProgressEvent, SplitError, SplitJob, SplitJobResult, SplitJobSpec, SplitOptions};
use crate::state::{DaemonState, SharedState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a split could not be started
#[derive(Debug, Error)]
pub enum JobStartError {
    /// Another split holds the slot
    #[error("Daemon is busy with another split job")]
    Busy,

    #[error(transparent)]
    Split(#[from] SplitError),
}

/// Something that happened to an attached job
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Event(ProgressEvent),
    Finished(SplitJobResult),
}

/// Single-occupancy slot for split jobs
#[derive(Debug, Clone)]
pub struct JobSlot {
    semaphore: Arc<Semaphore>,
    state: SharedState,
    transcoder: PathBuf,
    options: SplitOptions,
    shutdown: CancellationToken,
}

impl JobSlot {
    /// Cancelling `shutdown` kills any split started from this slot.
    pub fn new(
        state: SharedState,
        transcoder: PathBuf,
        options: SplitOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            state,
            transcoder,
            options,
            shutdown,
        }
    }

    pub fn transcoder(&self) -> &Path {
        &self.transcoder
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Claim the slot and start a split.
    ///
    /// On success the daemon state is `Splitting` until the returned job is
    /// finished. If the transcoder cannot be started the slot is released
    /// again before returning.
    pub async fn start_split(&self, spec: SplitJobSpec) -> Result<ActiveJob, JobStartError> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| JobStartError::Busy)?;

        spec.validate()?;
        let (tx, events) = mpsc::unbounded_channel();
        let job = SplitJob::start_with_cancel(
            &self.transcoder,
            spec,
            self.options.clone(),
            tx,
            self.shutdown.child_token(),
        )?;

        *self.state.write().await = DaemonState::Splitting;

        Ok(ActiveJob {
            job,
            events,
            permit,
            state: self.state.clone(),
        })
    }

    /// Wait until no job holds the slot.
    pub async fn wait_idle(&self) {
        // Only fails if the semaphore is closed, which never happens.
        let _ = self.semaphore.acquire().await;
    }
}

/// A running split that owns the job slot
#[derive(Debug)]
pub struct ActiveJob {
    job: SplitJob,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    permit: OwnedSemaphorePermit,
    state: SharedState,
}

impl ActiveJob {
    /// Next progress event, or the result once the job has ended.
    ///
    /// Events are always delivered before the result. Do not call again
    /// after [`JobUpdate::Finished`]; hand the result to [`ActiveJob::release`].
    pub async fn next(&mut self) -> JobUpdate {
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => JobUpdate::Event(event),
            result = &mut self.job => JobUpdate::Finished(result),
        }
    }

    /// Kill the transcoder and wait for the failed result.
    pub async fn cancel(mut self) -> SplitJobResult {
        self.job.cancel();
        let result = (&mut self.job).await;
        self.release().await;
        result
    }

    /// Return the slot and put the daemon back to idle.
    pub async fn release(self) {
        *self.state.write().await = DaemonState::Idle;
        drop(self.permit);
    }

    /// Let the job run to completion without a session attached.
    ///
    /// The job is still cancelled if the daemon shuts down.
    pub fn detach(self) {
        let ActiveJob {
            job,
            events,
            permit,
            state,
        } = self;
        drop(events);
        info!(pid = ?job.pid(), "split detached from session");

        tokio::spawn(async move {
            let result = job.await;
            if result.success {
                info!(files = result.output_files.len(), "detached split finished");
            } else {
                warn!(files = result.output_files.len(), error = ?result.error, "detached split failed");
            }
            *state.write().await = DaemonState::Idle;
            drop(permit);
        });
    }
}
