use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::capture::{CaptureId, CaptureRequest};
use crate::error::{ReadoutError, ReadoutResult};
use crate::hardware::QuietOptions;

use super::command::{Command, SchedulerStatus};

/// Handle for sending commands to the control loop.
///
/// Cheap to clone. The loop exits once every handle is dropped.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub(super) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Submit a capture (async, waits if the command queue is full).
    pub async fn submit(&self, request: CaptureRequest) -> ReadoutResult<()> {
        self.send(Command::Capture(request)).await
    }

    /// Try to submit without blocking (fails if the command queue is full).
    pub fn try_submit(&self, request: CaptureRequest) -> ReadoutResult<()> {
        self.tx
            .try_send(Command::Capture(request))
            .map_err(|e| match e {
                TrySendError::Full(_) => ReadoutError::CommandQueueFull,
                TrySendError::Closed(_) => ReadoutError::SchedulerClosed,
            })
    }

    /// Abort one queued or running capture.
    pub async fn abort(&self, id: CaptureId) -> ReadoutResult<()> {
        self.send(Command::abort(id)).await
    }

    /// Abort every queued and running capture.
    pub async fn abort_all(&self) -> ReadoutResult<()> {
        self.send(Command::abort_all()).await
    }

    /// Snapshot of the loop's state.
    pub async fn status(&self) -> ReadoutResult<SchedulerStatus> {
        let (command, rx) = Command::status();
        self.send(command).await?;
        rx.await.map_err(|_| ReadoutError::SchedulerClosed)
    }

    /// Abort everything and reset the instrument.
    ///
    /// The loop stops if the reset fails; the error is returned here as well.
    pub async fn reset(&self) -> ReadoutResult<()> {
        let (command, rx) = Command::reset();
        self.send(command).await?;
        rx.await.map_err(|_| ReadoutError::SchedulerClosed)?
    }

    /// Abort everything and silence the instrument.
    pub async fn be_quiet(&self, options: QuietOptions) -> ReadoutResult<()> {
        let (command, rx) = Command::be_quiet(options);
        self.send(command).await?;
        rx.await.map_err(|_| ReadoutError::SchedulerClosed)?
    }

    /// Ask the loop to abort everything and exit.
    pub async fn shutdown(&self) -> ReadoutResult<()> {
        self.send(Command::Exit).await
    }

    /// True once the loop has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> ReadoutResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ReadoutError::SchedulerClosed)
    }
}
