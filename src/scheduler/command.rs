//! Commands accepted by the control loop.
//!
//! Commands travel over a tokio `mpsc` channel. Queries carry a `oneshot::Sender` for
//! the reply; the helper constructors return the matching receiver so the caller
//! always has something to await.
//!
//! ```text
//! client                          control loop
//! ------                          ------------
//! Command::status() ─── mpsc ───▶ snapshot state
//! await receiver    ◀── oneshot ─ reply
//! ```

use crate::capture::{CaptureId, CaptureRequest};
use crate::error::ReadoutResult;
use crate::feedline_config::ConfigHash;
use crate::hardware::{HardwareStatus, QuietOptions};
use crate::tap::Tap;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Which captures an abort applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortTarget {
    /// One capture, queued or running.
    Id(CaptureId),
    /// Every queued and running capture.
    All,
}

/// Commands that can be sent to the control loop.
#[derive(Debug)]
pub enum Command {
    /// Submits a capture for admission.
    Capture(CaptureRequest),

    /// Cancels queued or running captures.
    Abort(AbortTarget),

    /// Reports the scheduler's current state.
    Status {
        /// Reply channel for the snapshot.
        response: oneshot::Sender<SchedulerStatus>,
    },

    /// Aborts everything, joins all workers, resets the instrument and resumes with
    /// empty queues. A failed reset stops the loop.
    Reset {
        /// Reply channel for the outcome.
        response: oneshot::Sender<ReadoutResult<()>>,
    },

    /// Aborts everything and silences the instrument's outputs.
    BeQuiet {
        /// What to silence.
        options: QuietOptions,
        /// Reply channel for the outcome.
        response: oneshot::Sender<ReadoutResult<()>>,
    },

    /// Aborts everything, joins all workers and stops the loop.
    Exit,
}

impl Command {
    /// Helper to create an abort for one capture.
    pub fn abort(id: CaptureId) -> Self {
        Self::Abort(AbortTarget::Id(id))
    }

    /// Helper to create an abort for everything.
    pub fn abort_all() -> Self {
        Self::Abort(AbortTarget::All)
    }

    /// Helper to create a Status command
    pub fn status() -> (Self, oneshot::Receiver<SchedulerStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Reset command
    pub fn reset() -> (Self, oneshot::Receiver<ReadoutResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reset { response: tx }, rx)
    }

    /// Helper to create a BeQuiet command
    pub fn be_quiet(options: QuietOptions) -> (Self, oneshot::Receiver<ReadoutResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::BeQuiet {
                options,
                response: tx,
            },
            rx,
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::Abort(AbortTarget::Id(_)) => "abort",
            Self::Abort(AbortTarget::All) => "abort_all",
            Self::Status { .. } => "status",
            Self::Reset { .. } => "reset",
            Self::BeQuiet { .. } => "bequiet",
            Self::Exit => "exit",
        }
    }
}

/// Terminal outcomes recorded while reaping workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    /// Captures that delivered every chunk.
    pub finished: u64,
    /// Captures that failed after admission.
    pub failed: u64,
    /// Captures cancelled while running.
    pub aborted: u64,
}

/// Instrument state as seen by the status command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareReport {
    /// The instrument answered.
    Available(HardwareStatus),
    /// The status query failed; the loop's own state is still reported.
    Unavailable {
        /// Driver-level reason.
        error: String,
    },
}

/// Point-in-time view of the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// Running capture per occupied tap.
    pub running: BTreeMap<Tap, CaptureId>,
    /// Waiting captures in admission order (fresh queue first, then stale).
    pub pending: Vec<CaptureId>,
    /// Hash of the configuration the instrument currently needs.
    pub effective_hash: ConfigHash,
    /// Configurations known by hash.
    pub learned_configs: usize,
    /// Outcomes of reaped workers.
    pub outcomes: OutcomeCounts,
    /// Successful instrument resets.
    pub resets: u64,
    /// Instrument state.
    pub hardware: HardwareReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_build_matching_variants() {
        let id = CaptureId::from_raw("abc");
        assert!(matches!(Command::abort(id.clone()), Command::Abort(AbortTarget::Id(x)) if x == id));
        assert_eq!(Command::abort_all().name(), "abort_all");

        let (cmd, _rx) = Command::status();
        assert_eq!(cmd.name(), "status");

        let (cmd, _rx) = Command::reset();
        assert_eq!(cmd.name(), "reset");

        let (cmd, _rx) = Command::be_quiet(QuietOptions::default());
        assert!(matches!(
            cmd,
            Command::BeQuiet { options, .. } if options.stop_dacs && !options.power_off_if
        ));
    }
}
