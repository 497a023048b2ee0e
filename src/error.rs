//! Custom error types for the readout scheduler.
//!
//! This module defines the primary error type, `ReadoutError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between a client submitting a capture and the last
//! chunk leaving the instrument.
//!
//! ## Error Hierarchy
//!
//! `ReadoutError` falls into four groups:
//!
//! - **Rejections**: `Validation` and `ConfigUnknown`. The request is refused before any
//!   side effect on the instrument.
//! - **Routing signals**: `TapBusy` and `ConfigConflict`. These are not failures; the
//!   scheduler parks the request in its queue and re-checks it later.
//! - **Per-request failures**: `Channel`, `NotEstablished`, `AlreadyTerminal`,
//!   `InvalidTransition`, `Aborted` and `Hardware`. Only the owning request is affected.
//! - **Fatal**: `HardwareApply` and `HardwareReset`. The instrument's state can no longer
//!   be trusted, so the scheduler aborts every request and stops.
//!
//! `HardwareControl` reports a failed quiet request back to its caller; the loop keeps
//! running.
//!
//! By using `#[from]`, settings errors convert with the `?` operator.

use crate::capture::{CaptureId, StatusKind};
use crate::feedline_config::ConfigHash;
use crate::tap::Tap;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ReadoutResult<T> = std::result::Result<T, ReadoutError>;

/// Primary error type for the readout scheduler.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Malformed request, e.g. an unknown tap name or a zero sample count.
    #[error("Invalid capture request: {0}")]
    Validation(String),

    /// The request referenced a configuration by hash that was never taught in full.
    #[error("Configuration unknown: {0} has never been sent in full")]
    ConfigUnknown(ConfigHash),

    /// The tap needed by the request is serving another capture.
    #[error("tap busy: {tap} in use by {holder}")]
    TapBusy {
        /// Contended tap.
        tap: Tap,
        /// Request currently holding the tap.
        holder: CaptureId,
    },

    /// The request's configuration disagrees with the effective configuration.
    #[error("configuration conflict on {}", .fields.join(", "))]
    ConfigConflict {
        /// Dotted paths of the conflicting fields.
        fields: Vec<String>,
    },

    /// The transport could not open a status or data channel.
    #[error("Channel error for {id}: {message}")]
    Channel {
        /// Request whose channel failed.
        id: CaptureId,
        /// Transport-level reason.
        message: String,
    },

    /// Status or data was emitted before `establish()`.
    #[error("Capture {0} must be established before emitting status or data")]
    NotEstablished(CaptureId),

    /// A second terminal transition was attempted.
    #[error("Capture {0} already reached a terminal state")]
    AlreadyTerminal(CaptureId),

    /// A status change the lifecycle does not allow, e.g. running twice.
    #[error("Capture {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Request being updated.
        id: CaptureId,
        /// Current status, or `created`.
        from: String,
        /// Requested status.
        to: StatusKind,
    },

    /// Cooperative cancellation observed by a worker.
    #[error("Capture aborted: {0}")]
    Aborted(String),

    /// Applying the merged configuration to the instrument failed.
    #[error("Hardware configuration failure: {0}")]
    HardwareApply(String),

    /// Resetting the instrument failed.
    #[error("Hardware reset failure: {0}")]
    HardwareReset(String),

    /// A non-capture instrument operation such as silencing the outputs failed.
    #[error("Hardware control failure: {0}")]
    HardwareControl(String),

    /// Device I/O failed while a capture was running.
    #[error("Hardware error on tap {tap}: {message}")]
    Hardware {
        /// Tap being read.
        tap: Tap,
        /// Driver-level reason.
        message: String,
    },

    /// The scheduler loop is no longer accepting commands.
    #[error("Scheduler is not running")]
    SchedulerClosed,

    /// The command queue is full; only returned by non-blocking submission.
    #[error("Scheduler command queue is full")]
    CommandQueueFull,

    /// Settings file or environment could not be parsed.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Settings parsed but failed semantic validation.
    #[error("Settings validation error: {0}")]
    SettingsValidation(String),
}

impl ReadoutError {
    /// True for the two outcomes that send a request to the queue instead of failing it.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            ReadoutError::TapBusy { .. } | ReadoutError::ConfigConflict { .. }
        )
    }
}

impl From<figment::Error> for ReadoutError {
    fn from(value: figment::Error) -> Self {
        ReadoutError::Settings(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queueable_errors_are_routing_signals() {
        let busy = ReadoutError::TapBusy {
            tap: Tap::Engineering,
            holder: CaptureId::from_raw("abc"),
        };
        let conflict = ReadoutError::ConfigConflict {
            fields: vec!["if_board.lo".into()],
        };
        assert!(busy.is_queueable());
        assert!(conflict.is_queueable());
        assert!(!ReadoutError::Aborted("user".into()).is_queueable());
        assert!(!ReadoutError::HardwareApply("dac".into()).is_queueable());
    }

    #[test]
    fn conflict_message_lists_fields() {
        let err = ReadoutError::ConfigConflict {
            fields: vec!["if_board.lo".into(), "ddc.tones".into()],
        };
        assert_eq!(
            err.to_string(),
            "configuration conflict on if_board.lo, ddc.tones"
        );
    }

    #[test]
    fn tap_busy_names_holder() {
        let err = ReadoutError::TapBusy {
            tap: Tap::Photon,
            holder: CaptureId::from_raw("0123"),
        };
        assert_eq!(err.to_string(), "tap busy: photon in use by 0123");
    }
}
