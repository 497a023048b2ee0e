//! # Scheduler
//!
//! Admission control for the instrument's capture taps.
//!
//! One control task owns every piece of scheduling state. Clients talk to it only
//! through a [`SchedulerHandle`]; running captures talk to it only through their
//! worker's completion and a private cancellation channel.
//!
//! ## Admission
//!
//! A request runs once its tap is free and its configuration is compatible with
//! the effective configuration of everything already running:
//!
//! ```text
//!            submit
//!              │
//!              ▼
//!   fresh ──▶ admit ──▶ tap busy / conflict ──▶ stale
//!     ▲         │                                 │
//!     │         ▼                                 │
//!     │   apply config ──▶ spawn TapWorker        │
//!     │                         │                 │
//!     └──── worker reaped ◀─────┘ ────────────────┘
//! ```
//!
//! A failed configuration apply is fatal: every queued and running request is
//! aborted and [`Scheduler::run`] returns `ReadoutError::HardwareApply`. A failed
//! instrument reset stops the loop the same way with `ReadoutError::HardwareReset`.
//!
//! ## Instrument control
//!
//! `reset` drains the loop, resets the instrument and resumes with empty queues.
//! `be_quiet` aborts everything and silences the outputs; the next admitted capture
//! re-applies its configuration.
//!
//! ## Example
//!
//! ```rust,ignore
//! let (scheduler, handle) = Scheduler::new(settings.scheduler.clone(), hardware);
//! let task = tokio::spawn(scheduler.run());
//! handle.submit(request).await?;
//! handle.shutdown().await?;
//! task.await??;
//! ```

mod command;
mod core;
mod handle;
mod queue;

pub use command::{AbortTarget, Command, HardwareReport, OutcomeCounts, SchedulerStatus};
pub use core::Scheduler;
pub use handle::SchedulerHandle;
pub use queue::{AdmissionQueue, Pending};

use crate::error::ReadoutResult;
use crate::hardware::Hardware;
use crate::settings::SchedulerSettings;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Spawns the control loop on the current runtime.
pub fn spawn(
    settings: SchedulerSettings,
    hardware: Arc<dyn Hardware>,
) -> (SchedulerHandle, JoinHandle<ReadoutResult<()>>) {
    let (scheduler, handle) = Scheduler::new(settings, hardware);
    (handle, tokio::spawn(scheduler.run()))
}
