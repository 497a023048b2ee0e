//! Instrument Hardware Contract
//!
//! The scheduler drives the instrument through a single, small trait. Register-level
//! drivers (DAC replay, down-conversion, matched filters, DMA engines) live behind it
//! and are out of scope here.
//!
//! # Design Philosophy
//!
//! - Async (`#[async_trait]`) and thread-safe (`Send + Sync`)
//! - Uses `anyhow::Result` for device errors; the scheduler maps them into
//!   [`ReadoutError`](crate::error::ReadoutError) variants
//! - Injected as `Arc<dyn Hardware>`, never reached through globals
//!
//! `pull_chunk` is the only call allowed to block on real device I/O.

pub mod mock;

pub use mock::SimulatedInstrument;

use crate::capture::CaptureId;
use crate::feedline_config::{ConfigHash, FeedlineConfig};
use crate::tap::{Tap, TapSource};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a worker asks the tap for on each pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Capture being served.
    pub id: CaptureId,
    /// Client-facing source (selects ADC, IQ or phase on the engineering tap).
    pub source: TapSource,
    /// Samples requested by the capture as a whole. For photon captures this is the
    /// buffer time in milliseconds.
    pub samples: u64,
    /// Zero-based chunk index.
    pub index: u64,
    /// Total chunks for bounded captures.
    pub total: Option<u64>,
    /// Bytes expected in this chunk; `None` when the tap decides.
    pub bytes: Option<u64>,
}

/// What [`Hardware::be_quiet`] silences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietOptions {
    /// Stop the DAC replaying its waveform.
    pub stop_dacs: bool,
    /// Power the IF board down.
    pub power_off_if: bool,
}

impl Default for QuietOptions {
    fn default() -> Self {
        Self {
            stop_dacs: true,
            power_off_if: false,
        }
    }
}

/// Instrument state reported with the scheduler status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareStatus {
    /// The DAC is replaying a waveform.
    pub dacs_replaying: bool,
    /// The IF board is powered.
    pub if_board_powered: bool,
    /// Hash of the last configuration applied since power-up or reset.
    pub applied: Option<ConfigHash>,
    /// Whether each tap's capture engine is idle.
    pub taps_ready: BTreeMap<Tap, bool>,
}

/// Capability: capture-capable readout instrument.
///
/// # Contract
/// - `apply_configuration` receives the full effective configuration every time
/// - `is_tap_ready` must not change instrument state
/// - `pull_chunk` returns `Ok(None)` when an open-ended stream has ended
/// - `release_tap_handle` is called once per capture that passed validation
/// - `reset` and `be_quiet` are only called while no capture is streaming, or right
///   after every running capture was told to stop
#[async_trait]
pub trait Hardware: Send + Sync {
    /// Puts the instrument into `effective`.
    async fn apply_configuration(&self, effective: &FeedlineConfig) -> Result<()>;

    /// True if the tap's capture engine is idle.
    async fn is_tap_ready(&self, tap: Tap) -> bool;

    /// Reads the next chunk from `tap`.
    async fn pull_chunk(&self, tap: Tap, request: &ChunkRequest) -> Result<Option<Bytes>>;

    /// Releases any driver-side state held for a capture on `tap`.
    async fn release_tap_handle(&self, tap: Tap);

    /// Reloads the programmable logic, restarts the clocks and power-cycles the IF
    /// board. Nothing is configured afterwards.
    async fn reset(&self) -> Result<()>;

    /// Silences the instrument's outputs.
    async fn be_quiet(&self, options: QuietOptions) -> Result<()>;

    /// Current instrument state.
    async fn status(&self) -> Result<HardwareStatus>;
}
