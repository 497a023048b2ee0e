//! Simulated Instrument
//!
//! Stands in for the FPGA overlay when no programmable logic is present (laptops, CI).
//! Every capture returns random 16-bit samples of the requested size. All timing uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! Failure injection hooks let tests exercise the scheduler's error paths:
//!
//! - [`SimulatedInstrument::fail_next_apply`] - the next configuration apply fails
//! - [`SimulatedInstrument::fail_pulls_after`] - a tap starts erroring after N pulls
//! - [`SimulatedInstrument::set_tap_ready`] - a tap reports itself busy
//! - [`SimulatedInstrument::fail_next_reset`] - the next reset fails
//! - [`SimulatedInstrument::set_status_error`] - status queries fail
//!
//! Counters record every apply, pull, handle release and reset for assertions.
//! Chunks larger than the simulated DMA buffer are refused rather than allocated.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::feedline_config::{ConfigHash, FeedlineConfig};
use crate::hardware::{ChunkRequest, Hardware, HardwareStatus, QuietOptions};
use crate::tap::Tap;

/// Bytes per photon chunk.
const PHOTON_CHUNK_BYTES: usize = 4096;

/// Largest single transfer the simulated DMA engine accepts (256 MiB).
const MAX_TRANSFER_BYTES: usize = 256 * 1024 * 1024;

struct SimState {
    rng: StdRng,
    applied: Vec<FeedlineConfig>,
    current: Option<ConfigHash>,
    dacs_replaying: bool,
    if_board_powered: bool,
    fail_next_apply: bool,
    fail_next_reset: bool,
    status_error: Option<String>,
    not_ready: HashSet<Tap>,
    pull_failures: HashMap<Tap, usize>,
    pulls: HashMap<Tap, usize>,
    releases: HashMap<Tap, usize>,
    resets: usize,
}

/// Simulated readout instrument.
///
/// # Example
///
/// ```rust,ignore
/// let instrument = SimulatedInstrument::new().with_chunk_delay(Duration::from_millis(5));
/// instrument.fail_pulls_after(Tap::Engineering, 2);
/// ```
pub struct SimulatedInstrument {
    state: Mutex<SimState>,
    chunk_delay: Duration,
    photon_chunks: Option<u64>,
}

impl SimulatedInstrument {
    /// Instrument with no chunk delay and an endless photon stream.
    pub fn new() -> Self {
        Self::with_seed(0x6d6b_6964)
    }

    /// Instrument whose random data is reproducible from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                applied: Vec::new(),
                current: None,
                dacs_replaying: false,
                if_board_powered: true,
                fail_next_apply: false,
                fail_next_reset: false,
                status_error: None,
                not_ready: HashSet::new(),
                pull_failures: HashMap::new(),
                pulls: HashMap::new(),
                releases: HashMap::new(),
                resets: 0,
            }),
            chunk_delay: Duration::ZERO,
            photon_chunks: None,
        }
    }

    /// Simulated transfer time per chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Photon streams end after `chunks` chunks instead of running until stopped.
    pub fn with_photon_chunks(mut self, chunks: u64) -> Self {
        self.photon_chunks = Some(chunks);
        self
    }

    /// Makes the next `apply_configuration` call fail.
    pub fn fail_next_apply(&self) {
        self.state.lock().fail_next_apply = true;
    }

    /// Makes pulls on `tap` fail once `after` more pulls have succeeded.
    pub fn fail_pulls_after(&self, tap: Tap, after: usize) {
        self.state.lock().pull_failures.insert(tap, after);
    }

    /// Makes the next `reset` call fail.
    pub fn fail_next_reset(&self) {
        self.state.lock().fail_next_reset = true;
    }

    /// Makes status queries fail with `error`, or succeed again with `None`.
    pub fn set_status_error(&self, error: Option<&str>) {
        self.state.lock().status_error = error.map(str::to_string);
    }

    /// Marks a tap's capture engine as idle or busy.
    pub fn set_tap_ready(&self, tap: Tap, ready: bool) {
        let mut state = self.state.lock();
        if ready {
            state.not_ready.remove(&tap);
        } else {
            state.not_ready.insert(tap);
        }
    }

    /// Every configuration applied so far, oldest first.
    pub fn applied_configs(&self) -> Vec<FeedlineConfig> {
        self.state.lock().applied.clone()
    }

    /// Successful and failed pulls on `tap`.
    pub fn pull_count(&self, tap: Tap) -> usize {
        self.state.lock().pulls.get(&tap).copied().unwrap_or(0)
    }

    /// Handle releases on `tap`.
    pub fn release_count(&self, tap: Tap) -> usize {
        self.state.lock().releases.get(&tap).copied().unwrap_or(0)
    }

    /// Successful resets.
    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    fn random_bytes(&self, len: usize) -> Bytes {
        let mut buf = vec![0u8; len];
        self.state.lock().rng.fill_bytes(&mut buf);
        Bytes::from(buf)
    }
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hardware for SimulatedInstrument {
    async fn apply_configuration(&self, effective: &FeedlineConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_apply {
            state.fail_next_apply = false;
            return Err(anyhow!("DAC replay did not acknowledge configuration"));
        }
        let hash = effective.config_hash();
        debug!(config_hash = %hash.short(), "SimulatedInstrument: configuration applied");
        state.applied.push(effective.clone());
        state.current = Some(hash);
        state.dacs_replaying = effective.dac.is_some();
        if effective.if_board.is_some() {
            state.if_board_powered = true;
        }
        Ok(())
    }

    async fn is_tap_ready(&self, tap: Tap) -> bool {
        !self.state.lock().not_ready.contains(&tap)
    }

    async fn pull_chunk(&self, tap: Tap, request: &ChunkRequest) -> Result<Option<Bytes>> {
        {
            let mut state = self.state.lock();
            *state.pulls.entry(tap).or_insert(0) += 1;
            if let Some(remaining) = state.pull_failures.get_mut(&tap) {
                if *remaining == 0 {
                    return Err(anyhow!("DMA transfer on {} tap timed out", tap));
                }
                *remaining -= 1;
            }
        }

        if !self.chunk_delay.is_zero() {
            sleep(self.chunk_delay).await;
        }

        let len = match (tap, request.bytes) {
            (Tap::Photon, _) => {
                if self.photon_chunks.is_some_and(|limit| request.index >= limit) {
                    trace!(capture_id = %request.id, "SimulatedInstrument: photon stream drained");
                    return Ok(None);
                }
                PHOTON_CHUNK_BYTES
            }
            (_, Some(bytes)) => match usize::try_from(bytes) {
                Ok(len) if len <= MAX_TRANSFER_BYTES => len,
                _ => {
                    return Err(anyhow!(
                        "{} byte transfer on {} tap exceeds the DMA buffer",
                        bytes,
                        tap
                    ))
                }
            },
            (_, None) => return Err(anyhow!("{} tap needs a bounded chunk size", tap)),
        };
        Ok(Some(self.random_bytes(len)))
    }

    async fn release_tap_handle(&self, tap: Tap) {
        *self.state.lock().releases.entry(tap).or_insert(0) += 1;
        trace!(%tap, "SimulatedInstrument: tap handle released");
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_reset {
            state.fail_next_reset = false;
            return Err(anyhow!("bitstream download failed"));
        }
        state.current = None;
        state.dacs_replaying = false;
        state.if_board_powered = true;
        state.not_ready.clear();
        state.resets += 1;
        debug!(resets = state.resets, "SimulatedInstrument: reset");
        Ok(())
    }

    async fn be_quiet(&self, options: QuietOptions) -> Result<()> {
        let mut state = self.state.lock();
        if options.stop_dacs {
            state.dacs_replaying = false;
        }
        if options.power_off_if {
            state.if_board_powered = false;
        }
        debug!(?options, "SimulatedInstrument: quiet");
        Ok(())
    }

    async fn status(&self) -> Result<HardwareStatus> {
        let state = self.state.lock();
        if let Some(error) = &state.status_error {
            return Err(anyhow!("{}", error));
        }
        Ok(HardwareStatus {
            dacs_replaying: state.dacs_replaying,
            if_board_powered: state.if_board_powered,
            applied: state.current,
            taps_ready: Tap::ALL
                .iter()
                .map(|tap| (*tap, !state.not_ready.contains(tap)))
                .collect(),
        })
    }
}
