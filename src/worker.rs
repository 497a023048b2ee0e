//! Tap workers: one task per running capture.
//!
//! A worker owns its [`CaptureRequest`] for the whole run and is the only source of
//! its status events. It pulls bounded chunks from the [`Hardware`] and polls a private
//! cancellation channel between chunks, so cancellation latency is at most one chunk
//! transfer. A chunk already being pulled when the cancel arrives is still delivered.
//!
//! ```text
//! validate ─▶ establish ─▶ ┌─ poll cancel ─▶ pull ─▶ emit ─┐ ─▶ release ─▶ finish
//!                          └───────────────◀───────────────┘        │
//!                                                        abort | fail
//! ```

use crate::capture::{CaptureId, CaptureRequest, StatusKind};
use crate::error::{ReadoutError, ReadoutResult};
use crate::hardware::{ChunkRequest, Hardware};
use crate::tap::Tap;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Default chunk size cap for bulk taps (1 MiB).
pub const DEFAULT_CHUNK_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Message on a worker's private cancellation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelSignal {
    /// Reason reported in the `aborted` status.
    pub reason: String,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Capture served.
    pub id: CaptureId,
    /// Tap used.
    pub tap: Tap,
    /// Last status reached; `None` if the request could never be established.
    pub status: Option<StatusKind>,
    /// Chunks delivered to the client.
    pub chunks_delivered: u64,
}

/// Chunk layout of a bounded capture, computed without materialising the chunks.
///
/// Every chunk but the last holds `chunk` units; the last holds the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    count: u64,
    chunk: u64,
    last: u64,
}

impl ChunkPlan {
    /// Splits `total` units into chunks of at most `threshold` units.
    ///
    /// A zero threshold is treated as one unit.
    pub fn partition(total: u64, threshold: u64) -> Self {
        let threshold = threshold.max(1);
        match total % threshold {
            0 => Self {
                count: total / threshold,
                chunk: threshold,
                last: threshold,
            },
            partial => Self {
                count: total / threshold + 1,
                chunk: threshold,
                last: partial,
            },
        }
    }

    /// One chunk holding everything.
    pub fn single(total: u64) -> Self {
        Self {
            count: 1,
            chunk: total,
            last: total,
        }
    }

    /// The same layout measured in `unit`-sized pieces.
    ///
    /// Callers guarantee the scaled sizes fit in `u64`.
    fn scaled(self, unit: u64) -> Self {
        Self {
            count: self.count,
            chunk: self.chunk * unit,
            last: self.last * unit,
        }
    }

    /// Number of chunks.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Size of chunk `index`, or `None` past the end.
    pub fn size(&self, index: u64) -> Option<u64> {
        match index.checked_add(1) {
            Some(n) if n < self.count => Some(self.chunk),
            Some(n) if n == self.count => Some(self.last),
            _ => None,
        }
    }

    /// Chunk sizes in order.
    pub fn sizes(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count).filter_map(move |index| self.size(index))
    }
}

/// Drives one capture to completion.
pub struct TapWorker {
    request: CaptureRequest,
    hardware: Arc<dyn Hardware>,
    cancel_rx: mpsc::Receiver<CancelSignal>,
    chunk_threshold_bytes: u64,
    chunks_delivered: u64,
    holds_tap: bool,
}

impl TapWorker {
    /// Worker for `request`, cancellable through `cancel_rx`.
    pub fn new(
        request: CaptureRequest,
        hardware: Arc<dyn Hardware>,
        cancel_rx: mpsc::Receiver<CancelSignal>,
        chunk_threshold_bytes: u64,
    ) -> Self {
        Self {
            request,
            hardware,
            cancel_rx,
            chunk_threshold_bytes,
            chunks_delivered: 0,
            holds_tap: false,
        }
    }

    /// Byte layout of this capture, or `None` for open-ended taps.
    ///
    /// Chunks always hold whole samples. Postage captures are a single chunk.
    pub fn chunk_plan(&self) -> Option<ChunkPlan> {
        let per_sample = self.request.source().bytes_per_sample()?;
        let samples = self.request.samples();
        if self.request.tap() == Tap::Postage {
            return Some(ChunkPlan::single(samples).scaled(per_sample));
        }
        let samples_per_chunk = (self.chunk_threshold_bytes / per_sample).max(1);
        Some(ChunkPlan::partition(samples, samples_per_chunk).scaled(per_sample))
    }

    /// Runs the capture and reports how it ended.
    ///
    /// A panic anywhere in the capture, including inside the hardware driver, is
    /// caught here and reported to the client as `failed`.
    pub async fn run(mut self) -> WorkerOutcome {
        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;
        if let Err(panic) = result {
            let message = format!("capture task panicked: {}", panic_message(&*panic));
            error!(capture_id = %self.request.id(), error = %message, "Tap worker panicked");
            if self.holds_tap {
                self.release_tap().await;
            }
            if self.request.is_established() {
                if let Err(e) = self.request.fail(message).await {
                    warn!(capture_id = %self.request.id(), error = %e, "Failed to report failure");
                }
            }
        }
        self.outcome()
    }

    async fn drive(&mut self) {
        let tap = self.request.tap();

        let precondition = if self.hardware.is_tap_ready(tap).await {
            Ok(())
        } else {
            Err(format!("{} capture subsystem is busy", tap))
        };

        if let Err(e) = self.request.establish().await {
            error!(capture_id = %self.request.id(), error = %e, "Unable to establish capture, dropping request");
            return;
        }

        if let Err(reason) = precondition {
            error!(capture_id = %self.request.id(), %reason, "Capture precondition failed");
            if let Err(e) = self.request.fail(reason).await {
                warn!(capture_id = %self.request.id(), error = %e, "Failed to report failure");
            }
            return;
        }

        self.holds_tap = true;
        let result = self.stream(tap).await;

        // The tap must be free before the client sees a terminal status.
        self.release_tap().await;

        let reported = match result {
            Ok(()) => {
                info!(capture_id = %self.request.id(), chunks = self.chunks_delivered, "Capture finished");
                self.request.finish().await
            }
            Err(ReadoutError::Aborted(reason)) => {
                info!(capture_id = %self.request.id(), %reason, chunks = self.chunks_delivered, "Capture aborted");
                self.request.abort(reason).await
            }
            Err(e) => {
                error!(capture_id = %self.request.id(), error = %e, "Terminating capture");
                self.request.fail(e.to_string()).await
            }
        };
        if let Err(e) = reported {
            warn!(capture_id = %self.request.id(), error = %e, "Failed to report terminal status");
        }
    }

    async fn release_tap(&mut self) {
        self.holds_tap = false;
        let tap = self.request.tap();
        let result = AssertUnwindSafe(self.hardware.release_tap_handle(tap))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            error!(capture_id = %self.request.id(), %tap, error = %panic_message(&*panic), "Tap handle release panicked");
        }
    }

    async fn stream(&mut self, tap: Tap) -> ReadoutResult<()> {
        match self.chunk_plan() {
            Some(plan) => {
                let total = plan.count();
                debug!(capture_id = %self.request.id(), total, "Capture partitioned");
                for (index, bytes) in (0..total).zip(plan.sizes()) {
                    self.check_cancelled()?;
                    match self.pull(tap, index, Some(total), Some(bytes)).await? {
                        Some(data) => self.request.emit_data(data, index, Some(total)).await?,
                        None => {
                            return Err(ReadoutError::Hardware {
                                tap,
                                message: format!(
                                    "stream ended after {} of {} chunks",
                                    index, total
                                ),
                            })
                        }
                    }
                    self.chunks_delivered += 1;
                }
                Ok(())
            }
            None => {
                let mut index = 0;
                loop {
                    self.check_cancelled()?;
                    match self.pull(tap, index, None, None).await? {
                        Some(data) => self.request.emit_data(data, index, None).await?,
                        None => return Ok(()),
                    }
                    self.chunks_delivered += 1;
                    index += 1;
                }
            }
        }
    }

    async fn pull(
        &self,
        tap: Tap,
        index: u64,
        total: Option<u64>,
        bytes: Option<u64>,
    ) -> ReadoutResult<Option<bytes::Bytes>> {
        let chunk = ChunkRequest {
            id: self.request.id().clone(),
            source: self.request.source(),
            samples: self.request.samples(),
            index,
            total,
            bytes,
        };
        self.hardware
            .pull_chunk(tap, &chunk)
            .await
            .map_err(|e| ReadoutError::Hardware {
                tap,
                message: e.to_string(),
            })
    }

    fn check_cancelled(&mut self) -> ReadoutResult<()> {
        match self.cancel_rx.try_recv() {
            Ok(signal) => Err(ReadoutError::Aborted(signal.reason)),
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => {
                Err(ReadoutError::Aborted("control loop closed".into()))
            }
        }
    }

    fn outcome(&self) -> WorkerOutcome {
        WorkerOutcome {
            id: self.request.id().clone(),
            tap: self.request.tap(),
            status: self.request.status(),
            chunks_delivered: self.chunks_delivered,
        }
    }
}

/// Text carried by a caught panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The scheduler's record of a running worker.
pub struct WorkerHandle {
    id: CaptureId,
    tap: Tap,
    cancel_tx: mpsc::Sender<CancelSignal>,
    handle: JoinHandle<WorkerOutcome>,
}

impl WorkerHandle {
    /// Spawns a worker task for `request`.
    pub fn spawn(
        request: CaptureRequest,
        hardware: Arc<dyn Hardware>,
        chunk_threshold_bytes: u64,
    ) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let id = request.id().clone();
        let tap = request.tap();
        let span = info_span!("tap_worker", capture_id = %id, %tap);
        let worker = TapWorker::new(request, hardware, cancel_rx, chunk_threshold_bytes);
        let handle = tokio::spawn(worker.run().instrument(span));
        Self {
            id,
            tap,
            cancel_tx,
            handle,
        }
    }

    /// Capture served by this worker.
    pub fn id(&self) -> &CaptureId {
        &self.id
    }

    /// Tap held by this worker.
    pub fn tap(&self) -> Tap {
        self.tap
    }

    /// Delivers a cancel signal. Returns false if the worker is already gone.
    ///
    /// A second cancel while one is pending is absorbed.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        match self.cancel_tx.try_send(CancelSignal {
            reason: reason.into(),
        }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Non-blocking liveness check.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker to end.
    pub async fn join(self) -> Result<WorkerOutcome, JoinError> {
        self.handle.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelTransport;
    use crate::feedline_config::FeedlineConfig;
    use crate::hardware::{HardwareStatus, QuietOptions, SimulatedInstrument};
    use crate::tap::TapSource;
    use tracing_test::traced_test;

    fn sizes(plan: ChunkPlan) -> Vec<u64> {
        plan.sizes().collect()
    }

    #[test]
    fn partition_keeps_remainder_last() {
        assert_eq!(sizes(ChunkPlan::partition(1000, 400)), vec![400, 400, 200]);
        assert_eq!(sizes(ChunkPlan::partition(800, 400)), vec![400, 400]);
        assert_eq!(sizes(ChunkPlan::partition(10, 400)), vec![10]);
        assert_eq!(ChunkPlan::partition(0, 400).count(), 0);
        assert_eq!(sizes(ChunkPlan::partition(3, 0)), vec![1, 1, 1]);
    }

    #[test]
    fn huge_captures_are_planned_lazily() {
        let plan = ChunkPlan::partition(1 << 50, 1 << 18);
        assert_eq!(plan.count(), 1 << 32);
        assert_eq!(plan.size(0), Some(1 << 18));
        assert_eq!(plan.size((1 << 32) - 1), Some(1 << 18));
        assert_eq!(plan.size(1 << 32), None);
        assert_eq!(plan.size(u64::MAX), None);

        let uneven = ChunkPlan::partition(u64::MAX, 1 << 20);
        assert_eq!(uneven.size(uneven.count() - 1), Some((1 << 20) - 1));
    }

    fn worker(source: TapSource, samples: u64, threshold: u64) -> TapWorker {
        let transport = Arc::new(ChannelTransport::new());
        let request =
            CaptureRequest::new(source, samples, FeedlineConfig::default(), transport).unwrap();
        let (_tx, rx) = mpsc::channel(1);
        TapWorker::new(request, Arc::new(SimulatedInstrument::new()), rx, threshold)
    }

    #[test]
    fn chunk_plan_holds_whole_samples() {
        // 4-byte ADC samples, 1600-byte cap: 400 samples per chunk.
        let plan = |w: TapWorker| w.chunk_plan().map(sizes);
        assert_eq!(
            plan(worker(TapSource::Adc, 1000, 1600)),
            Some(vec![1600, 1600, 800])
        );
        // Cap smaller than a sample still makes progress.
        assert_eq!(plan(worker(TapSource::Iq, 2, 16)), Some(vec![8192, 8192]));
        assert_eq!(plan(worker(TapSource::Postage, 10, 8)), Some(vec![40]));
        assert_eq!(plan(worker(TapSource::Photon, 10, 8)), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn busy_tap_fails_without_pulling() {
        let transport = Arc::new(ChannelTransport::new());
        let hardware = Arc::new(SimulatedInstrument::new());
        hardware.set_tap_ready(Tap::Postage, false);
        let request =
            CaptureRequest::new(TapSource::Postage, 4, FeedlineConfig::default(), transport)
                .unwrap();
        let (_tx, rx) = mpsc::channel(1);

        let outcome = TapWorker::new(request, hardware.clone(), rx, 1024).run().await;

        assert_eq!(outcome.status, Some(StatusKind::Failed));
        assert_eq!(hardware.pull_count(Tap::Postage), 0);
        assert_eq!(hardware.release_count(Tap::Postage), 0);
        assert!(logs_contain("postage capture subsystem is busy"));
    }

    #[tokio::test]
    async fn pending_cancel_aborts_before_first_pull() {
        let transport = Arc::new(ChannelTransport::new());
        let hardware = Arc::new(SimulatedInstrument::new());
        let request =
            CaptureRequest::new(TapSource::Adc, 100, FeedlineConfig::default(), transport)
                .unwrap();
        let (tx, rx) = mpsc::channel(1);
        tx.try_send(CancelSignal {
            reason: "operator".into(),
        })
        .unwrap();

        let outcome = TapWorker::new(request, hardware.clone(), rx, 40).run().await;

        assert_eq!(outcome.status, Some(StatusKind::Aborted));
        assert_eq!(outcome.chunks_delivered, 0);
        assert_eq!(hardware.release_count(Tap::Engineering), 1);
    }

    #[tokio::test]
    async fn pull_error_fails_the_capture() {
        let transport = Arc::new(ChannelTransport::new());
        let hardware = Arc::new(SimulatedInstrument::new());
        hardware.fail_pulls_after(Tap::Engineering, 1);
        let request =
            CaptureRequest::new(TapSource::Adc, 100, FeedlineConfig::default(), transport)
                .unwrap();
        let (_tx, rx) = mpsc::channel(1);

        let outcome = TapWorker::new(request, hardware.clone(), rx, 40).run().await;

        assert_eq!(outcome.status, Some(StatusKind::Failed));
        assert_eq!(outcome.chunks_delivered, 1);
        assert_eq!(hardware.release_count(Tap::Engineering), 1);
    }

    struct PanickingInstrument {
        releases: parking_lot::Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl Hardware for PanickingInstrument {
        async fn apply_configuration(&self, _effective: &FeedlineConfig) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_tap_ready(&self, _tap: Tap) -> bool {
            true
        }

        async fn pull_chunk(
            &self,
            _tap: Tap,
            _request: &ChunkRequest,
        ) -> anyhow::Result<Option<bytes::Bytes>> {
            panic!("DMA descriptor ring corrupted")
        }

        async fn release_tap_handle(&self, _tap: Tap) {
            *self.releases.lock() += 1;
        }

        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn be_quiet(&self, _options: QuietOptions) -> anyhow::Result<()> {
            Ok(())
        }

        async fn status(&self) -> anyhow::Result<HardwareStatus> {
            anyhow::bail!("not wired")
        }
    }

    #[tokio::test]
    async fn driver_panic_fails_the_capture() {
        let transport = Arc::new(ChannelTransport::new());
        let mut status = transport.subscribe_status();
        let hardware = Arc::new(PanickingInstrument {
            releases: parking_lot::Mutex::new(0),
        });
        let mut request =
            CaptureRequest::new(TapSource::Adc, 100, FeedlineConfig::default(), transport.clone())
                .unwrap();
        request.establish().await.unwrap();
        let id = request.id().clone();
        let (_tx, rx) = mpsc::channel(1);

        let outcome = TapWorker::new(request, hardware.clone(), rx, 40).run().await;

        assert_eq!(outcome.status, Some(StatusKind::Failed));
        assert_eq!(*hardware.releases.lock(), 1);
        assert!(!transport.is_open(&id));

        let mut last = None;
        while let Ok(event) = status.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.kind, StatusKind::Failed);
        assert!(last.message.contains("DMA descriptor ring corrupted"), "{}", last.message);
    }

    #[tokio::test]
    async fn open_ended_stream_finishes_when_drained() {
        let transport = Arc::new(ChannelTransport::new());
        let hardware = Arc::new(SimulatedInstrument::new().with_photon_chunks(3));
        let request =
            CaptureRequest::new(TapSource::Photon, 50, FeedlineConfig::default(), transport)
                .unwrap();
        let (_tx, rx) = mpsc::channel(1);

        let outcome = TapWorker::new(request, hardware, rx, 1024).run().await;

        assert_eq!(outcome.status, Some(StatusKind::Finished));
        assert_eq!(outcome.chunks_delivered, 3);
    }
}
