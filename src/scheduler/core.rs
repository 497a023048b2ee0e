use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureId, CaptureRequest, StatusKind};
use crate::config_manager::ConfigManager;
use crate::error::{ReadoutError, ReadoutResult};
use crate::hardware::{Hardware, QuietOptions};
use crate::settings::SchedulerSettings;
use crate::tap::Tap;
use crate::worker::{WorkerHandle, WorkerOutcome};

use super::{
    command::{AbortTarget, Command, HardwareReport, OutcomeCounts, SchedulerStatus},
    handle::SchedulerHandle,
    queue::{AdmissionQueue, Pending},
};

const ABORT_BY_ID: &str = "abort by id";
const ABORT_ALL: &str = "abort all";
const EXITING: &str = "scheduler exiting";
const APPLY_FAILURE: &str = "hardware configuration failure";
const RESETTING: &str = "instrument reset";
const QUIETING: &str = "instrument quieted";
const STATUS_UNDELIVERABLE: &str = "status could not be delivered";

/// Lifecycle of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Accepting and admitting captures.
    Running,
    /// Aborting everything and joining workers.
    Draining,
    /// Returned from [`Scheduler::run`].
    Stopped,
}

enum Intake {
    Command(Command),
    Empty,
    Closed,
}

enum Flow {
    Continue(Option<Pending>),
    Exit,
}

/// The control loop: sole owner of the queues, the tap table and the
/// [`ConfigManager`].
///
/// Each iteration reaps finished workers, takes at most one command, considers at
/// most one request for admission and otherwise waits briefly for the next command.
pub struct Scheduler {
    settings: SchedulerSettings,
    hardware: Arc<dyn Hardware>,
    configs: ConfigManager,
    queue: AdmissionQueue,
    running: BTreeMap<Tap, WorkerHandle>,
    outcomes: OutcomeCounts,
    commands: mpsc::Receiver<Command>,
    deferred: Option<Command>,
    state: LoopState,
    resets: u64,
}

impl Scheduler {
    /// Creates the loop and the handle that feeds it. Call [`run`](Self::run) to start.
    pub fn new(settings: SchedulerSettings, hardware: Arc<dyn Hardware>) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let scheduler = Self {
            settings,
            hardware,
            configs: ConfigManager::new(),
            queue: AdmissionQueue::new(),
            running: BTreeMap::new(),
            outcomes: OutcomeCounts::default(),
            commands: rx,
            deferred: None,
            state: LoopState::Running,
            resets: 0,
        };
        (scheduler, SchedulerHandle::new(tx))
    }

    /// Runs until an exit command, until every handle is dropped, or until the
    /// instrument fails to configure or reset.
    ///
    /// # Errors
    ///
    /// `ReadoutError::HardwareApply` after a failed apply and
    /// `ReadoutError::HardwareReset` after a failed reset. Every request known to the
    /// loop has been aborted and every worker joined by then.
    pub async fn run(mut self) -> ReadoutResult<()> {
        info!(
            idle_wait = ?self.settings.idle_wait,
            chunk_threshold_bytes = self.settings.chunk_threshold_bytes,
            "Scheduler loop starting"
        );

        while self.state == LoopState::Running {
            self.reap().await;

            let (received, flow) = match self.next_command() {
                Intake::Command(command) => (true, self.handle_command(command).await?),
                Intake::Closed => {
                    info!("Every scheduler handle dropped");
                    (true, Flow::Exit)
                }
                Intake::Empty => (false, Flow::Continue(None)),
            };

            let candidate = match flow {
                Flow::Exit => {
                    self.shutdown(EXITING).await;
                    break;
                }
                Flow::Continue(candidate) => candidate.or_else(|| self.queue.pop_fresh()),
            };

            let admitted = match candidate {
                Some(pending) => self.admit(pending).await?,
                None => false,
            };

            if !received && !admitted && self.queue.fresh_is_empty() {
                self.idle_wait().await;
            }
        }

        info!("Scheduler loop stopped");
        Ok(())
    }

    fn next_command(&mut self) -> Intake {
        if let Some(command) = self.deferred.take() {
            return Intake::Command(command);
        }
        match self.commands.try_recv() {
            Ok(command) => Intake::Command(command),
            Err(TryRecvError::Empty) => Intake::Empty,
            Err(TryRecvError::Disconnected) => Intake::Closed,
        }
    }

    async fn idle_wait(&mut self) {
        match timeout(self.settings.idle_wait, self.commands.recv()).await {
            Ok(Some(command)) => self.deferred = Some(command),
            // Closed channel is picked up by the next intake.
            Ok(None) | Err(_) => {}
        }
    }

    async fn handle_command(&mut self, command: Command) -> ReadoutResult<Flow> {
        debug!(command = command.name(), "Command received");
        // Reply senders are dropped silently when the caller stopped waiting.
        let flow = match command {
            Command::Capture(request) => Flow::Continue(self.intake(request).await),
            Command::Abort(AbortTarget::Id(id)) => {
                self.abort_by_id(&id).await;
                Flow::Continue(None)
            }
            Command::Abort(AbortTarget::All) => {
                self.abort_all(ABORT_ALL).await;
                Flow::Continue(None)
            }
            Command::Status { response } => {
                let _ = response.send(self.snapshot().await);
                Flow::Continue(None)
            }
            Command::Reset { response } => {
                if let Err(e) = self.reset().await {
                    let message = e.to_string();
                    let _ = response.send(Err(e));
                    self.state = LoopState::Stopped;
                    return Err(ReadoutError::HardwareReset(message));
                }
                let _ = response.send(Ok(()));
                Flow::Continue(None)
            }
            Command::BeQuiet { options, response } => {
                let _ = response.send(self.be_quiet(options).await);
                Flow::Continue(None)
            }
            Command::Exit => Flow::Exit,
        };
        Ok(flow)
    }

    /// Drains every request, then resets the instrument.
    async fn reset(&mut self) -> ReadoutResult<()> {
        info!(running = self.running.len(), queued = self.queue.len(), "Resetting instrument");
        self.drain(RESETTING).await;
        if let Err(e) = self.hardware.reset().await {
            let message = e.to_string();
            error!(error = %message, "Instrument reset failed, stopping");
            return Err(ReadoutError::HardwareReset(message));
        }
        self.resets += 1;
        info!(resets = self.resets, "Instrument reset");
        Ok(())
    }

    /// Aborts everything, then silences the instrument.
    async fn be_quiet(&mut self, options: QuietOptions) -> ReadoutResult<()> {
        self.abort_all(QUIETING).await;
        match self.hardware.be_quiet(options).await {
            Ok(()) => {
                info!(?options, "Instrument quieted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Unable to quiet instrument");
                Err(ReadoutError::HardwareControl(e.to_string()))
            }
        }
    }

    /// Connects, resolves and queues a new request. Returns the request to consider
    /// for admission this iteration, if any.
    async fn intake(&mut self, mut request: CaptureRequest) -> Option<Pending> {
        let id = request.id().clone();

        if self.configs.is_active(&id) {
            info!(capture_id = %id, "Duplicate of a running capture dropped");
            return None;
        }
        if let Some(existing) = self.queue.get_mut(&id) {
            info!(capture_id = %id, "Duplicate of a queued capture merged");
            if let Err(e) = existing
                .request
                .set_status(StatusKind::Queued, "duplicate submission merged")
                .await
            {
                warn!(capture_id = %id, error = %e, "Unable to report merge");
            }
            return None;
        }

        if let Err(e) = request.establish().await {
            error!(capture_id = %id, error = %e, "Unable to establish capture, dropping request");
            return None;
        }

        let config = match self.configs.resolve(request.config()) {
            Ok(config) => config,
            Err(e) => {
                warn!(capture_id = %id, error = %e, "Capture rejected");
                if let Err(e) = request.fail(e.to_string()).await {
                    warn!(capture_id = %id, error = %e, "Unable to report rejection");
                }
                return None;
            }
        };

        let mut pending = Pending::new(request, config);
        if self.queue.fresh_is_empty() {
            return Some(pending);
        }

        if let Err(e) = pending.request.set_status(StatusKind::Queued, "queued").await {
            error!(capture_id = %id, error = %e, "Unable to report queueing, dropping request");
            discard(&mut pending.request).await;
            return None;
        }
        self.queue.push_fresh(pending);
        self.queue.pop_fresh()
    }

    /// Admission check for one request. Returns true if a worker was started.
    async fn admit(&mut self, mut pending: Pending) -> ReadoutResult<bool> {
        let id = pending.id().clone();
        let tap = pending.request.tap();

        if let Some(holder) = self.running.get(&tap) {
            let reason = ReadoutError::TapBusy {
                tap,
                holder: holder.id().clone(),
            };
            self.defer(pending, reason).await;
            return Ok(false);
        }

        let effective = match self
            .configs
            .check(&pending.config)
            .and_then(|()| self.configs.add(id.clone(), pending.config.clone()))
        {
            Ok(effective) => effective,
            Err(reason) if reason.is_queueable() => {
                self.defer(pending, reason).await;
                return Ok(false);
            }
            Err(e) => {
                error!(capture_id = %id, error = %e, "Capture rejected at admission");
                if let Err(e) = pending.request.fail(e.to_string()).await {
                    warn!(capture_id = %id, error = %e, "Unable to report rejection");
                }
                return Ok(false);
            }
        };

        if let Err(e) = self.hardware.apply_configuration(&effective).await {
            let message = e.to_string();
            error!(capture_id = %id, error = %message, "Hardware configuration failed, aborting all requests");
            self.state = LoopState::Draining;
            if let Err(e) = pending.request.abort(APPLY_FAILURE).await {
                warn!(capture_id = %id, error = %e, "Unable to report abort");
            }
            self.shutdown(APPLY_FAILURE).await;
            return Err(ReadoutError::HardwareApply(message));
        }

        let started = format!("started at {} UTC", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"));
        if let Err(e) = pending.request.set_status(StatusKind::Running, started).await {
            error!(capture_id = %id, error = %e, "Unable to report start, dropping request");
            discard(&mut pending.request).await;
            if self.configs.release(&id) {
                self.queue.requeue_stale();
            }
            return Ok(false);
        }

        info!(capture_id = %id, %tap, effective = %effective.config_hash().short(), "Capture admitted");
        let worker = WorkerHandle::spawn(
            pending.request,
            self.hardware.clone(),
            self.settings.chunk_threshold_bytes,
        );
        self.running.insert(tap, worker);
        Ok(true)
    }

    /// Parks a request in the stale queue with the reason it could not run.
    async fn defer(&mut self, mut pending: Pending, reason: ReadoutError) {
        let id = pending.id().clone();
        debug!(capture_id = %id, %reason, "Capture deferred");
        match pending
            .request
            .set_status(StatusKind::Queued, reason.to_string())
            .await
        {
            Ok(()) => self.queue.push_stale(pending),
            Err(e) => {
                error!(capture_id = %id, error = %e, "Unable to report queueing, dropping request");
                discard(&mut pending.request).await;
            }
        }
    }

    /// Collects finished workers and frees their taps and configuration.
    async fn reap(&mut self) {
        let finished: Vec<Tap> = self
            .running
            .iter()
            .filter(|(_, worker)| worker.is_finished())
            .map(|(tap, _)| *tap)
            .collect();
        if finished.is_empty() {
            return;
        }

        let mut effective_changed = false;
        for tap in finished {
            if let Some(worker) = self.running.remove(&tap) {
                effective_changed |= self.collect(worker).await;
            }
        }

        // A freed tap is as much a reason to re-check as a configuration change.
        let moved = self.queue.requeue_stale();
        debug!(moved, effective_changed, "Workers reaped");
    }

    /// Joins one worker, records its outcome and releases its configuration.
    ///
    /// Returns true iff the effective configuration changed.
    async fn collect(&mut self, worker: WorkerHandle) -> bool {
        let id = worker.id().clone();
        match worker.join().await {
            Ok(outcome) => self.record(&outcome),
            Err(e) => {
                error!(capture_id = %id, error = %e, "Tap worker panicked");
                self.outcomes.failed += 1;
            }
        }
        self.configs.release(&id)
    }

    fn record(&mut self, outcome: &WorkerOutcome) {
        debug!(capture_id = %outcome.id, tap = %outcome.tap, status = ?outcome.status, chunks = outcome.chunks_delivered, "Worker ended");
        match outcome.status {
            Some(StatusKind::Finished) => self.outcomes.finished += 1,
            Some(StatusKind::Aborted) => self.outcomes.aborted += 1,
            _ => self.outcomes.failed += 1,
        }
    }

    async fn abort_by_id(&mut self, id: &CaptureId) {
        let mut found = false;

        if let Some(worker) = self.running.values().find(|w| w.id() == id) {
            debug!(capture_id = %id, tap = %worker.tap(), "Signalling running capture");
            worker.cancel(ABORT_BY_ID);
            found = true;
        }

        if let Some(mut pending) = self.queue.remove(id) {
            debug!(capture_id = %id, "Aborting queued capture");
            if let Err(e) = pending.request.abort(ABORT_BY_ID).await {
                warn!(capture_id = %id, error = %e, "Unable to report abort");
            }
            found = true;
        }

        if !found {
            info!(capture_id = %id, "Capture is unknown and cannot be aborted");
        }
    }

    /// Aborts every queued request and signals every running worker.
    async fn abort_all(&mut self, reason: &str) {
        for mut pending in self.queue.drain() {
            if let Err(e) = pending.request.abort(reason).await {
                warn!(capture_id = %pending.id(), error = %e, "Unable to report abort");
            }
        }
        for worker in self.running.values() {
            worker.cancel(reason);
        }
    }

    /// Aborts everything, waits for every worker to end and stops the loop.
    async fn shutdown(&mut self, reason: &str) {
        self.state = LoopState::Draining;
        self.drain(reason).await;
        self.state = LoopState::Stopped;
    }

    /// Aborts everything and waits for every worker to end.
    async fn drain(&mut self, reason: &str) {
        info!(reason, running = self.running.len(), queued = self.queue.len(), "Draining");
        self.abort_all(reason).await;

        let workers = std::mem::take(&mut self.running);
        let ids: Vec<CaptureId> = workers.values().map(|w| w.id().clone()).collect();
        let results = join_all(workers.into_values().map(WorkerHandle::join)).await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(outcome) => self.record(&outcome),
                Err(e) => {
                    error!(capture_id = %id, error = %e, "Tap worker panicked");
                    self.outcomes.failed += 1;
                }
            }
            self.configs.release(&id);
        }
    }

    async fn snapshot(&self) -> SchedulerStatus {
        let hardware = match self.hardware.status().await {
            Ok(status) => HardwareReport::Available(status),
            Err(e) => HardwareReport::Unavailable {
                error: e.to_string(),
            },
        };
        SchedulerStatus {
            running: self
                .running
                .iter()
                .map(|(tap, worker)| (*tap, worker.id().clone()))
                .collect(),
            pending: self.queue.ids(),
            effective_hash: self.configs.required_effective().config_hash(),
            learned_configs: self.configs.learned_count(),
            outcomes: self.outcomes,
            resets: self.resets,
            hardware,
        }
    }
}

/// Ends a request whose status could not be published, closing its channels.
async fn discard(request: &mut CaptureRequest) {
    if let Err(e) = request.fail(STATUS_UNDELIVERABLE).await {
        debug!(capture_id = %request.id(), error = %e, "Terminal status not delivered either");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelTransport, DataChunk, StatusEvent, Transport};
    use crate::feedline_config::{FeedlineConfig, IfSetup};
    use crate::hardware::SimulatedInstrument;
    use crate::tap::TapSource;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Channel transport whose status channel rejects `queued` events.
    struct QueuedUndeliverable {
        inner: ChannelTransport,
    }

    #[async_trait]
    impl Transport for QueuedUndeliverable {
        async fn connect_status_channel(&self, id: &CaptureId) -> anyhow::Result<()> {
            self.inner.connect_status_channel(id).await
        }

        async fn connect_data_channel(&self, id: &CaptureId) -> anyhow::Result<()> {
            self.inner.connect_data_channel(id).await
        }

        async fn publish_status(&self, event: StatusEvent) -> anyhow::Result<()> {
            if event.kind == StatusKind::Queued {
                anyhow::bail!("status socket for {} reset by peer", event.id);
            }
            self.inner.publish_status(event).await
        }

        async fn publish_data(&self, chunk: DataChunk) -> anyhow::Result<()> {
            self.inner.publish_data(chunk).await
        }

        async fn close(&self, id: &CaptureId) {
            self.inner.close(id).await
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            idle_wait: Duration::from_millis(2),
            command_capacity: 16,
            chunk_threshold_bytes: 64,
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<StatusEvent>,
        id: &CaptureId,
        kind: StatusKind,
    ) -> StatusEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if &event.id == id && event.kind == kind {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn exit_with_nothing_running_stops_cleanly() {
        let hardware = Arc::new(SimulatedInstrument::new());
        let (scheduler, handle) = Scheduler::new(settings(), hardware);
        let task = tokio::spawn(scheduler.run());
        handle.shutdown().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_loop() {
        let hardware = Arc::new(SimulatedInstrument::new());
        let (scheduler, handle) = Scheduler::new(settings(), hardware);
        let task = tokio::spawn(scheduler.run());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unknown_reference_fails_without_queueing() {
        let transport = Arc::new(ChannelTransport::new());
        let mut status = transport.subscribe_status();
        let hardware = Arc::new(SimulatedInstrument::new());
        let (scheduler, handle) = Scheduler::new(settings(), hardware.clone());
        let task = tokio::spawn(scheduler.run());

        let taught = FeedlineConfig::default().with_if_board(IfSetup::new(6000.0, 1.0, 1.0));
        let request = CaptureRequest::new(
            TapSource::Postage,
            8,
            taught.config_hash(),
            transport.clone(),
        )
        .unwrap();
        let id = request.id().clone();
        handle.submit(request).await.unwrap();

        let failed = wait_for(&mut status, &id, StatusKind::Failed).await;
        assert!(failed.message.contains("unknown"));

        let snapshot = handle.status().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert!(hardware.applied_configs().is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_reports_taught_configs_and_outcomes() {
        let transport = Arc::new(ChannelTransport::new());
        let mut status = transport.subscribe_status();
        let hardware = Arc::new(SimulatedInstrument::new());
        let (scheduler, handle) = Scheduler::new(settings(), hardware);
        let task = tokio::spawn(scheduler.run());

        let config = FeedlineConfig::default().with_if_board(IfSetup::new(5500.0, 2.0, 2.0));
        let request =
            CaptureRequest::new(TapSource::Adc, 32, config.clone(), transport.clone()).unwrap();
        let id = request.id().clone();
        handle.submit(request).await.unwrap();
        wait_for(&mut status, &id, StatusKind::Finished).await;

        // Reaping happens on the next loop iteration.
        let snapshot = loop {
            let snapshot = handle.status().await.unwrap();
            if snapshot.outcomes.finished == 1 {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        assert!(snapshot.running.is_empty());
        assert_eq!(snapshot.learned_configs, 1);
        assert_eq!(snapshot.effective_hash, FeedlineConfig::default().config_hash());

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn undeliverable_queue_status_closes_channels() {
        let transport = Arc::new(QueuedUndeliverable {
            inner: ChannelTransport::new(),
        });
        let mut status = transport.inner.subscribe_status();
        let hardware =
            Arc::new(SimulatedInstrument::new().with_chunk_delay(Duration::from_millis(10)));
        let (scheduler, handle) = Scheduler::new(settings(), hardware);
        let task = tokio::spawn(scheduler.run());

        let config = FeedlineConfig::default();
        let running =
            CaptureRequest::new(TapSource::Adc, 64, config.clone(), transport.clone()).unwrap();
        let running_id = running.id().clone();
        handle.submit(running).await.unwrap();
        wait_for(&mut status, &running_id, StatusKind::Running).await;

        // Same tap, so it has to wait and its queued status cannot be delivered.
        let blocked = CaptureRequest::new(TapSource::Iq, 1, config, transport.clone()).unwrap();
        let blocked_id = blocked.id().clone();
        handle.submit(blocked).await.unwrap();

        let snapshot = handle.status().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert!(!transport.inner.is_open(&blocked_id));
        assert!(transport.inner.is_open(&running_id));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_carries_hardware_report() {
        let hardware = Arc::new(SimulatedInstrument::new());
        let (scheduler, handle) = Scheduler::new(settings(), hardware.clone());
        let task = tokio::spawn(scheduler.run());

        let snapshot = handle.status().await.unwrap();
        assert_eq!(snapshot.resets, 0);
        match snapshot.hardware {
            HardwareReport::Available(report) => {
                assert!(report.applied.is_none());
                assert!(report.if_board_powered);
                assert_eq!(report.taps_ready.len(), Tap::ALL.len());
            }
            other => panic!("expected hardware status, got {:?}", other),
        }

        hardware.set_status_error(Some("register bus timeout"));
        assert!(matches!(
            handle.status().await.unwrap().hardware,
            HardwareReport::Unavailable { error } if error == "register bus timeout"
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
