//! The capture request entity and its status state machine.

use super::{CaptureId, DataChunk, StatusEvent, StatusKind, Transport};
use crate::error::{ReadoutError, ReadoutResult};
use crate::feedline_config::ConfigSource;
use crate::tap::{Tap, TapSource};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One acquisition: what to capture, in which configuration, and where to report.
///
/// The request is owned by exactly one party at a time: the scheduler while it is
/// waiting, the worker while it runs. Whoever owns it is the only source of its status
/// events, which keeps the stream totally ordered.
pub struct CaptureRequest {
    id: CaptureId,
    source: TapSource,
    samples: u64,
    config: ConfigSource,
    status: Option<StatusKind>,
    established: bool,
    has_run: bool,
    sequence: u64,
    transport: Arc<dyn Transport>,
}

impl CaptureRequest {
    /// Creates a request. Nothing is connected until [`establish`](Self::establish).
    ///
    /// # Errors
    ///
    /// `ReadoutError::Validation` for a zero sample count, for a byte size that does
    /// not fit in `u64`, or for a configuration holding non-finite values.
    pub fn new(
        source: TapSource,
        samples: u64,
        config: impl Into<ConfigSource>,
        transport: Arc<dyn Transport>,
    ) -> ReadoutResult<Self> {
        if samples == 0 {
            return Err(ReadoutError::Validation(
                "sample count must be positive".into(),
            ));
        }
        if let Some(per_sample) = source.bytes_per_sample() {
            if per_sample.checked_mul(samples).is_none() {
                return Err(ReadoutError::Validation(format!(
                    "{} samples of {} exceed the addressable capture size",
                    samples, source
                )));
            }
        }
        let config = config.into();
        if let ConfigSource::Full(full) = &config {
            full.validate()?;
        }
        let id = CaptureId::derive(source, samples, &config.hash());
        Ok(Self {
            id,
            source,
            samples,
            config,
            status: None,
            established: false,
            has_run: false,
            sequence: 0,
            transport,
        })
    }

    /// Stable identity.
    pub fn id(&self) -> &CaptureId {
        &self.id
    }

    /// Requested source.
    pub fn source(&self) -> TapSource {
        self.source
    }

    /// Physical tap the request needs.
    pub fn tap(&self) -> Tap {
        self.source.tap()
    }

    /// Requested sample count.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Required configuration as submitted.
    pub fn config(&self) -> &ConfigSource {
        &self.config
    }

    /// Current status; `None` until established.
    pub fn status(&self) -> Option<StatusKind> {
        self.status
    }

    /// True once output channels are connected and not yet closed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// True once finished, failed or aborted.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(StatusKind::is_terminal)
    }

    /// Total bytes the capture will produce; `None` for open-ended sources.
    pub fn size_bytes(&self) -> Option<u64> {
        // Checked in `new`.
        self.source
            .bytes_per_sample()
            .map(|per_sample| per_sample * self.samples)
    }

    /// Connects the status and data channels and reports `established`.
    ///
    /// Calling it again on an established request does nothing.
    ///
    /// # Errors
    ///
    /// `ReadoutError::Channel` if either channel cannot be connected. Channels opened
    /// before the failure are closed again.
    pub async fn establish(&mut self) -> ReadoutResult<()> {
        if self.established {
            return Ok(());
        }
        if self.is_terminal() {
            return Err(ReadoutError::AlreadyTerminal(self.id.clone()));
        }

        let connected = match self.transport.connect_status_channel(&self.id).await {
            Ok(()) => self.transport.connect_data_channel(&self.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = connected {
            self.transport.close(&self.id).await;
            return Err(ReadoutError::Channel {
                id: self.id.clone(),
                message: e.to_string(),
            });
        }

        self.established = true;
        if self.status.is_none() {
            self.set_status(StatusKind::Established, "").await?;
        }
        Ok(())
    }

    /// Publishes one chunk of data followed by a `capturing` progress event.
    ///
    /// # Errors
    ///
    /// - `ReadoutError::NotEstablished` before [`establish`](Self::establish)
    /// - `ReadoutError::Channel` if the transport rejects the data
    pub async fn emit_data(
        &mut self,
        payload: Bytes,
        index: u64,
        total: Option<u64>,
    ) -> ReadoutResult<()> {
        self.ensure_open()?;
        let chunk = DataChunk {
            id: self.id.clone(),
            index,
            total,
            payload,
        };
        self.transport
            .publish_data(chunk)
            .await
            .map_err(|e| ReadoutError::Channel {
                id: self.id.clone(),
                message: e.to_string(),
            })?;

        let progress = match total {
            Some(n) => format!("chunk {} of {}", index + 1, n),
            None => format!("chunk {}", index + 1),
        };
        self.set_status(StatusKind::Capturing, progress).await
    }

    /// Records and publishes a status transition.
    ///
    /// Terminal kinds close the output channels after publishing, even if publishing
    /// failed.
    ///
    /// # Errors
    ///
    /// - `ReadoutError::NotEstablished` before [`establish`](Self::establish)
    /// - `ReadoutError::AlreadyTerminal` after a terminal transition
    /// - `ReadoutError::InvalidTransition` for a second `running`
    /// - `ReadoutError::Channel` if the transport rejects the event
    pub async fn set_status(
        &mut self,
        kind: StatusKind,
        message: impl Into<String>,
    ) -> ReadoutResult<()> {
        self.ensure_open()?;
        if kind == StatusKind::Running {
            if self.has_run {
                return Err(ReadoutError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status_label(),
                    to: kind,
                });
            }
            self.has_run = true;
        }

        let message = message.into();
        debug!(capture_id = %self.id, status = %kind, %message, "Status");
        let event = StatusEvent {
            id: self.id.clone(),
            sequence: self.sequence,
            kind,
            message,
        };
        self.sequence += 1;
        self.status = Some(kind);

        let published = self
            .transport
            .publish_status(event)
            .await
            .map_err(|e| ReadoutError::Channel {
                id: self.id.clone(),
                message: e.to_string(),
            });

        if kind.is_terminal() {
            self.transport.close(&self.id).await;
            self.established = false;
        }
        published
    }

    /// Terminal success.
    pub async fn finish(&mut self) -> ReadoutResult<()> {
        self.set_status(StatusKind::Finished, "").await
    }

    /// Terminal failure with a reason.
    pub async fn fail(&mut self, reason: impl Into<String>) -> ReadoutResult<()> {
        self.set_status(StatusKind::Failed, reason).await
    }

    /// Terminal cancellation with a reason.
    pub async fn abort(&mut self, reason: impl Into<String>) -> ReadoutResult<()> {
        self.set_status(StatusKind::Aborted, reason).await
    }

    fn ensure_open(&self) -> ReadoutResult<()> {
        if self.is_terminal() {
            return Err(ReadoutError::AlreadyTerminal(self.id.clone()));
        }
        if !self.established {
            return Err(ReadoutError::NotEstablished(self.id.clone()));
        }
        Ok(())
    }

    fn status_label(&self) -> String {
        self.status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "created".to_string())
    }
}

impl fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("samples", &self.samples)
            .field("config", &self.config.hash())
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for CaptureRequest {
    fn drop(&mut self) {
        if self.established && !self.is_terminal() {
            warn!(capture_id = %self.id, status = %self.status_label(), "Capture dropped without a terminal status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChannelTransport;
    use crate::feedline_config::{FeedlineConfig, IfSetup};
    use crate::tap::N_CHANNELS;

    fn request(transport: &Arc<ChannelTransport>) -> CaptureRequest {
        let config = FeedlineConfig::default().with_if_board(IfSetup::new(6000.0, 0.0, 0.0));
        CaptureRequest::new(TapSource::Adc, 1000, config, transport.clone()).unwrap()
    }

    #[test]
    fn zero_samples_is_rejected() {
        let transport = Arc::new(ChannelTransport::new());
        let result = CaptureRequest::new(
            TapSource::Adc,
            0,
            FeedlineConfig::default(),
            transport,
        );
        assert!(matches!(result, Err(ReadoutError::Validation(_))));
    }

    #[test]
    fn oversized_capture_is_rejected() {
        let transport = Arc::new(ChannelTransport::new());
        let postage = CaptureRequest::new(
            TapSource::Postage,
            u64::MAX / 2,
            FeedlineConfig::default(),
            transport.clone(),
        );
        assert!(matches!(postage, Err(ReadoutError::Validation(_))));

        let iq = CaptureRequest::new(
            TapSource::Iq,
            u64::MAX / (N_CHANNELS * 4) + 1,
            FeedlineConfig::default(),
            transport.clone(),
        );
        assert!(matches!(iq, Err(ReadoutError::Validation(_))));

        // Photon counts are buffer times, not byte sizes.
        assert!(CaptureRequest::new(
            TapSource::Photon,
            u64::MAX,
            FeedlineConfig::default(),
            transport,
        )
        .is_ok());
    }

    #[test]
    fn non_finite_configuration_is_rejected() {
        let transport = Arc::new(ChannelTransport::new());
        let config = FeedlineConfig::default().with_if_board(IfSetup::new(f64::NAN, 0.0, 0.0));
        let result = CaptureRequest::new(TapSource::Adc, 10, config, transport);
        assert!(matches!(result, Err(ReadoutError::Validation(_))));
    }

    #[test]
    fn signed_zero_configs_share_an_id() {
        let transport = Arc::new(ChannelTransport::new());
        let with = |lo: f64| {
            let config = FeedlineConfig::default().with_if_board(IfSetup::new(lo, 0.0, 0.0));
            CaptureRequest::new(TapSource::Adc, 10, config, transport.clone()).unwrap()
        };
        assert_eq!(with(0.0).id(), with(-0.0).id());
    }

    #[tokio::test]
    async fn emit_before_establish_fails() {
        let transport = Arc::new(ChannelTransport::new());
        let mut cr = request(&transport);
        let result = cr.emit_data(Bytes::from_static(b"1234"), 0, Some(1)).await;
        assert!(matches!(result, Err(ReadoutError::NotEstablished(_))));
        assert!(matches!(
            cr.set_status(StatusKind::Queued, "").await,
            Err(ReadoutError::NotEstablished(_))
        ));
    }

    #[tokio::test]
    async fn establish_is_idempotent() {
        let transport = Arc::new(ChannelTransport::new());
        let mut rx = transport.subscribe_status();
        let mut cr = request(&transport);

        cr.establish().await.unwrap();
        cr.establish().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, StatusKind::Established);
        assert!(rx.try_recv().is_err(), "second establish must not publish");
    }

    #[tokio::test]
    async fn establish_failure_is_channel_error() {
        let transport = Arc::new(ChannelTransport::new());
        let mut cr = request(&transport);
        transport.refuse(cr.id().clone());
        assert!(matches!(
            cr.establish().await,
            Err(ReadoutError::Channel { .. })
        ));
        assert!(!cr.is_established());
    }

    #[tokio::test]
    async fn emit_data_reports_progress() {
        let transport = Arc::new(ChannelTransport::new());
        let mut status = transport.subscribe_status();
        let mut data = transport.subscribe_data();
        let mut cr = request(&transport);
        cr.establish().await.unwrap();

        cr.emit_data(Bytes::from_static(b"abcd"), 1, Some(3))
            .await
            .unwrap();

        let chunk = data.recv().await.unwrap();
        assert_eq!(chunk.index, 1);
        assert_eq!(&chunk.payload[..], b"abcd");

        let _established = status.recv().await.unwrap();
        let progress = status.recv().await.unwrap();
        assert_eq!(progress.kind, StatusKind::Capturing);
        assert_eq!(progress.message, "chunk 2 of 3");
        assert_eq!(progress.sequence, 1);
    }

    #[tokio::test]
    async fn terminal_transition_closes_channels_once() {
        let transport = Arc::new(ChannelTransport::new());
        let mut cr = request(&transport);
        cr.establish().await.unwrap();
        assert!(transport.is_open(cr.id()));

        cr.finish().await.unwrap();
        assert!(!transport.is_open(cr.id()));
        assert!(cr.is_terminal());
        assert!(matches!(
            cr.abort("late").await,
            Err(ReadoutError::AlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn running_happens_at_most_once() {
        let transport = Arc::new(ChannelTransport::new());
        let mut cr = request(&transport);
        cr.establish().await.unwrap();
        cr.set_status(StatusKind::Running, "").await.unwrap();
        assert!(matches!(
            cr.set_status(StatusKind::Running, "").await,
            Err(ReadoutError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn size_follows_source() {
        let transport = Arc::new(ChannelTransport::new());
        let cr = request(&transport);
        assert_eq!(cr.size_bytes(), Some(4000));

        let photon = CaptureRequest::new(
            TapSource::Photon,
            50,
            FeedlineConfig::default(),
            transport,
        )
        .unwrap();
        assert_eq!(photon.size_bytes(), None);
        assert_eq!(photon.tap(), Tap::Photon);
    }
}
