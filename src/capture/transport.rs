//! Client-facing output channels.
//!
//! The scheduler never assumes a wire format. It only needs to connect a status and a
//! data channel per request, publish onto them, and close them once the request is
//! terminal. [`ChannelTransport`] is the in-process implementation: a pair of tokio
//! broadcast channels that any number of subscribers can listen to, with per-request
//! connection bookkeeping.

use super::{CaptureId, DataChunk, StatusEvent};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Publisher for one request's status and data.
///
/// # Contract
/// - Publishing before the matching channel is connected is an error
/// - `close` is idempotent and never fails
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the status channel for `id`.
    async fn connect_status_channel(&self, id: &CaptureId) -> Result<()>;

    /// Opens the data channel for `id`.
    async fn connect_data_channel(&self, id: &CaptureId) -> Result<()>;

    /// Publishes one status event.
    async fn publish_status(&self, event: StatusEvent) -> Result<()>;

    /// Publishes one data chunk.
    async fn publish_data(&self, chunk: DataChunk) -> Result<()>;

    /// Releases both channels of `id`.
    async fn close(&self, id: &CaptureId);
}

#[derive(Debug, Default, Clone, Copy)]
struct Connection {
    status: bool,
    data: bool,
}

/// In-process pub/sub transport.
///
/// Publishing with no subscriber is not an error, matching pub/sub semantics where
/// late joiners simply miss earlier messages.
pub struct ChannelTransport {
    status_tx: broadcast::Sender<StatusEvent>,
    data_tx: broadcast::Sender<DataChunk>,
    connections: Mutex<HashMap<CaptureId, Connection>>,
    refused: Mutex<HashSet<CaptureId>>,
}

impl ChannelTransport {
    /// Default broadcast capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Transport with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Transport whose broadcast buffers hold `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(capacity);
        let (data_tx, _) = broadcast::channel(capacity);
        Self {
            status_tx,
            data_tx,
            connections: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// Receives every status event published after this call.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Receives every data chunk published after this call.
    pub fn subscribe_data(&self) -> broadcast::Receiver<DataChunk> {
        self.data_tx.subscribe()
    }

    /// Makes connection attempts for `id` fail, simulating an unreachable client.
    pub fn refuse(&self, id: CaptureId) {
        self.refused.lock().insert(id);
    }

    /// Number of requests with at least one open channel.
    pub fn open_channels(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| c.status || c.data)
            .count()
    }

    /// True if `id` has any open channel.
    pub fn is_open(&self, id: &CaptureId) -> bool {
        self.connections
            .lock()
            .get(id)
            .is_some_and(|c| c.status || c.data)
    }

    fn connect(&self, id: &CaptureId, update: impl FnOnce(&mut Connection)) -> Result<()> {
        if self.refused.lock().contains(id) {
            bail!("connection refused for {}", id);
        }
        let mut connections = self.connections.lock();
        update(connections.entry(id.clone()).or_default());
        Ok(())
    }

    fn connection(&self, id: &CaptureId) -> Connection {
        self.connections.lock().get(id).copied().unwrap_or_default()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect_status_channel(&self, id: &CaptureId) -> Result<()> {
        self.connect(id, |c| c.status = true)?;
        trace!(capture_id = %id, "Status channel connected");
        Ok(())
    }

    async fn connect_data_channel(&self, id: &CaptureId) -> Result<()> {
        self.connect(id, |c| c.data = true)?;
        trace!(capture_id = %id, "Data channel connected");
        Ok(())
    }

    async fn publish_status(&self, event: StatusEvent) -> Result<()> {
        if !self.connection(&event.id).status {
            bail!("status channel for {} is not connected", event.id);
        }
        // No subscribers is fine for pub/sub.
        let _ = self.status_tx.send(event);
        Ok(())
    }

    async fn publish_data(&self, chunk: DataChunk) -> Result<()> {
        if !self.connection(&chunk.id).data {
            bail!("data channel for {} is not connected", chunk.id);
        }
        let _ = self.data_tx.send(chunk);
        Ok(())
    }

    async fn close(&self, id: &CaptureId) {
        if self.connections.lock().remove(id).is_some() {
            debug!(capture_id = %id, "Channels closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StatusKind;
    use bytes::Bytes;

    fn event(id: &CaptureId) -> StatusEvent {
        StatusEvent {
            id: id.clone(),
            sequence: 0,
            kind: StatusKind::Established,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let transport = ChannelTransport::new();
        let id = CaptureId::from_raw("a");
        assert!(transport.publish_status(event(&id)).await.is_err());

        transport.connect_status_channel(&id).await.unwrap();
        assert!(transport.publish_status(event(&id)).await.is_ok());

        let chunk = DataChunk {
            id: id.clone(),
            index: 0,
            total: None,
            payload: Bytes::from_static(b"xy"),
        };
        assert!(transport.publish_data(chunk.clone()).await.is_err());
        transport.connect_data_channel(&id).await.unwrap();
        assert!(transport.publish_data(chunk).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let transport = ChannelTransport::new();
        let mut rx = transport.subscribe_status();
        let id = CaptureId::from_raw("a");
        transport.connect_status_channel(&id).await.unwrap();
        transport.publish_status(event(&id)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn refused_ids_cannot_connect_and_close_is_idempotent() {
        let transport = ChannelTransport::new();
        let id = CaptureId::from_raw("nope");
        transport.refuse(id.clone());
        assert!(transport.connect_status_channel(&id).await.is_err());
        assert_eq!(transport.open_channels(), 0);

        let ok = CaptureId::from_raw("ok");
        transport.connect_status_channel(&ok).await.unwrap();
        assert!(transport.is_open(&ok));
        transport.close(&ok).await;
        transport.close(&ok).await;
        assert!(!transport.is_open(&ok));
    }
}
