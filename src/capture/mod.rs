//! Capture requests and the events they publish.
//!
//! A [`CaptureRequest`] identifies one acquisition and owns its two output streams:
//! ordered [`StatusEvent`]s and [`DataChunk`]s, both published through a [`Transport`].
//!
//! # Lifecycle
//!
//! ```text
//! created ──establish()──▶ established ──▶ queued ⇄ queued ──▶ running ──▶ capturing*
//!                                                                  │
//!                                         finished | failed | aborted ◀┘
//! ```
//!
//! Terminal states close the output channels. A request runs at most once.

pub mod request;
pub mod transport;

pub use request::CaptureRequest;
pub use transport::{ChannelTransport, Transport};

use crate::feedline_config::ConfigHash;
use crate::tap::TapSource;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable capture identity.
///
/// Derived from tap source, sample count and configuration hash, so identical requests
/// share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(String);

impl CaptureId {
    /// Identity for a capture of `samples` from `source` in configuration `config`.
    pub fn derive(source: TapSource, samples: u64, config: &ConfigHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"capture/v1");
        hasher.update(source.as_str().as_bytes());
        hasher.update(samples.to_le_bytes());
        hasher.update(config.as_bytes());
        let digest = hasher.finalize();
        Self(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Wraps an id received from a client, e.g. in an abort command.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status kinds a client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Output channels connected.
    Established,
    /// Waiting for a tap or a compatible configuration.
    Queued,
    /// Worker started.
    Running,
    /// A chunk was delivered.
    Capturing,
    /// All data delivered.
    Finished,
    /// Ended with an error.
    Failed,
    /// Cancelled.
    Aborted,
}

impl StatusKind {
    /// Finished, failed and aborted end the request.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusKind::Finished | StatusKind::Failed | StatusKind::Aborted
        )
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusKind::Established => "established",
            StatusKind::Queued => "queued",
            StatusKind::Running => "running",
            StatusKind::Capturing => "capturing",
            StatusKind::Finished => "finished",
            StatusKind::Failed => "failed",
            StatusKind::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// One status transition as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Request the event belongs to.
    pub id: CaptureId,
    /// Position in this request's event stream, starting at 0.
    pub sequence: u64,
    /// New status.
    pub kind: StatusKind,
    /// Human-readable detail.
    pub message: String,
}

/// One block of captured data.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    /// Request the data belongs to.
    pub id: CaptureId,
    /// Zero-based chunk index.
    pub index: u64,
    /// Total chunks, when the capture is bounded.
    pub total: Option<u64>,
    /// Raw bytes as produced by the tap.
    pub payload: Bytes,
}
