//! # Feedline Readout Core Library
//!
//! Capture scheduling for a shared feedline readout instrument. Clients submit capture
//! requests against one of the instrument's taps, each carrying the instrument
//! configuration it needs. The scheduler runs as many captures at once as the taps and
//! the configuration allow, queues the rest, and reports every step on a per-request
//! status channel.
//!
//! ## Crate Structure
//!
//! - **`feedline_config`**: The configuration model. Every setting may be left unset
//!   (a wildcard), and two configurations are compatible when no setting is set to
//!   different values in both.
//! - **`config_manager`**: Tracks which configuration each running capture needs and
//!   the effective merge of all of them. Also remembers configurations by hash.
//! - **`capture`**: The `CaptureRequest` entity, its status lifecycle, and the
//!   `Transport` trait its status and data are published through.
//! - **`tap`**: The instrument's capture points and the client-facing sources that map
//!   onto them.
//! - **`hardware`**: The `Hardware` trait and a simulated instrument.
//! - **`worker`**: Per-capture tasks that pull chunks from a tap until done or cancelled.
//! - **`scheduler`**: The control loop that owns admission, queueing and cancellation.
//! - **`settings`**: Figment-based settings (TOML file plus `READOUT_` environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The crate-wide `ReadoutError`.

pub mod capture;
pub mod config_manager;
pub mod error;
pub mod feedline_config;
pub mod hardware;
pub mod logging;
pub mod scheduler;
pub mod settings;
pub mod tap;
pub mod worker;

pub use capture::{CaptureId, CaptureRequest, StatusKind};
pub use error::{ReadoutError, ReadoutResult};
pub use feedline_config::{ConfigHash, ConfigSource, FeedlineConfig};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use tap::{Tap, TapSource};
