//! CLI Entry Point for feedline-readout
//!
//! Provides a command-line interface for:
//! - Running a batch of captures against the simulated instrument
//! - Checking a settings file
//!
//! # Usage
//!
//! Run three captures, two of which share the engineering tap:
//! ```bash
//! feedline_readout simulate --capture adc:4096 --capture iq:16 --capture postage:256
//! ```
//!
//! Validate settings:
//! ```bash
//! feedline_readout check-config --settings config/readout.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedline_readout::capture::{ChannelTransport, Transport};
use feedline_readout::feedline_config::IfSetup;
use feedline_readout::hardware::{Hardware, QuietOptions, SimulatedInstrument};
use feedline_readout::settings::{Settings, DEFAULT_SETTINGS_PATH};
use feedline_readout::{logging, scheduler, CaptureRequest, FeedlineConfig, TapSource};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "feedline_readout")]
#[command(about = "Capture scheduler for a shared feedline readout instrument", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit captures to a scheduler driving the simulated instrument
    Simulate {
        /// Capture as SOURCE:SAMPLES (sources: adc, iq, phase, photon, postage)
        #[arg(long = "capture", default_values_t = [
            CaptureSpec::new(TapSource::Adc, 4096),
            CaptureSpec::new(TapSource::Iq, 16),
            CaptureSpec::new(TapSource::Postage, 256),
        ])]
        captures: Vec<CaptureSpec>,

        /// Feedline configuration (TOML) required by every capture
        #[arg(long)]
        feedline: Option<PathBuf>,

        /// LO frequency in MHz when no feedline file is given
        #[arg(long, default_value_t = 6000.0)]
        lo: f64,

        /// Abort everything still running after this many milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,

        /// Stop the DAC and power the IF board down once every capture has ended
        #[arg(long)]
        quiet: bool,
    },

    /// Load and validate settings, then print the effective values
    CheckConfig,
}

#[derive(Debug, Clone, Copy)]
struct CaptureSpec {
    source: TapSource,
    samples: u64,
}

impl CaptureSpec {
    fn new(source: TapSource, samples: u64) -> Self {
        Self { source, samples }
    }
}

impl FromStr for CaptureSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((source, samples)) = s.split_once(':') else {
            bail!("expected SOURCE:SAMPLES, got '{}'", s);
        };
        Ok(Self {
            source: source.parse()?,
            samples: samples
                .parse()
                .with_context(|| format!("invalid sample count '{}'", samples))?,
        })
    }
}

impl std::fmt::Display for CaptureSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.samples)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Simulate {
            captures,
            feedline,
            lo,
            timeout_ms,
            quiet,
        } => {
            let config = match feedline {
                Some(path) => load_feedline(&path)?,
                None => FeedlineConfig::default().with_if_board(IfSetup::new(lo, 0.0, 0.0)),
            };
            simulate(&settings, captures, config, Duration::from_millis(timeout_ms), quiet).await
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn load_feedline(path: &Path) -> Result<FeedlineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn simulate(
    settings: &Settings,
    captures: Vec<CaptureSpec>,
    config: FeedlineConfig,
    limit: Duration,
    quiet: bool,
) -> Result<()> {
    let mut instrument = SimulatedInstrument::with_seed(settings.simulator.seed)
        .with_chunk_delay(settings.simulator.chunk_delay);
    if let Some(chunks) = settings.simulator.photon_chunks {
        instrument = instrument.with_photon_chunks(chunks);
    }
    let hardware: Arc<dyn Hardware> = Arc::new(instrument);
    let transport = Arc::new(ChannelTransport::new());
    let mut events = transport.subscribe_status();

    let (handle, task) = scheduler::spawn(settings.scheduler.clone(), hardware);
    info!(name = %settings.application.name, captures = captures.len(), "Simulation starting");

    let mut outstanding = HashSet::new();
    for spec in &captures {
        let shared: Arc<dyn Transport> = transport.clone();
        let request = CaptureRequest::new(spec.source, spec.samples, config.clone(), shared)?;
        outstanding.insert(request.id().clone());
        handle.submit(request).await?;
    }

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut aborted = false;
    while !outstanding.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event.kind.is_terminal() {
                        outstanding.remove(&event.id);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Status output lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline, if !aborted => {
                warn!(limit = ?limit, "Time limit reached, aborting remaining captures");
                handle.abort_all().await?;
                aborted = true;
            }
        }
    }

    if quiet {
        handle
            .be_quiet(QuietOptions {
                stop_dacs: true,
                power_off_if: true,
            })
            .await?;
    }

    let status = handle.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    handle.shutdown().await?;
    task.await??;
    Ok(())
}
