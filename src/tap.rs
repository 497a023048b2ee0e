//! Physical data taps and the client-facing source names that map onto them.
//!
//! The instrument exposes three mutually-exclusive data paths. The engineering tap
//! is shared by the raw ADC, down-converted IQ and phase captures because they all
//! leave the FPGA through the same capture engine.

use crate::error::{ReadoutError, ReadoutResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exclusive physical resource. At most one capture runs per tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tap {
    /// Raw ADC, IQ and phase captures.
    Engineering,
    /// Photon event stream.
    Photon,
    /// Postage-stamp snapshots around triggered events.
    Postage,
}

impl Tap {
    /// All taps in a stable order.
    pub const ALL: [Tap; 3] = [Tap::Engineering, Tap::Photon, Tap::Postage];
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tap::Engineering => write!(f, "engineering"),
            Tap::Photon => write!(f, "photon"),
            Tap::Postage => write!(f, "postage"),
        }
    }
}

/// What a client asks to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapSource {
    /// Raw ADC samples (16-bit I and Q).
    Adc,
    /// Down-converted IQ for every resonator channel.
    Iq,
    /// Phase for every resonator channel.
    Phase,
    /// Photon events; the sample count is a buffer time in milliseconds.
    Photon,
    /// Postage stamps.
    Postage,
}

/// Number of resonator channels in the down-converted streams.
pub const N_CHANNELS: u64 = 2048;

impl TapSource {
    /// Physical tap serving this source.
    pub fn tap(self) -> Tap {
        match self {
            TapSource::Adc | TapSource::Iq | TapSource::Phase => Tap::Engineering,
            TapSource::Photon => Tap::Photon,
            TapSource::Postage => Tap::Postage,
        }
    }

    /// Bytes produced per requested sample.
    ///
    /// Photon captures are open-ended and report `None`.
    pub fn bytes_per_sample(self) -> Option<u64> {
        match self {
            TapSource::Adc => Some(4),
            TapSource::Iq => Some(N_CHANNELS * 4),
            TapSource::Phase => Some(N_CHANNELS * 2),
            TapSource::Postage => Some(4),
            TapSource::Photon => None,
        }
    }

    /// Short lowercase name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            TapSource::Adc => "adc",
            TapSource::Iq => "iq",
            TapSource::Phase => "phase",
            TapSource::Photon => "photon",
            TapSource::Postage => "postage",
        }
    }
}

impl fmt::Display for TapSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TapSource {
    type Err = ReadoutError;

    fn from_str(s: &str) -> ReadoutResult<Self> {
        match s.to_lowercase().as_str() {
            "adc" => Ok(TapSource::Adc),
            "iq" => Ok(TapSource::Iq),
            "phase" => Ok(TapSource::Phase),
            "photon" => Ok(TapSource::Photon),
            "postage" | "stamp" => Ok(TapSource::Postage),
            other => Err(ReadoutError::Validation(format!(
                "Unknown tap '{}'. Must be one of: adc, iq, phase, photon, postage",
                other
            ))),
        }
    }
}
