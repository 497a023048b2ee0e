//! Section declarations for the feedline configuration tree.

use super::{hash_setting, ConfigHash, Setting};
use crate::error::{ReadoutError, ReadoutResult};

setting_section! {
    /// IF board local oscillator and attenuators.
    pub struct IfSetup {
        /// Local oscillator frequency in MHz.
        lo: f64,
        /// ADC-side attenuation in dB.
        adc_attn: f64,
        /// DAC-side attenuation in dB.
        dac_attn: f64,
    }
}

setting_section! {
    /// DAC replay table contents.
    pub struct DacSetup {
        /// Name of the comb the waveform was generated from.
        comb: String,
        /// Quantized waveform replayed by the DAC.
        waveform: Vec<i16>,
        /// Quadrature modulation correction settings.
        qmc_settings: Vec<f64>,
    }
}

setting_section! {
    /// Assignment of FFT bins to resonator channels.
    pub struct ChannelMap {
        /// Bin index for each channel.
        bins: Vec<u32>,
    }
}

setting_section! {
    /// Digital down-conversion.
    pub struct DdcSetup {
        /// Tone frequency per channel.
        tones: Vec<f64>,
        /// Loop centers per channel.
        centers: Vec<f64>,
        /// Phase offsets per channel.
        offsets: Vec<f64>,
    }
}

setting_section! {
    /// Optimal (matched) filter taps.
    pub struct FilterSetup {
        /// Fixed-point coefficients, channels concatenated.
        coefficients: Vec<i32>,
    }
}

setting_section! {
    /// Photon trigger.
    pub struct TriggerSetup {
        /// Holdoff per channel, in samples.
        holdoffs: Vec<u32>,
        /// Phase threshold per channel.
        thresholds: Vec<i32>,
    }
}

setting_section! {
    /// Complete hardware configuration a capture needs.
    ///
    /// Sections left as `None` are "don't care" for the capture.
    pub struct FeedlineConfig {
        /// IF board.
        if_board: IfSetup,
        /// DAC output.
        dac: DacSetup,
        /// Channel map.
        channels: ChannelMap,
        /// Down-conversion.
        ddc: DdcSetup,
        /// Matched filter.
        filter: FilterSetup,
        /// Trigger.
        trigger: TriggerSetup,
    }
}

impl FeedlineConfig {
    /// True when every concrete field shared with `other` agrees.
    pub fn compatible(&self, other: &Self) -> bool {
        self.compatible_with(other)
    }

    /// Dotted paths of every field where both sides are concrete and differ.
    pub fn conflicts(&self, other: &Self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_conflicts(other, "", &mut out);
        out
    }

    /// Merges two compatible configurations, concrete values winning over unset ones.
    ///
    /// # Errors
    ///
    /// `ReadoutError::ConfigConflict` naming the offending fields if the inputs are not
    /// compatible. No partial merge is produced.
    pub fn merge(&self, other: &Self) -> ReadoutResult<Self> {
        let fields = self.conflicts(other);
        if !fields.is_empty() {
            return Err(ReadoutError::ConfigConflict { fields });
        }
        Ok(self.merged(other))
    }

    /// Rejects NaN and infinite values, which would make a configuration unequal to
    /// itself.
    ///
    /// # Errors
    ///
    /// `ReadoutError::Validation` naming every non-finite field.
    pub fn validate(&self) -> ReadoutResult<()> {
        let mut fields = Vec::new();
        self.collect_non_finite("", &mut fields);
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ReadoutError::Validation(format!(
                "non-finite value in {}",
                fields.join(", ")
            )))
        }
    }

    /// Stable identity hash derived from the declared fields.
    pub fn config_hash(&self) -> ConfigHash {
        hash_setting("feedline-config/v1", self)
    }

    /// Builder-style setter for the IF board section.
    pub fn with_if_board(mut self, setup: IfSetup) -> Self {
        self.if_board = Some(setup);
        self
    }

    /// Builder-style setter for the DAC section.
    pub fn with_dac(mut self, setup: DacSetup) -> Self {
        self.dac = Some(setup);
        self
    }

    /// Builder-style setter for the channel map.
    pub fn with_channels(mut self, map: ChannelMap) -> Self {
        self.channels = Some(map);
        self
    }

    /// Builder-style setter for the down-conversion section.
    pub fn with_ddc(mut self, setup: DdcSetup) -> Self {
        self.ddc = Some(setup);
        self
    }

    /// Builder-style setter for the matched filter.
    pub fn with_filter(mut self, setup: FilterSetup) -> Self {
        self.filter = Some(setup);
        self
    }

    /// Builder-style setter for the trigger.
    pub fn with_trigger(mut self, setup: TriggerSetup) -> Self {
        self.trigger = Some(setup);
        self
    }
}

impl IfSetup {
    /// Fully specified IF board setup.
    pub fn new(lo: f64, adc_attn: f64, dac_attn: f64) -> Self {
        Self {
            lo: Some(lo),
            adc_attn: Some(adc_attn),
            dac_attn: Some(dac_attn),
        }
    }
}
