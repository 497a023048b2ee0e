//! Tracking of the configuration required by every running capture.
//!
//! The manager is owned by the scheduler's control task and is never shared. It keeps
//! `id → config` for each running capture and the effective configuration, which is the
//! field-wise merge of all of them. It also holds the registry of configurations taught
//! in full, so later requests may refer to them by hash alone.

use crate::capture::CaptureId;
use crate::error::{ReadoutError, ReadoutResult};
use crate::feedline_config::{ConfigHash, ConfigSource, FeedlineConfig, Setting};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Owner of the effective configuration.
#[derive(Debug, Default)]
pub struct ConfigManager {
    active: BTreeMap<CaptureId, FeedlineConfig>,
    effective: FeedlineConfig,
    learned: HashMap<ConfigHash, FeedlineConfig>,
}

impl ConfigManager {
    /// Empty manager: nothing running, nothing taught.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id → config` and folds it into the effective configuration.
    ///
    /// Admission is expected to have checked compatibility already; the merge is still
    /// checked so a conflicting add leaves the manager untouched.
    ///
    /// # Errors
    ///
    /// `ReadoutError::ConfigConflict` if `config` disagrees with the effective
    /// configuration.
    pub fn add(&mut self, id: CaptureId, config: FeedlineConfig) -> ReadoutResult<FeedlineConfig> {
        let effective = self.effective.merge(&config)?;
        debug!(capture_id = %id, effective = %effective.config_hash().short(), "Configuration required");
        self.active.insert(id, config);
        self.effective = effective;
        Ok(self.effective.clone())
    }

    /// Drops the requirement held by `id` and recomputes the effective configuration
    /// from the remaining captures.
    ///
    /// Returns true iff the effective configuration changed. Unknown ids change nothing.
    pub fn release(&mut self, id: &CaptureId) -> bool {
        if self.active.remove(id).is_none() {
            trace!(capture_id = %id, "Release of unknown capture ignored");
            return false;
        }

        // Merge is not invertible, so rebuild from the survivors.
        let rebuilt = self
            .active
            .values()
            .fold(FeedlineConfig::default(), |acc, config| acc.merged(config));

        let changed = rebuilt != self.effective;
        self.effective = rebuilt;
        debug!(capture_id = %id, changed, "Configuration released");
        changed
    }

    /// Snapshot of the effective configuration.
    pub fn required_effective(&self) -> &FeedlineConfig {
        &self.effective
    }

    /// Admission check against the effective configuration.
    ///
    /// # Errors
    ///
    /// `ReadoutError::ConfigConflict` listing the disagreeing fields.
    pub fn check(&self, config: &FeedlineConfig) -> ReadoutResult<()> {
        let fields = self.effective.conflicts(config);
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ReadoutError::ConfigConflict { fields })
        }
    }

    /// Remembers a full configuration so later requests may reference it by hash.
    ///
    /// Taught configurations are kept for the lifetime of the manager.
    pub fn learn(&mut self, config: &FeedlineConfig) -> ConfigHash {
        let hash = config.config_hash();
        if !self.is_known(&hash) {
            debug!(config_hash = %hash.short(), "Learned configuration");
            self.learned.insert(hash, config.clone());
        }
        hash
    }

    /// True if a configuration with this hash was taught.
    pub fn is_known(&self, hash: &ConfigHash) -> bool {
        self.learned.contains_key(hash)
    }

    /// Turns a request's configuration source into a full value, teaching it when
    /// carried in full.
    ///
    /// # Errors
    ///
    /// `ReadoutError::ConfigUnknown` for a hash that was never taught.
    pub fn resolve(&mut self, source: &ConfigSource) -> ReadoutResult<FeedlineConfig> {
        match source {
            ConfigSource::Full(config) => {
                self.learn(config);
                Ok(config.clone())
            }
            ConfigSource::Reference(hash) => self
                .learned
                .get(hash)
                .cloned()
                .ok_or(ReadoutError::ConfigUnknown(*hash)),
        }
    }

    /// True if `id` currently holds a requirement.
    pub fn is_active(&self, id: &CaptureId) -> bool {
        self.active.contains_key(id)
    }

    /// Number of taught configurations.
    pub fn learned_count(&self) -> usize {
        self.learned.len()
    }
}
