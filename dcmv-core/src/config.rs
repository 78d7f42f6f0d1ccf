//! # Engine Configuration
//!
//! Loaded from JSON; every field has a default, so `{}` is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decoded frame slots (N)
    pub slot_count: usize,
    /// Frames ahead of the cursor the worker keeps queued
    pub preload_ahead: usize,
    /// Frames queued from a seek target
    pub seek_reseed: usize,
    /// Frames queued from the cursor after starvation recovery
    pub recovery_reseed: usize,
    /// Consecutive idle worker passes before the pool is flushed
    pub starvation_idle_passes: u32,
    /// Worker doorbell timeout while there is nothing to do
    pub worker_poll_ms: u64,
    /// Worker doorbell timeout while preload is paused
    pub paused_poll_ms: u64,
    /// Delay between closing and reopening media handles on seek
    pub reopen_delay_ms: u64,
    /// Time after a seek before audio is unmuted
    pub seek_settle_ms: u64,
    /// Audio seek offsets are rounded up to this many bytes
    pub audio_alignment: u64,
    /// Stored audio bits per sample (4 = ADPCM)
    pub audio_bits_per_sample: u32,
    /// Failed decodes of one frame before playback shows the previous frame instead
    pub max_decode_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_count: 24,
            preload_ahead: 16,
            seek_reseed: 12,
            recovery_reseed: 8,
            starvation_idle_passes: 120,
            worker_poll_ms: 1,
            paused_poll_ms: 2,
            reopen_delay_ms: 10,
            seek_settle_ms: 50,
            audio_alignment: 16,
            audio_bits_per_sample: 4,
            max_decode_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&content)?;
        tracing::debug!("Loaded engine config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_count == 0 {
            return Err(ConfigError::Invalid("slot_count must be at least 1".into()));
        }
        if self.preload_ahead == 0 || self.seek_reseed == 0 || self.recovery_reseed == 0 {
            return Err(ConfigError::Invalid(
                "preload_ahead, seek_reseed and recovery_reseed must be at least 1".into(),
            ));
        }
        if self.starvation_idle_passes == 0 {
            return Err(ConfigError::Invalid("starvation_idle_passes must be at least 1".into()));
        }
        if !self.audio_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "audio_alignment {} is not a power of two",
                self.audio_alignment
            )));
        }
        if !matches!(self.audio_bits_per_sample, 4 | 8 | 16) {
            return Err(ConfigError::Invalid(format!(
                "unsupported audio_bits_per_sample {}",
                self.audio_bits_per_sample
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Effective windows (never wider than the pool)
    // ========================================================================

    pub fn preload_window(&self) -> u32 {
        self.preload_ahead.min(self.slot_count) as u32
    }

    pub fn seek_window(&self) -> u32 {
        self.seek_reseed.min(self.slot_count) as u32
    }

    pub fn recovery_window(&self) -> u32 {
        self.recovery_reseed.min(self.slot_count) as u32
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn paused_poll(&self) -> Duration {
        Duration::from_millis(self.paused_poll_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn seek_settle(&self) -> Duration {
        Duration::from_millis(self.seek_settle_ms)
    }
}
