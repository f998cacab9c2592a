// Store configuration: embedded defaults, optional JSON overrides

use crate::core::constants::*;
use crate::core::error::{Result, StoreError};
use crate::core::params::Params;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrGenerationSettings {
    pub method: String,
    pub wavelet: String,
    pub level: i64,
    pub min_rr_sec: f64,
    pub max_cache_size: usize,
    /// Plausibility limits; heart-rate values outside become NaN when set.
    pub min_hr_bpm: Option<f64>,
    pub max_hr_bpm: Option<f64>,
}

impl Default for HrGenerationSettings {
    fn default() -> Self {
        Self {
            method: DEFAULT_HR_METHOD.to_string(),
            wavelet: DEFAULT_WAVELET.to_string(),
            level: DEFAULT_LEVEL,
            min_rr_sec: DEFAULT_MIN_RR_SEC,
            max_cache_size: DEFAULT_DERIVED_CACHE_SIZE,
            min_hr_bpm: None,
            max_hr_bpm: None,
        }
    }
}

impl HrGenerationSettings {
    /// Parameters filled in for every derived-signal request that omits them.
    pub fn default_params(&self) -> Params {
        Params::new()
            .with("method", self.method.as_str())
            .with("wavelet", self.wavelet.as_str())
            .with("level", self.level)
            .with("min_rr_sec", self.min_rr_sec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLoadingSettings {
    pub cache_size: usize,
}

impl Default for ChunkLoadingSettings {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CHUNK_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingSettings {
    /// Zero padding inserted between consecutive records.
    pub gap_sec: f64,
    /// Samples trimmed from each end of a raw trace into its buffers.
    pub boundary_buffer_sec: f64,
    /// Source channel for the derived heart rate.
    pub ecg_channel: String,
}

impl Default for LoadingSettings {
    fn default() -> Self {
        Self {
            gap_sec: DEFAULT_GAP_SEC,
            boundary_buffer_sec: DEFAULT_BOUNDARY_BUFFER_SEC,
            ecg_channel: DEFAULT_ECG_CHANNEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub hr_generation: HrGenerationSettings,
    pub chunk_loading: ChunkLoadingSettings,
    pub loading: LoadingSettings,
}

impl StoreConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)?;
        let config = Self::from_json_str(&data)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let hr = &self.hr_generation;
        if hr.max_cache_size == 0 {
            return Err(StoreError::InvalidConfig(
                "hr_generation.max_cache_size must be at least 1".into(),
            ));
        }
        if hr.level < 1 {
            return Err(StoreError::InvalidConfig(format!(
                "hr_generation.level must be at least 1, got {}",
                hr.level
            )));
        }
        if !(hr.min_rr_sec.is_finite() && hr.min_rr_sec > 0.0) {
            return Err(StoreError::InvalidConfig(format!(
                "hr_generation.min_rr_sec must be positive, got {}",
                hr.min_rr_sec
            )));
        }
        if let (Some(lo), Some(hi)) = (hr.min_hr_bpm, hr.max_hr_bpm) {
            if lo >= hi {
                return Err(StoreError::InvalidConfig(format!(
                    "heart-rate limits are inverted: {} >= {}",
                    lo, hi
                )));
            }
        }
        if self.chunk_loading.cache_size == 0 {
            return Err(StoreError::InvalidConfig(
                "chunk_loading.cache_size must be at least 1".into(),
            ));
        }
        let loading = &self.loading;
        if !(loading.gap_sec >= 0.0 && loading.boundary_buffer_sec >= 0.0) {
            return Err(StoreError::InvalidConfig(
                "gap_sec and boundary_buffer_sec must be non-negative".into(),
            ));
        }
        Ok(())
    }
}
