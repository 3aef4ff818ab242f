// src/config.rs
//
// Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ensure_range};

pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
pub const DEFAULT_MAX_BLOCK: usize = 512;

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32_768;

/// Static engine settings, fixed for the lifetime of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Scheduling look-ahead in seconds (reported to hosts that buffer ahead).
    pub look_ahead: f64,
    /// Largest block processed in one pass; longer host blocks are chunked.
    pub max_block_size: usize,
    /// Master limiter threshold in dBFS. Fixed once the bus is built.
    pub limiter_threshold_db: f32,
    /// Master meter smoothing factor (0..1).
    pub meter_smoothing: f32,
    /// FFT size of the master bus spectrum tap.
    pub master_fft_size: usize,
    /// FFT size of the analysis tap.
    pub analyzer_fft_size: usize,
    /// Spectrum smoothing of the analysis tap (0..1).
    pub analyzer_smoothing: f32,
    /// Seed for colors, placeholder tones and humanize. `None` seeds from the clock.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            look_ahead: 0.1,
            max_block_size: DEFAULT_MAX_BLOCK,
            limiter_threshold_db: -0.5,
            meter_smoothing: 0.8,
            master_fft_size: 1024,
            analyzer_fft_size: 2048,
            analyzer_smoothing: 0.8,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            EngineError::invalid_parameter(format!("Invalid engine config: {e}")).with_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_max_block_size(mut self, frames: usize) -> Self {
        self.max_block_size = frames;
        self
    }

    pub fn with_limiter_threshold_db(mut self, db: f32) -> Self {
        self.limiter_threshold_db = db;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::invalid_parameter(
                "sampleRate must be a positive number",
            ));
        }
        if self.max_block_size == 0 {
            return Err(EngineError::invalid_parameter(
                "maxBlockSize must be greater than zero",
            ));
        }
        ensure_range("lookAhead", self.look_ahead, 0.0, 10.0)?;
        ensure_range("meterSmoothing", self.meter_smoothing as f64, 0.0, 1.0)?;
        ensure_range("analyzerSmoothing", self.analyzer_smoothing as f64, 0.0, 1.0)?;
        validate_fft_size(self.master_fft_size)?;
        validate_fft_size(self.analyzer_fft_size)?;
        Ok(())
    }
}

pub(crate) fn validate_fft_size(size: usize) -> EngineResult<()> {
    if !size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size) {
        return Err(EngineError::invalid_parameter(format!(
            "FFT size must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}, got {size}"
        )));
    }
    Ok(())
}
