// src/analyzer.rs
//
// Spectrum, peak, loudness and phase measurement of the post-master mix.

use serde::Serialize;

use crate::audio_buffer::AudioBuffer;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, validate_fft_size};
use crate::error::EngineResult;
use crate::spectrum::SpectrumTap;

const MAX_HISTORY: usize = 300;
const SHORT_TERM_ENTRIES: usize = 30;
const DEFAULT_PEAK_HOLD_MS: f64 = 2000.0;
pub const DEFAULT_PEAK_WINDOWS: usize = 100;

#[inline]
fn to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-10).log10()
}

/// Simplified LUFS: RMS in dB minus the K-weighting offset.
#[inline]
pub fn lufs(rms: f32) -> f32 {
    to_db(rms) - 0.691
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumData {
    pub frequencies: Vec<f32>,
    pub magnitudes: Vec<f32>,
    pub bin_count: usize,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakData {
    pub peaks: Vec<f32>,
    pub rms: f32,
    pub peak_level: f32,
    /// Position of the loudest sample, 0..1 across the buffer.
    pub peak_position: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessData {
    pub integrated: f32,
    pub short_term: f32,
    pub momentary: f32,
    pub rms: f32,
    pub peak: f32,
    pub true_peak: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCorrelation {
    pub correlation: f32,
    pub balance: f32,
}

pub struct AudioAnalyzer {
    sample_rate: f64,
    clock: SharedClock,
    mono: SpectrumTap,
    left: SpectrumTap,
    right: SpectrumTap,
    mono_scratch: Vec<f32>,

    peak_hold: f32,
    peak_hold_time: f64,
    peak_hold_duration: f64,
    rms_history: Vec<f32>,
}

impl std::fmt::Debug for AudioAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioAnalyzer")
            .field("fft_size", &self.mono.size())
            .field("smoothing", &self.mono.smoothing())
            .field("history", &self.rms_history.len())
            .finish()
    }
}

impl AudioAnalyzer {
    pub fn new(config: &EngineConfig, clock: SharedClock) -> Self {
        let size = config.analyzer_fft_size;
        let smoothing = config.analyzer_smoothing;
        Self {
            sample_rate: config.sample_rate,
            clock,
            mono: SpectrumTap::new(size, smoothing),
            left: SpectrumTap::new(size, smoothing),
            right: SpectrumTap::new(size, smoothing),
            mono_scratch: vec![0.0; config.max_block_size],
            peak_hold: 0.0,
            peak_hold_time: 0.0,
            peak_hold_duration: DEFAULT_PEAK_HOLD_MS,
            rms_history: Vec::with_capacity(MAX_HISTORY + 1),
        }
    }

    /// Feed one block of the final mix.
    pub fn process(&mut self, buffer: &AudioBuffer) {
        if buffer.channels == 0 {
            return;
        }
        let frames = buffer.frames;
        let left = buffer.channel(0);
        let right = buffer.channel(1 % buffer.channels);
        if self.mono_scratch.len() < frames {
            self.mono_scratch.resize(frames, 0.0);
        }
        let mono = &mut self.mono_scratch[..frames];
        for i in 0..frames {
            mono[i] = (left[i] + right[i]) * 0.5;
        }
        self.mono.push(mono);
        self.left.push(left);
        self.right.push(right);
    }

    pub fn fft_size(&self) -> usize {
        self.mono.size()
    }

    // ─────────────────────────────────────────────────────────────────
    // Measurements
    // ─────────────────────────────────────────────────────────────────

    pub fn spectrum_data(&mut self) -> SpectrumData {
        self.mono.update();
        let size = self.mono.size();
        let bin_count = self.mono.bin_count();
        let frequencies = (0..bin_count)
            .map(|i| (i as f64 * self.sample_rate / size as f64) as f32)
            .collect();
        SpectrumData {
            frequencies,
            magnitudes: self.mono.spectrum_db(),
            bin_count,
            sample_rate: self.sample_rate,
        }
    }

    /// Downsample the mono buffer into `window_count` peak windows.
    pub fn peak_data(&self, window_count: usize) -> PeakData {
        let data = self.mono.waveform();
        let window_count = window_count.max(1);
        let per_window = data.len() / window_count;

        let mut peaks = Vec::with_capacity(window_count);
        let mut sum_sq = 0.0_f32;
        let mut peak_level = 0.0_f32;
        let mut peak_position = 0.0_f32;
        for w in 0..window_count {
            let start = w * per_window;
            let end = (start + per_window).min(data.len());
            let mut window_max = 0.0_f32;
            for (j, s) in data[start..end].iter().enumerate() {
                let value = s.abs();
                window_max = window_max.max(value);
                sum_sq += value * value;
                if value > peak_level {
                    peak_level = value;
                    peak_position = (start + j) as f32 / data.len() as f32;
                }
            }
            peaks.push(window_max);
        }

        PeakData {
            peaks,
            rms: (sum_sq / data.len().max(1) as f32).sqrt(),
            peak_level,
            peak_position,
        }
    }

    /// Momentary, short-term and integrated loudness plus a held true peak.
    pub fn loudness_data(&mut self) -> LoudnessData {
        let left = self.left.waveform();
        let right = self.right.waveform();
        let n = left.len().max(1);

        let mut sum_sq = 0.0_f32;
        let mut peak = 0.0_f32;
        for (l, r) in left.iter().zip(right.iter()) {
            let mono = (l + r) * 0.5;
            sum_sq += mono * mono;
            peak = peak.max(l.abs()).max(r.abs());
        }
        let rms = (sum_sq / n as f32).sqrt();

        self.rms_history.push(rms);
        if self.rms_history.len() > MAX_HISTORY {
            self.rms_history.remove(0);
        }

        let power_mean = |values: &[f32]| {
            let sum: f32 = values.iter().map(|v| v * v).sum();
            (sum / values.len().max(1) as f32).sqrt()
        };
        let short_start = self.rms_history.len().saturating_sub(SHORT_TERM_ENTRIES);
        let short_term = power_mean(&self.rms_history[short_start..]);
        let integrated = power_mean(&self.rms_history);

        let now = self.clock.now_ms();
        if peak > self.peak_hold || now - self.peak_hold_time > self.peak_hold_duration {
            self.peak_hold = peak;
            self.peak_hold_time = now;
        }

        LoudnessData {
            integrated: lufs(integrated),
            short_term: lufs(short_term),
            momentary: lufs(rms),
            rms: to_db(rms),
            peak: to_db(peak),
            true_peak: to_db(self.peak_hold),
        }
    }

    /// Pearson correlation between channels and their RMS ratio.
    pub fn phase_correlation(&self) -> PhaseCorrelation {
        let left = self.left.waveform();
        let right = self.right.waveform();
        let n = left.len().max(1) as f64;

        let (mut sl, mut sr, mut sll, mut srr, mut slr) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&l, &r) in left.iter().zip(right.iter()) {
            let (l, r) = (f64::from(l), f64::from(r));
            sl += l;
            sr += r;
            sll += l * l;
            srr += r * r;
            slr += l * r;
        }
        let (ml, mr) = (sl / n, sr / n);
        let numerator = slr - n * ml * mr;
        let denominator = ((sll - n * ml * ml) * (srr - n * mr * mr)).sqrt();
        let correlation = if denominator > 0.0 && denominator.is_finite() {
            numerator / denominator
        } else {
            0.0
        };

        let rms_left = (sll / n).sqrt();
        let rms_right = (srr / n).sqrt();
        let balance = if rms_right != 0.0 { rms_left / rms_right } else { 1.0 };

        PhaseCorrelation {
            correlation: correlation.clamp(-1.0, 1.0) as f32,
            balance: balance as f32,
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────

    /// Clear loudness history and the held peak.
    pub fn reset(&mut self) {
        self.peak_hold = 0.0;
        self.peak_hold_time = 0.0;
        self.rms_history.clear();
    }

    pub fn set_peak_hold_duration(&mut self, milliseconds: f64) {
        self.peak_hold_duration = milliseconds.max(0.0);
    }

    /// Resize every tap. Buffered audio is discarded.
    pub fn set_fft_size(&mut self, size: usize) -> EngineResult<()> {
        validate_fft_size(size)?;
        let smoothing = self.mono.smoothing();
        self.mono = SpectrumTap::new(size, smoothing);
        self.left = SpectrumTap::new(size, smoothing);
        self.right = SpectrumTap::new(size, smoothing);
        Ok(())
    }

    pub fn set_smoothing(&mut self, value: f32) {
        self.mono.set_smoothing(value);
        self.left.set_smoothing(value);
        self.right.set_smoothing(value);
    }

    pub fn smoothing(&self) -> f32 {
        self.mono.smoothing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn analyzer(clock: &ManualClock) -> AudioAnalyzer {
        let config = EngineConfig {
            analyzer_fft_size: 256,
            max_block_size: 256,
            ..EngineConfig::default()
        };
        AudioAnalyzer::new(&config, Arc::new(clock.clone()))
    }

    fn feed(a: &mut AudioAnalyzer, left: f32, right: f32) {
        let mut scratch = ScratchBuffer::stereo(256);
        let mut buf = scratch.as_buffer(256);
        buf.channel_mut(0).fill(left);
        buf.channel_mut(1).fill(right);
        a.process(&buf);
    }

    #[test]
    fn test_spectrum_bins() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        let data = a.spectrum_data();
        assert_eq!(data.bin_count, 128);
        assert_eq!(data.frequencies.len(), 128);
        assert_relative_eq!(data.frequencies[1], 48_000.0 / 256.0);
    }

    #[test]
    fn test_peak_data_windows() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        feed(&mut a, 0.5, 0.5);
        let peaks = a.peak_data(DEFAULT_PEAK_WINDOWS);
        assert_eq!(peaks.peaks.len(), 100);
        assert_relative_eq!(peaks.peak_level, 0.5);
        assert_relative_eq!(peaks.peaks[0], 0.5);
        assert_eq!(peaks.peak_position, 0.0);
    }

    #[test]
    fn test_loudness_of_constant_signal() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        feed(&mut a, 0.5, 0.5);
        let loud = a.loudness_data();
        let expected = 20.0 * 0.5_f32.log10() - 0.691;
        assert_relative_eq!(loud.momentary, expected, epsilon = 1e-4);
        assert_relative_eq!(loud.integrated, expected, epsilon = 1e-4);
        assert_relative_eq!(loud.true_peak, 20.0 * 0.5_f32.log10(), epsilon = 1e-4);
    }

    #[test]
    fn test_true_peak_hold_expires() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        feed(&mut a, 1.0, 1.0);
        a.loudness_data();
        feed(&mut a, 0.1, 0.1);
        clock.advance(1000.0);
        assert_relative_eq!(a.loudness_data().true_peak, 0.0, epsilon = 1e-4);
        clock.advance(1500.0);
        assert_relative_eq!(a.loudness_data().true_peak, -20.0, epsilon = 1e-3);

        a.reset();
        a.set_peak_hold_duration(0.0);
    }

    #[test]
    fn test_phase_correlation() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        let mut scratch = ScratchBuffer::stereo(256);
        let mut buf = scratch.as_buffer(256);
        for i in 0..256 {
            let s = (i as f32 * 0.1).sin();
            buf.channel_mut(0)[i] = s;
            buf.channel_mut(1)[i] = -s * 0.5;
        }
        a.process(&buf);
        let phase = a.phase_correlation();
        assert_relative_eq!(phase.correlation, -1.0, epsilon = 1e-4);
        assert_relative_eq!(phase.balance, 2.0, epsilon = 1e-4);

        a.reset();
        feed(&mut a, 0.0, 0.0);
        let silent = a.phase_correlation();
        assert_eq!(silent.correlation, 0.0);
        assert_eq!(silent.balance, 1.0);
    }

    #[test]
    fn test_config_setters() {
        let clock = ManualClock::new(0.0);
        let mut a = analyzer(&clock);
        assert_eq!(
            a.set_fft_size(1000).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        a.set_fft_size(512).unwrap();
        assert_eq!(a.fft_size(), 512);
        a.set_smoothing(3.0);
        assert_eq!(a.smoothing(), 1.0);
    }
}
