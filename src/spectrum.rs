// src/spectrum.rs
//
// Time-domain ring plus smoothed FFT magnitudes, shared by the master bus
// and the analyzer.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::audio_buffer::MIN_DB;

/// Analysis tap over one signal: keeps the last `size` samples and a
/// Blackman-windowed, exponentially smoothed magnitude spectrum.
pub struct SpectrumTap {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothing: f32,

    ring: Vec<f32>,
    write_pos: usize,

    fft_buffer: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    /// Smoothed linear magnitudes, `size / 2` bins.
    magnitudes: Vec<f32>,
}

impl std::fmt::Debug for SpectrumTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumTap")
            .field("size", &self.size)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

fn blackman(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}

impl SpectrumTap {
    /// `size` must be a power of two (validated by callers).
    pub fn new(size: usize, smoothing: f32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            size,
            fft,
            window: blackman(size),
            smoothing: smoothing.clamp(0.0, 1.0),
            ring: vec![0.0; size],
            write_pos: 0,
            fft_buffer: vec![Complex::new(0.0, 0.0); size],
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            magnitudes: vec![0.0; size / 2],
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn bin_count(&self) -> usize {
        self.size / 2
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
    }

    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.ring[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.size;
        }
    }

    /// Last `size` samples, oldest first.
    pub fn waveform(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.size);
        out.extend_from_slice(&self.ring[self.write_pos..]);
        out.extend_from_slice(&self.ring[..self.write_pos]);
        out
    }

    /// Run one FFT over the current ring and fold it into the smoothed
    /// magnitudes.
    pub fn update(&mut self) {
        let size = self.size;
        for i in 0..size {
            let s = self.ring[(self.write_pos + i) % size];
            self.fft_buffer[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.fft_scratch);

        let norm = 1.0 / size as f32;
        let tau = self.smoothing;
        for (mag, c) in self.magnitudes.iter_mut().zip(self.fft_buffer.iter()) {
            *mag = tau * *mag + (1.0 - tau) * c.norm() * norm;
        }
    }

    /// Smoothed magnitudes in dB.
    pub fn spectrum_db(&self) -> Vec<f32> {
        self.magnitudes
            .iter()
            .map(|m| if *m > 0.0 { (20.0 * m.log10()).max(MIN_DB) } else { MIN_DB })
            .collect()
    }

    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write_pos = 0;
        self.magnitudes.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_peaks_in_its_bin() {
        let size = 256;
        let sr = 256.0_f32;
        let mut tap = SpectrumTap::new(size, 0.0);
        let sine: Vec<f32> = (0..size)
            .map(|i| (std::f32::consts::TAU * 32.0 * i as f32 / sr).sin())
            .collect();
        tap.push(&sine);
        tap.update();

        let db = tap.spectrum_db();
        assert_eq!(db.len(), 128);
        let loudest = db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(loudest, 32);
    }

    #[test]
    fn test_waveform_is_chronological() {
        let mut tap = SpectrumTap::new(4, 0.8);
        tap.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(tap.waveform(), vec![3.0, 4.0, 5.0, 6.0]);
        tap.reset();
        assert_eq!(tap.waveform(), vec![0.0; 4]);
        assert!(tap.spectrum_db().iter().all(|d| *d == MIN_DB));
    }
}
