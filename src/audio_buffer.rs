// src/audio_buffer.rs
//
// Planar sample storage: borrowed views for processing, owned scratch
// space, and immutable shared sample data for regions and takes.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

/// Lowest level reported by meters, in dBFS.
pub const MIN_DB: f32 = -100.0;

#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain <= 0.0 {
        MIN_DB
    } else {
        (20.0 * gain.log10()).max(MIN_DB)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Borrowed view
// ═══════════════════════════════════════════════════════════════════

/// Mutable planar view: channel 0 frames, then channel 1 frames, ...
#[derive(Debug)]
pub struct AudioBuffer<'a> {
    pub channels: usize,
    pub frames: usize,
    pub data: &'a mut [f32],
}

impl<'a> AudioBuffer<'a> {
    #[inline]
    pub fn new(data: &'a mut [f32], channels: usize) -> Self {
        let frames = if channels == 0 { 0 } else { data.len() / channels };
        Self {
            channels,
            frames,
            data,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.frames;
        &self.data[start..start + self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Left and right channels at once. `None` on the right for mono buffers.
    #[inline]
    pub fn stereo_mut(&mut self) -> (&mut [f32], Option<&mut [f32]>) {
        let frames = self.frames;
        if self.channels < 2 {
            return (&mut self.data[..frames], None);
        }
        let (left, rest) = self.data.split_at_mut(frames);
        (left, Some(&mut rest[..frames]))
    }

    /// Mix `other` into this buffer. Mono sources are spread to every channel.
    pub fn add_from(&mut self, other: &AudioBuffer, gain: f32) {
        let frames = self.frames.min(other.frames);
        if other.channels == 0 {
            return;
        }
        for ch in 0..self.channels {
            let src = other.channel(ch % other.channels);
            let dst = self.channel_mut(ch);
            for i in 0..frames {
                dst[i] += src[i] * gain;
            }
        }
    }

    /// Copy `other` into the frame range starting at `offset`.
    pub fn write_at(&mut self, offset: usize, other: &AudioBuffer) {
        if other.channels == 0 || offset >= self.frames {
            return;
        }
        let frames = other.frames.min(self.frames - offset);
        for ch in 0..self.channels {
            let src = &other.channel(ch % other.channels)[..frames];
            self.channel_mut(ch)[offset..offset + frames].copy_from_slice(src);
        }
    }

    #[inline]
    pub fn scale(&mut self, gain: f32) {
        for s in self.data.iter_mut() {
            *s *= gain;
        }
    }

    /// Absolute peak of one channel.
    pub fn peak(&self, ch: usize) -> f32 {
        self.channel(ch).iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    /// Root mean square of one channel.
    pub fn rms(&self, ch: usize) -> f32 {
        rms(self.channel(ch))
    }
}

pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

// ═══════════════════════════════════════════════════════════════════
// Owned scratch
// ═══════════════════════════════════════════════════════════════════

/// Pre-sized planar storage that lends [`AudioBuffer`] views.
#[derive(Debug, Clone)]
pub struct ScratchBuffer {
    channels: usize,
    capacity: usize,
    data: Vec<f32>,
}

impl ScratchBuffer {
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels,
            capacity,
            data: vec![0.0; channels * capacity],
        }
    }

    pub fn stereo(capacity: usize) -> Self {
        Self::new(2, capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrow the first `frames` frames of every channel, cleared.
    pub fn cleared(&mut self, frames: usize) -> AudioBuffer<'_> {
        let mut buf = self.as_buffer(frames);
        buf.clear();
        buf
    }

    /// Borrow the first `frames` frames of every channel.
    pub fn as_buffer(&mut self, frames: usize) -> AudioBuffer<'_> {
        let frames = frames.min(self.capacity);
        AudioBuffer::new(&mut self.data[..self.channels * frames], self.channels)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Shared sample data
// ═══════════════════════════════════════════════════════════════════

/// Immutable planar audio. Cloning shares the samples.
#[derive(Debug, Clone)]
pub struct AudioData {
    sample_rate: f64,
    frames: usize,
    channels: Arc<Vec<Vec<f32>>>,
}

impl AudioData {
    pub fn new(sample_rate: f64, channels: Vec<Vec<f32>>) -> EngineResult<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::invalid_clip(
                "Audio data requires a positive sample rate",
            ));
        }
        let Some(first) = channels.first() else {
            return Err(EngineError::invalid_clip(
                "Audio data requires at least one channel",
            ));
        };
        let frames = first.len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(EngineError::invalid_clip(
                "Audio data channels must have equal length",
            ));
        }
        Ok(Self {
            sample_rate,
            frames,
            channels: Arc::new(channels),
        })
    }

    /// Build from interleaved samples.
    pub fn from_interleaved(
        sample_rate: f64,
        channels: usize,
        samples: &[f32],
    ) -> EngineResult<Self> {
        if channels == 0 {
            return Err(EngineError::invalid_clip(
                "Audio data requires at least one channel",
            ));
        }
        let frames = samples.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, s) in frame.iter().enumerate() {
                planar[ch].push(*s);
            }
        }
        Self::new(sample_rate, planar)
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.frames as f64 / self.sample_rate
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    /// Linearly interpolated read at a fractional frame position.
    /// Channels past the last wrap around, so mono feeds both sides.
    #[inline]
    pub fn sample_at(&self, ch: usize, position: f64) -> f32 {
        let data = &self.channels[ch % self.channels.len()];
        if position < 0.0 {
            return 0.0;
        }
        let index = position as usize;
        if index >= self.frames {
            return 0.0;
        }
        let frac = (position - index as f64) as f32;
        let a = data[index];
        let b = data.get(index + 1).copied().unwrap_or(0.0);
        a + (b - a) * frac
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames * self.channels.len());
        for i in 0..self.frames {
            for ch in self.channels.iter() {
                out.push(ch[i]);
            }
        }
        out
    }

    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_db_conversions() {
        assert_relative_eq!(db_to_gain(0.0), 1.0);
        assert_relative_eq!(db_to_gain(-6.0), 0.501_187, epsilon = 1e-5);
        assert_relative_eq!(gain_to_db(1.0), 0.0);
        assert_eq!(gain_to_db(0.0), MIN_DB);
    }

    #[test]
    fn test_planar_view_channels() {
        let mut data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let buf = AudioBuffer::new(&mut data, 2);
        assert_eq!(buf.frames, 3);
        assert_eq!(buf.channel(1), &[4.0, 5.0, 6.0]);
        assert_eq!(buf.peak(1), 6.0);
    }

    #[test]
    fn test_add_from_spreads_mono() {
        let mut mono = vec![0.5, 0.5];
        let src = AudioBuffer::new(&mut mono, 1);
        let mut scratch = ScratchBuffer::stereo(2);
        let mut dst = scratch.cleared(2);
        dst.add_from(&src, 2.0);
        assert_eq!(dst.channel(0), &[1.0, 1.0]);
        assert_eq!(dst.channel(1), &[1.0, 1.0]);
    }

    #[test]
    fn test_write_at_offset() {
        let mut part = vec![1.0, 1.0, 2.0, 2.0];
        let src = AudioBuffer::new(&mut part, 2);
        let mut scratch = ScratchBuffer::stereo(4);
        let mut dst = scratch.cleared(4);
        dst.write_at(3, &src);
        assert_eq!(dst.channel(0), &[0.0, 0.0, 0.0, 1.0]);
        assert_eq!(dst.channel(1), &[0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_audio_data_validation() {
        assert!(AudioData::new(48_000.0, vec![]).is_err());
        assert!(AudioData::new(48_000.0, vec![vec![0.0; 4], vec![0.0; 3]]).is_err());
        assert!(AudioData::new(0.0, vec![vec![0.0; 4]]).is_err());

        let data = AudioData::new(4.0, vec![vec![0.0, 1.0, 0.0, -1.0]]).unwrap();
        assert_eq!(data.duration(), 1.0);
        assert_relative_eq!(data.sample_at(0, 0.5), 0.5);
        assert_relative_eq!(data.sample_at(1, 1.0), 1.0);
        assert_eq!(data.sample_at(0, 10.0), 0.0);
    }

    #[test]
    fn test_interleaved_round_trip() {
        let data = AudioData::from_interleaved(48_000.0, 2, &[1.0, -1.0, 2.0, -2.0]).unwrap();
        assert_eq!(data.channel(0), &[1.0, 2.0]);
        assert_eq!(data.channel(1), &[-1.0, -2.0]);
        assert_eq!(data.to_interleaved(), vec![1.0, -1.0, 2.0, -2.0]);
    }
}
