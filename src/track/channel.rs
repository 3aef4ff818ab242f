// src/track/channel.rs
//
// Per-track mixing channel: ramped volume, constant-power pan, mute/solo,
// plus a post-fader peak meter.

use crate::audio_buffer::{AudioBuffer, db_to_gain, gain_to_db};
use crate::effects::apply_pan;
use crate::error::{EngineResult, ensure_range};

pub const MIN_VOLUME_DB: f64 = -96.0;
pub const MAX_VOLUME_DB: f64 = 12.0;

/// Seconds a volume change takes to reach its target.
const VOLUME_RAMP: f64 = 0.1;

/// Validate a channel volume in dB.
pub(crate) fn check_volume(db: f64) -> EngineResult<()> {
    ensure_range("volume", db, MIN_VOLUME_DB, MAX_VOLUME_DB)
}

pub(crate) fn check_pan(pan: f64) -> EngineResult<()> {
    ensure_range("pan", pan, -1.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct ChannelStrip {
    volume_db: f32,
    pan: f32,
    mute: bool,
    solo: bool,

    current_gain: f32,
    target_gain: f32,
    ramp_step: f32,
    ramp_remaining: usize,
    ramp_samples: usize,
}

impl ChannelStrip {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            volume_db: 0.0,
            pan: 0.0,
            mute: false,
            solo: false,
            current_gain: 1.0,
            target_gain: 1.0,
            ramp_step: 0.0,
            ramp_remaining: 0,
            ramp_samples: (VOLUME_RAMP * sample_rate).round().max(1.0) as usize,
        }
    }

    #[inline]
    pub fn volume_db(&self) -> f32 {
        self.volume_db
    }

    #[inline]
    pub fn pan(&self) -> f32 {
        self.pan
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.mute
    }

    #[inline]
    pub fn is_soloed(&self) -> bool {
        self.solo
    }

    /// Gain currently applied, mid-ramp included.
    #[inline]
    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    /// Set the target volume; the applied gain ramps there linearly.
    pub fn set_volume(&mut self, db: f64) -> EngineResult<()> {
        check_volume(db)?;
        self.volume_db = db as f32;
        self.target_gain = db_to_gain(self.volume_db);
        self.ramp_remaining = self.ramp_samples;
        self.ramp_step = (self.target_gain - self.current_gain) / self.ramp_samples as f32;
        Ok(())
    }

    pub fn set_pan(&mut self, pan: f64) -> EngineResult<()> {
        check_pan(pan)?;
        self.pan = pan as f32;
        Ok(())
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }

    /// Apply volume and pan. An inaudible channel outputs silence but
    /// keeps its ramp moving.
    pub fn process(&mut self, buffer: &mut AudioBuffer, audible: bool) {
        let frames = buffer.frames;
        let start_gain = self.current_gain;
        let step = self.ramp_step;
        let ramp_frames = self.ramp_remaining.min(frames);

        for ch in 0..buffer.channels {
            let data = buffer.channel_mut(ch);
            let mut gain = start_gain;
            for (i, s) in data.iter_mut().enumerate() {
                if i < ramp_frames {
                    gain += step;
                }
                *s *= gain;
            }
        }

        self.ramp_remaining -= ramp_frames;
        self.current_gain = if self.ramp_remaining == 0 {
            self.target_gain
        } else {
            start_gain + step * ramp_frames as f32
        };

        if !audible {
            buffer.clear();
            return;
        }
        if self.pan != 0.0 {
            apply_pan(buffer, self.pan);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Meter
// ═══════════════════════════════════════════════════════════════════

/// Per-channel peak follower: `level = max(blockPeak, level · smoothing)`.
#[derive(Debug, Clone)]
pub struct PeakMeter {
    smoothing: f32,
    levels: [f32; 2],
}

impl PeakMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            levels: [0.0; 2],
        }
    }

    pub fn process(&mut self, buffer: &AudioBuffer) {
        if buffer.channels == 0 {
            return;
        }
        for ch in 0..2 {
            let peak = buffer.peak(ch % buffer.channels);
            self.levels[ch] = peak.max(self.levels[ch] * self.smoothing);
        }
    }

    /// Linear levels, left and right.
    #[inline]
    pub fn levels(&self) -> [f32; 2] {
        self.levels
    }

    /// Loudest channel in dB.
    pub fn level_db(&self) -> f32 {
        gain_to_db(self.levels[0].max(self.levels[1]))
    }

    pub fn reset(&mut self) {
        self.levels = [0.0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::{MIN_DB, ScratchBuffer};
    use crate::error::ErrorCode;
    use approx::assert_relative_eq;

    fn ones(scratch: &mut ScratchBuffer, frames: usize) -> AudioBuffer<'_> {
        let buf = scratch.as_buffer(frames);
        buf.data.fill(1.0);
        buf
    }

    #[test]
    fn test_volume_validation() {
        let mut strip = ChannelStrip::new(48_000.0);
        assert_eq!(
            strip.set_volume(13.0).unwrap_err().code(),
            ErrorCode::ParameterOutOfRange
        );
        assert_eq!(
            strip.set_volume(f64::NAN).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            strip.set_pan(-1.5).unwrap_err().code(),
            ErrorCode::ParameterOutOfRange
        );
        assert!(strip.set_volume(-96.0).is_ok());
    }

    #[test]
    fn test_volume_ramps_over_100ms() {
        let mut strip = ChannelStrip::new(1000.0);
        strip.set_volume(-6.0).unwrap();
        let target = db_to_gain(-6.0);

        let mut scratch = ScratchBuffer::stereo(50);
        let mut buf = ones(&mut scratch, 50);
        strip.process(&mut buf, true);
        // Halfway through the ramp
        assert_relative_eq!(strip.current_gain(), 1.0 + (target - 1.0) * 0.5, epsilon = 1e-4);
        assert!(buf.channel(0)[49] > target);

        let mut buf = ones(&mut scratch, 50);
        strip.process(&mut buf, true);
        assert_eq!(strip.current_gain(), target);
        assert_relative_eq!(buf.channel(0)[49], target, epsilon = 1e-4);
    }

    #[test]
    fn test_inaudible_is_silent() {
        let mut strip = ChannelStrip::new(1000.0);
        let mut scratch = ScratchBuffer::stereo(8);
        let mut buf = ones(&mut scratch, 8);
        strip.process(&mut buf, false);
        assert!(buf.data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_meter_follows_peaks() {
        let mut meter = PeakMeter::new(0.5);
        let mut scratch = ScratchBuffer::stereo(4);
        let buf = ones(&mut scratch, 4);
        meter.process(&buf);
        assert_eq!(meter.levels(), [1.0, 1.0]);
        let silent = scratch.cleared(4);
        meter.process(&silent);
        assert_eq!(meter.levels(), [0.5, 0.5]);
        meter.reset();
        assert_eq!(meter.level_db(), MIN_DB);
    }
}
