// src/master_bus.rs
//
// Final mix stage: master fader, meter, limiter and spectrum tap.

use serde::Serialize;

use crate::audio_buffer::{AudioBuffer, db_to_gain, gain_to_db};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::spectrum::SpectrumTap;
use crate::track::{ChannelStrip, PeakMeter};

/// Peak hold before the held value starts decaying, in ms.
const PEAK_HOLD_MS: f64 = 1000.0;
/// Per-call decay of the held peak once the hold has elapsed.
const PEAK_DECAY: f32 = 0.95;
const CLIP_THRESHOLD_DB: f32 = -0.1;
const CLIP_RESET_MS: f64 = 100.0;
/// Limiter release time in seconds.
const LIMITER_RELEASE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterLevel {
    pub left: f32,
    pub right: f32,
    pub peak: f32,
    pub rms: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterDebugInfo {
    pub volume: f32,
    pub is_muted: bool,
    pub limiter_threshold: f32,
    pub meter_level: MasterLevel,
    pub is_clipping: bool,
    pub peak_left: f32,
    pub peak_right: f32,
}

// ═══════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════

/// Instant-attack peak limiter with exponential release.
#[derive(Debug, Clone)]
struct Limiter {
    threshold: f32,
    envelope: f32,
    release_coeff: f32,
}

impl Limiter {
    fn new(threshold_db: f32, sample_rate: f64) -> Self {
        Self {
            threshold: db_to_gain(threshold_db),
            envelope: 1.0,
            release_coeff: 1.0 - (-1.0 / (LIMITER_RELEASE * sample_rate as f32)).exp(),
        }
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        let (left, right) = buffer.stereo_mut();
        let mut right = right;
        for i in 0..left.len() {
            let mut peak = left[i].abs();
            if let Some(r) = right.as_deref() {
                peak = peak.max(r[i].abs());
            }
            let target = if peak > self.threshold {
                self.threshold / peak
            } else {
                1.0
            };
            if target < self.envelope {
                self.envelope = target;
            } else {
                self.envelope += (target - self.envelope) * self.release_coeff;
            }
            left[i] *= self.envelope;
            if let Some(r) = right.as_deref_mut() {
                r[i] *= self.envelope;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Master bus
// ═══════════════════════════════════════════════════════════════════

pub struct MasterBus {
    clock: SharedClock,
    channel: ChannelStrip,
    meter: PeakMeter,
    /// Last block RMS per channel.
    rms: [f32; 2],
    limiter_threshold_db: f32,
    limiter: Limiter,
    analyser: SpectrumTap,
    mono_scratch: Vec<f32>,

    // Linear peak hold
    peak_left: f32,
    peak_right: f32,
    last_peak_ms: f64,

    clipping: bool,
    last_clip_ms: f64,
}

impl std::fmt::Debug for MasterBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterBus")
            .field("volume_db", &self.channel.volume_db())
            .field("muted", &self.channel.is_muted())
            .field("limiter_threshold_db", &self.limiter_threshold_db)
            .field("clipping", &self.clipping)
            .finish()
    }
}

impl MasterBus {
    pub fn new(config: &EngineConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            channel: ChannelStrip::new(config.sample_rate),
            meter: PeakMeter::new(config.meter_smoothing),
            rms: [0.0; 2],
            limiter_threshold_db: config.limiter_threshold_db,
            limiter: Limiter::new(config.limiter_threshold_db, config.sample_rate),
            analyser: SpectrumTap::new(config.master_fft_size, 0.8),
            mono_scratch: vec![0.0; config.max_block_size],
            peak_left: 0.0,
            peak_right: 0.0,
            last_peak_ms: 0.0,
            clipping: false,
            last_clip_ms: 0.0,
        }
    }

    /// Fader, meter tap, limiter, then the spectrum tap.
    pub fn process(&mut self, buffer: &mut AudioBuffer) {
        let audible = !self.channel.is_muted();
        self.channel.process(buffer, audible);

        self.meter.process(buffer);
        if buffer.channels > 0 {
            self.rms = [buffer.rms(0), buffer.rms(1 % buffer.channels)];
        }

        self.limiter.process(buffer);

        let frames = buffer.frames;
        if self.mono_scratch.len() < frames {
            self.mono_scratch.resize(frames, 0.0);
        }
        let mono = &mut self.mono_scratch[..frames];
        if buffer.channels >= 2 {
            let (l, r) = (buffer.channel(0), buffer.channel(1));
            for i in 0..frames {
                mono[i] = (l[i] + r[i]) * 0.5;
            }
        } else if buffer.channels == 1 {
            mono.copy_from_slice(buffer.channel(0));
        }
        self.analyser.push(mono);
    }

    // ─────────────────────────────────────────────────────────────────
    // Fader
    // ─────────────────────────────────────────────────────────────────

    pub fn set_volume(&mut self, db: f64) -> EngineResult<()> {
        self.channel.set_volume(db)
    }

    pub fn volume_db(&self) -> f32 {
        self.channel.volume_db()
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.channel.set_mute(mute);
    }

    pub fn is_muted(&self) -> bool {
        self.channel.is_muted()
    }

    /// The limiter is built once; this only reports that.
    pub fn set_limiter_threshold(&mut self, threshold_db: f32) {
        log::warn!(
            "Limiter threshold cannot be changed dynamically ({threshold_db} dB requested). \
             Create a new MasterBus instance."
        );
    }

    pub fn limiter_threshold_db(&self) -> f32 {
        self.limiter_threshold_db
    }

    // ─────────────────────────────────────────────────────────────────
    // Metering
    // ─────────────────────────────────────────────────────────────────

    /// Current levels in dB. Also advances peak hold and the clip flag.
    pub fn level(&mut self) -> MasterLevel {
        let now = self.clock.now_ms();
        let [left, right] = self.meter.levels();

        // Both sides share one hold timer
        if left > self.peak_left {
            self.peak_left = left;
            self.last_peak_ms = now;
        } else if now - self.last_peak_ms > PEAK_HOLD_MS {
            self.peak_left *= PEAK_DECAY;
        }
        if right > self.peak_right {
            self.peak_right = right;
            self.last_peak_ms = now;
        } else if now - self.last_peak_ms > PEAK_HOLD_MS {
            self.peak_right *= PEAK_DECAY;
        }

        let left_db = gain_to_db(left);
        let right_db = gain_to_db(right);
        let peak = left_db.max(right_db);
        if peak > CLIP_THRESHOLD_DB {
            self.clipping = true;
            self.last_clip_ms = now;
        } else if now - self.last_clip_ms > CLIP_RESET_MS {
            self.clipping = false;
        }

        MasterLevel {
            left: left_db,
            right: right_db,
            peak,
            rms: gain_to_db((self.rms[0] + self.rms[1]) * 0.5),
        }
    }

    pub fn is_output_clipping(&self) -> bool {
        self.clipping
    }

    /// Held peaks in dB, left and right.
    pub fn peak_hold(&self) -> (f32, f32) {
        (gain_to_db(self.peak_left), gain_to_db(self.peak_right))
    }

    pub fn reset_peaks(&mut self) {
        self.peak_left = 0.0;
        self.peak_right = 0.0;
        self.clipping = false;
    }

    // ─────────────────────────────────────────────────────────────────
    // Analysis
    // ─────────────────────────────────────────────────────────────────

    /// Smoothed spectrum of the limited output, in dB.
    pub fn spectrum(&mut self) -> Vec<f32> {
        self.analyser.update();
        self.analyser.spectrum_db()
    }

    pub fn waveform(&self) -> Vec<f32> {
        self.analyser.waveform()
    }

    pub fn debug_info(&mut self) -> MasterDebugInfo {
        let level = self.level();
        let (peak_left, peak_right) = self.peak_hold();
        MasterDebugInfo {
            volume: self.channel.volume_db(),
            is_muted: self.channel.is_muted(),
            limiter_threshold: self.limiter_threshold_db,
            meter_level: level,
            is_clipping: self.clipping,
            peak_left,
            peak_right,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn bus(clock: &ManualClock) -> MasterBus {
        let config = EngineConfig::default().with_max_block_size(128);
        MasterBus::new(&config, Arc::new(clock.clone()))
    }

    fn feed(bus: &mut MasterBus, scratch: &mut ScratchBuffer, value: f32) {
        let mut buf = scratch.as_buffer(128);
        buf.data.fill(value);
        bus.process(&mut buf);
    }

    #[test]
    fn test_clip_flag_sets_and_resets() {
        let clock = ManualClock::new(0.0);
        let mut bus = bus(&clock);
        let mut scratch = ScratchBuffer::stereo(128);

        feed(&mut bus, &mut scratch, db_to_gain(-0.05));
        let level = bus.level();
        assert!(level.peak > CLIP_THRESHOLD_DB);
        assert!(bus.is_output_clipping());

        for _ in 0..40 {
            feed(&mut bus, &mut scratch, 0.1);
        }
        clock.advance(50.0);
        bus.level();
        assert!(bus.is_output_clipping());

        clock.advance(100.0);
        bus.level();
        assert!(!bus.is_output_clipping());
    }

    #[test]
    fn test_limiter_holds_threshold() {
        let clock = ManualClock::new(0.0);
        let mut bus = bus(&clock);
        let mut scratch = ScratchBuffer::stereo(128);
        let mut buf = scratch.as_buffer(128);
        buf.data.fill(2.0);
        bus.process(&mut buf);
        let ceiling = db_to_gain(-0.5);
        assert!(buf.data.iter().all(|s| *s <= ceiling + 1e-6));
        // Meter sits before the limiter
        assert!(bus.level().peak > 6.0);
    }

    #[test]
    fn test_peak_hold_decays_linearly_after_hold() {
        let clock = ManualClock::new(0.0);
        let mut bus = bus(&clock);
        let mut scratch = ScratchBuffer::stereo(128);
        feed(&mut bus, &mut scratch, 0.5);
        bus.level();
        for _ in 0..60 {
            feed(&mut bus, &mut scratch, 0.0);
        }
        clock.advance(500.0);
        bus.level();
        assert_eq!(bus.peak_hold().0, gain_to_db(0.5));

        clock.advance(600.0);
        bus.level();
        approx::assert_relative_eq!(bus.peak_hold().0, gain_to_db(0.5 * 0.95), epsilon = 1e-4);

        bus.reset_peaks();
        assert_eq!(bus.peak_hold(), (gain_to_db(0.0), gain_to_db(0.0)));
    }

    #[test]
    fn test_mute_and_volume() {
        let clock = ManualClock::new(0.0);
        let mut bus = bus(&clock);
        assert!(bus.set_volume(20.0).is_err());
        bus.set_mute(true);
        let mut scratch = ScratchBuffer::stereo(128);
        let mut buf = scratch.as_buffer(128);
        buf.data.fill(0.5);
        bus.process(&mut buf);
        assert!(buf.data.iter().all(|s| *s == 0.0));
        assert!(bus.debug_info().is_muted);
    }

    #[test]
    fn test_spectrum_and_waveform_sizes() {
        let clock = ManualClock::new(0.0);
        let mut bus = bus(&clock);
        assert_eq!(bus.spectrum().len(), 512);
        assert_eq!(bus.waveform().len(), 1024);
        bus.set_limiter_threshold(-3.0);
        assert_eq!(bus.limiter_threshold_db(), -0.5);
    }
}
