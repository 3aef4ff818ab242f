// src/transport.rs

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ensure_range};

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 999.0;

//
// ===============================
// MARK: Musical metadata
// ===============================
//

/// Meter as `[numerator, denominator]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> EngineResult<Self> {
        if !(1..=32).contains(&numerator) {
            return Err(EngineError::invalid_parameter(format!(
                "Time signature numerator must be between 1 and 32, got {numerator}"
            )));
        }
        if !(1..=32).contains(&denominator) || !denominator.is_power_of_two() {
            return Err(EngineError::invalid_parameter(format!(
                "Time signature denominator must be a power of two up to 32, got {denominator}"
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl From<[u32; 2]> for TimeSignature {
    fn from([numerator, denominator]: [u32; 2]) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

impl From<TimeSignature> for [u32; 2] {
    fn from(ts: TimeSignature) -> Self {
        [ts.numerator, ts.denominator]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Loop bounds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
    pub enabled: bool,
}

//
// ===============================
// MARK: Transport
// ===============================
//

/// Global playback clock expressed in the sample domain.
///
/// The position is signed: a count-in pre-roll runs at negative
/// positions and reaches 0 on the downbeat.
#[derive(Debug, Clone)]
pub struct Transport {
    sample_rate: f64,
    bpm: f64,
    time_signature: TimeSignature,
    position: i64,
    state: PlaybackState,
    loop_region: LoopRegion,
}

impl Transport {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            bpm: 120.0,
            time_signature: TimeSignature::default(),
            position: 0,
            state: PlaybackState::Stopped,
            loop_region: LoopRegion::default(),
        }
    }

    // -------------------------------
    // MARK: Accessors
    // -------------------------------

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    #[inline]
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    #[inline]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    #[inline]
    pub fn loop_region(&self) -> LoopRegion {
        self.loop_region
    }

    /// Absolute time in seconds.
    #[inline]
    pub fn seconds(&self) -> f64 {
        self.position as f64 / self.sample_rate
    }

    #[inline]
    pub fn seconds_to_samples(&self, seconds: f64) -> i64 {
        (seconds * self.sample_rate).round() as i64
    }

    /// Length of one beat of the current meter.
    pub fn seconds_per_beat(&self) -> f64 {
        (60.0 / self.bpm) * (4.0 / self.time_signature.denominator as f64)
    }

    pub fn bar_seconds(&self) -> f64 {
        self.seconds_per_beat() * self.time_signature.numerator as f64
    }

    /// Enabled loop bounds in samples.
    pub fn loop_samples(&self) -> Option<(i64, i64)> {
        if !self.loop_region.enabled {
            return None;
        }
        let start = self.seconds_to_samples(self.loop_region.start);
        let end = self.seconds_to_samples(self.loop_region.end);
        (end > start).then_some((start, end))
    }

    // -------------------------------
    // MARK: Mutators
    // -------------------------------

    pub fn set_bpm(&mut self, bpm: f64) -> EngineResult<()> {
        ensure_range("tempo", bpm, MIN_BPM, MAX_BPM)?;
        self.bpm = bpm;
        Ok(())
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> EngineResult<()> {
        self.time_signature = TimeSignature::new(numerator, denominator)?;
        Ok(())
    }

    #[inline]
    pub fn set_position(&mut self, samples: i64) {
        self.position = samples;
    }

    pub fn set_seconds(&mut self, seconds: f64) {
        self.position = self.seconds_to_samples(seconds);
    }

    pub fn set_loop(&mut self, start: f64, end: f64, enabled: bool) -> EngineResult<()> {
        if !(start.is_finite() && end.is_finite()) || start < 0.0 || end <= start {
            return Err(EngineError::invalid_parameter(format!(
                "Loop bounds must satisfy 0 <= start < end, got [{start}, {end}]"
            )));
        }
        self.loop_region = LoopRegion {
            start,
            end,
            enabled,
        };
        Ok(())
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_region.enabled = enabled;
    }

    // -------------------------------
    // MARK: Playback state
    // -------------------------------

    pub fn start(&mut self) {
        self.state = PlaybackState::Playing;
    }

    /// Halt and keep the position.
    pub fn pause(&mut self) {
        self.state = PlaybackState::Paused;
    }

    /// Halt and rewind to zero.
    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.position = 0;
    }

    /// Advance by a number of samples.
    ///
    /// Called by the scheduler once per compiled segment.
    #[inline]
    pub(crate) fn advance(&mut self, frames: i64) {
        self.position += frames;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_beat_and_bar_lengths() {
        let mut t = Transport::new(48_000.0);
        assert_relative_eq!(t.seconds_per_beat(), 0.5);
        assert_relative_eq!(t.bar_seconds(), 2.0);

        t.set_time_signature(6, 8).unwrap();
        assert_relative_eq!(t.seconds_per_beat(), 0.25);
        assert_relative_eq!(t.bar_seconds(), 1.5);
    }

    #[test]
    fn test_tempo_range() {
        let mut t = Transport::new(48_000.0);
        assert!(t.set_bpm(19.0).is_err());
        assert!(t.set_bpm(1000.0).is_err());
        assert!(t.set_bpm(f64::NAN).is_err());
        t.set_bpm(140.0).unwrap();
        assert_eq!(t.bpm(), 140.0);
    }

    #[test]
    fn test_time_signature_validation() {
        assert!(TimeSignature::new(0, 4).is_err());
        assert!(TimeSignature::new(4, 3).is_err());
        assert!(TimeSignature::new(4, 64).is_err());
        assert!(TimeSignature::new(7, 8).is_ok());

        let json = serde_json::to_string(&TimeSignature::default()).unwrap();
        assert_eq!(json, "[4,4]");
    }

    #[test]
    fn test_stop_rewinds_pause_keeps() {
        let mut t = Transport::new(1000.0);
        t.start();
        t.advance(250);
        t.pause();
        assert_eq!(t.state(), PlaybackState::Paused);
        assert_relative_eq!(t.seconds(), 0.25);
        t.stop();
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn test_loop_validation() {
        let mut t = Transport::new(1000.0);
        assert!(t.set_loop(2.0, 1.0, true).is_err());
        assert!(t.set_loop(-1.0, 1.0, true).is_err());
        t.set_loop(1.0, 2.0, true).unwrap();
        assert_eq!(t.loop_samples(), Some((1000, 2000)));
        t.set_loop_enabled(false);
        assert_eq!(t.loop_samples(), None);
    }
}
