// src/region/audio.rs
//
// Audio regions: a time interval on a track that reads from a sample buffer.

use serde::Serialize;

use crate::audio_buffer::AudioData;
use crate::error::{EngineError, EngineResult};
use crate::ids::{self, RegionId, TrackId};

use super::{check_start_time, check_trim};

/// Construction options for an [`AudioRegion`].
#[derive(Debug, Clone)]
pub struct AudioRegionConfig {
    pub id: Option<RegionId>,
    pub track_id: Option<TrackId>,
    pub name: Option<String>,
    pub start_time: f64,
    /// Defaults to the buffer duration minus `offset`.
    pub duration: Option<f64>,
    pub offset: f64,
    pub gain: f32,
    pub fade_in: f64,
    pub fade_out: f64,
    pub looped: bool,
    pub playback_rate: f64,
}

impl Default for AudioRegionConfig {
    fn default() -> Self {
        Self {
            id: None,
            track_id: None,
            name: None,
            start_time: 0.0,
            duration: None,
            offset: 0.0,
            gain: 1.0,
            fade_in: 0.0,
            fade_out: 0.0,
            looped: false,
            playback_rate: 1.0,
        }
    }
}

impl AudioRegionConfig {
    pub fn at(start_time: f64) -> Self {
        Self {
            start_time,
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_fades(mut self, fade_in: f64, fade_out: f64) -> Self {
        self.fade_in = fade_in;
        self.fade_out = fade_out;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_playback_rate(mut self, rate: f64) -> Self {
        self.playback_rate = rate;
        self
    }
}

/// Time-positioned reference into an [`AudioData`] buffer.
#[derive(Debug, Clone)]
pub struct AudioRegion {
    id: RegionId,
    track_id: Option<TrackId>,
    name: String,
    buffer: AudioData,
    start_time: f64,
    duration: f64,
    offset: f64,
    gain: f32,
    fade_in: f64,
    fade_out: f64,
    looped: bool,
    playback_rate: f64,
}

impl AudioRegion {
    pub fn new(buffer: AudioData, config: AudioRegionConfig) -> EngineResult<Self> {
        if !(config.start_time.is_finite() && config.start_time >= 0.0) {
            return Err(EngineError::invalid_clip("Clip start time must be non-negative"));
        }

        let buffer_duration = buffer.duration();
        if !(config.offset.is_finite() && config.offset >= 0.0) {
            return Err(EngineError::invalid_clip("Clip offset must be non-negative"));
        }
        let duration = config
            .duration
            .unwrap_or(buffer_duration - config.offset);
        if !(duration.is_finite() && duration > 0.0) {
            return Err(EngineError::invalid_clip("Clip duration must be positive"));
        }
        // Tolerate float noise at the buffer edge.
        if config.offset + duration > buffer_duration + 1e-9 {
            return Err(EngineError::invalid_clip(format!(
                "Clip offset + duration ({:.6}s) exceeds buffer duration ({:.6}s)",
                config.offset + duration,
                buffer_duration
            )));
        }

        let id = config.id.unwrap_or_else(|| ids::generate("clip"));
        let name = config
            .name
            .unwrap_or_else(|| format!("Clip {}", ids::short(&id)));

        let mut region = Self {
            id,
            track_id: config.track_id,
            name,
            buffer,
            start_time: config.start_time,
            duration,
            offset: config.offset,
            gain: 1.0,
            fade_in: 0.0,
            fade_out: 0.0,
            looped: config.looped,
            playback_rate: 1.0,
        };
        region.set_gain(config.gain)?;
        region.set_playback_rate(config.playback_rate)?;
        region.set_fade_in(config.fade_in)?;
        region.set_fade_out(config.fade_out)?;
        Ok(region)
    }

    // ─────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn track_id(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    pub fn set_track_id(&mut self, track_id: impl Into<TrackId>) {
        self.track_id = Some(track_id.into());
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline]
    pub fn buffer(&self) -> &AudioData {
        &self.buffer
    }

    #[inline]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    #[inline]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    #[inline]
    pub fn offset(&self) -> f64 {
        self.offset
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) -> EngineResult<()> {
        if !(gain.is_finite() && gain >= 0.0) {
            return Err(EngineError::invalid_parameter(
                "Clip gain must be a non-negative number",
            ));
        }
        self.gain = gain;
        Ok(())
    }

    #[inline]
    pub fn fade_in(&self) -> f64 {
        self.fade_in
    }

    pub fn set_fade_in(&mut self, seconds: f64) -> EngineResult<()> {
        self.fade_in = self.check_fade(seconds)?;
        Ok(())
    }

    #[inline]
    pub fn fade_out(&self) -> f64 {
        self.fade_out
    }

    pub fn set_fade_out(&mut self, seconds: f64) -> EngineResult<()> {
        self.fade_out = self.check_fade(seconds)?;
        Ok(())
    }

    fn check_fade(&self, seconds: f64) -> EngineResult<f64> {
        if !(seconds.is_finite() && seconds >= 0.0 && seconds <= self.duration) {
            return Err(EngineError::invalid_parameter(format!(
                "Fade length must be between 0 and the clip duration ({:.3}s)",
                self.duration
            )));
        }
        Ok(seconds)
    }

    #[inline]
    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn set_looped(&mut self, looped: bool) {
        self.looped = looped;
    }

    #[inline]
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    pub fn set_playback_rate(&mut self, rate: f64) -> EngineResult<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(EngineError::invalid_parameter(
                "Playback rate must be positive",
            ));
        }
        self.playback_rate = rate;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Time queries
    // ─────────────────────────────────────────────────────────────────

    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time()
    }

    #[inline]
    pub fn overlaps_range(&self, start: f64, end: f64) -> bool {
        self.start_time < end && self.end_time() > start
    }

    pub fn overlaps(&self, other: &AudioRegion) -> bool {
        self.overlaps_range(other.start_time, other.end_time())
    }

    /// Gain at timeline `time`, including fades. Zero outside the region.
    pub fn gain_at(&self, time: f64) -> f32 {
        if !self.contains(time) {
            return 0.0;
        }
        let local = time - self.start_time;
        let mut envelope = 1.0;
        if self.fade_in > 0.0 && local < self.fade_in {
            envelope *= local / self.fade_in;
        }
        let remaining = self.duration - local;
        if self.fade_out > 0.0 && remaining < self.fade_out {
            envelope *= remaining / self.fade_out;
        }
        self.gain * envelope as f32
    }

    /// Buffer position (seconds) read at timeline `time`.
    #[inline]
    pub fn source_position(&self, time: f64) -> f64 {
        self.offset + (time - self.start_time) * self.playback_rate
    }

    // ─────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────

    pub fn move_to(&mut self, time: f64) -> EngineResult<()> {
        check_start_time(time)?;
        self.start_time = time;
        Ok(())
    }

    /// Remove `amount` seconds from the head of the region.
    pub fn trim_start(&mut self, amount: f64) -> EngineResult<()> {
        let duration = check_trim(self.duration, amount)?;
        self.offset += amount;
        self.start_time += amount;
        self.duration = duration;
        self.clamp_fades();
        Ok(())
    }

    /// Remove `amount` seconds from the tail of the region.
    pub fn trim_end(&mut self, amount: f64) -> EngineResult<()> {
        self.duration = check_trim(self.duration, amount)?;
        self.clamp_fades();
        Ok(())
    }

    fn clamp_fades(&mut self) {
        self.fade_in = self.fade_in.min(self.duration);
        self.fade_out = self.fade_out.min(self.duration);
    }

    /// Split at timeline `time`. The receiver keeps the head; the returned
    /// region holds the tail and takes over the fade-out.
    ///
    /// Returns `None` unless `start < time < end`: a split at the start
    /// edge would leave a zero-length head.
    pub fn split(&mut self, time: f64) -> Option<AudioRegion> {
        if time <= self.start_time || time >= self.end_time() {
            return None;
        }
        let head = time - self.start_time;
        let id = ids::generate("clip");

        let tail = AudioRegion {
            name: format!("{} (split)", self.name),
            id,
            track_id: self.track_id.clone(),
            buffer: self.buffer.clone(),
            start_time: time,
            duration: self.duration - head,
            offset: self.offset + head,
            gain: self.gain,
            fade_in: 0.0,
            fade_out: self.fade_out.min(self.duration - head),
            looped: self.looped,
            playback_rate: self.playback_rate,
        };

        self.duration = head;
        self.fade_out = 0.0;
        self.fade_in = self.fade_in.min(head);
        Some(tail)
    }

    /// Copy with a fresh identity.
    pub fn duplicate(&self) -> AudioRegion {
        AudioRegion {
            id: ids::generate("clip"),
            name: format!("{} (copy)", self.name),
            ..self.clone()
        }
    }

    pub fn summary(&self) -> AudioRegionSummary {
        AudioRegionSummary {
            id: self.id.clone(),
            track_id: self.track_id.clone(),
            name: self.name.clone(),
            start_time: self.start_time,
            duration: self.duration,
            offset: self.offset,
            gain: self.gain,
            fade_in: self.fade_in,
            fade_out: self.fade_out,
            looped: self.looped,
            playback_rate: self.playback_rate,
            buffer_duration: self.buffer.duration(),
            buffer_channels: self.buffer.num_channels(),
            buffer_sample_rate: self.buffer.sample_rate(),
        }
    }
}

/// Serializable description of an audio region (samples excluded).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRegionSummary {
    pub id: RegionId,
    pub track_id: Option<TrackId>,
    pub name: String,
    pub start_time: f64,
    pub duration: f64,
    pub offset: f64,
    pub gain: f32,
    pub fade_in: f64,
    pub fade_out: f64,
    pub looped: bool,
    pub playback_rate: f64,
    pub buffer_duration: f64,
    pub buffer_channels: usize,
    pub buffer_sample_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use approx::assert_relative_eq;

    fn buffer(seconds: f64) -> AudioData {
        let sr = 100.0;
        AudioData::new(sr, vec![vec![0.5; (seconds * sr) as usize]]).unwrap()
    }

    fn region(start: f64, seconds: f64) -> AudioRegion {
        AudioRegion::new(buffer(seconds), AudioRegionConfig::at(start)).unwrap()
    }

    #[test]
    fn test_defaults_from_buffer() {
        let r = region(2.0, 4.0);
        assert_eq!(r.duration(), 4.0);
        assert_eq!(r.end_time(), 6.0);
        assert_eq!(r.gain(), 1.0);
        assert!(r.name().starts_with("Clip "));
    }

    #[test]
    fn test_construction_rejects_bad_bounds() {
        let code = |cfg: AudioRegionConfig| AudioRegion::new(buffer(4.0), cfg).unwrap_err().code();
        assert_eq!(code(AudioRegionConfig::at(-1.0)), ErrorCode::InvalidClipData);
        assert_eq!(
            code(AudioRegionConfig::at(0.0).with_duration(0.0)),
            ErrorCode::InvalidClipData
        );
        assert_eq!(
            code(AudioRegionConfig::at(0.0).with_offset(1.0).with_duration(3.5)),
            ErrorCode::InvalidClipData
        );
    }

    #[test]
    fn test_split_scenario() {
        let mut original = region(2.0, 4.0);
        original.set_fade_out(0.5).unwrap();
        original.set_fade_in(0.25).unwrap();

        let tail = original.split(4.0).unwrap();
        assert_eq!(original.start_time(), 2.0);
        assert_eq!(original.end_time(), 4.0);
        assert_eq!(original.fade_out(), 0.0);

        assert_eq!(tail.start_time(), 4.0);
        assert_eq!(tail.end_time(), 6.0);
        assert_eq!(tail.offset(), 2.0);
        assert_eq!(tail.fade_in(), 0.0);
        assert_eq!(tail.fade_out(), 0.5);
        assert_ne!(tail.id(), original.id());
        assert_relative_eq!(original.duration() + tail.duration(), 4.0);
    }

    #[test]
    fn test_split_outside_returns_none() {
        let mut r = region(2.0, 4.0);
        assert!(r.split(1.0).is_none());
        // Start edge would leave an empty head
        assert!(r.split(2.0).is_none());
        assert!(r.split(6.0).is_none());
        assert!(r.split(7.5).is_none());
        assert_eq!(r.duration(), 4.0);
    }

    #[test]
    fn test_trim_failure_leaves_region_untouched() {
        let mut r = region(1.0, 2.0);
        assert!(r.trim_start(2.0).is_err());
        assert!(r.trim_end(3.0).is_err());
        assert!(r.trim_end(-0.5).is_err());
        assert_eq!(r.start_time(), 1.0);
        assert_eq!(r.duration(), 2.0);

        r.trim_start(0.5).unwrap();
        assert_eq!(r.start_time(), 1.5);
        assert_eq!(r.offset(), 0.5);
        assert_eq!(r.duration(), 1.5);

        r.trim_end(0.5).unwrap();
        assert_eq!(r.duration(), 1.0);
    }

    #[test]
    fn test_move_rejects_negative() {
        let mut r = region(1.0, 1.0);
        assert_eq!(r.move_to(-0.1).unwrap_err().code(), ErrorCode::InvalidParameter);
        r.move_to(3.0).unwrap();
        assert_eq!(r.start_time(), 3.0);
    }

    #[test]
    fn test_gain_envelope_with_fades() {
        let mut r = region(0.0, 2.0);
        r.set_fade_in(1.0).unwrap();
        r.set_fade_out(1.0).unwrap();
        assert_relative_eq!(r.gain_at(0.5), 0.5, epsilon = 1e-6);
        assert_relative_eq!(r.gain_at(1.5), 0.5, epsilon = 1e-6);
        assert_eq!(r.gain_at(2.0), 0.0);
    }

    #[test]
    fn test_duplicate_has_new_identity() {
        let r = region(0.0, 1.0);
        let copy = r.duplicate();
        assert_ne!(copy.id(), r.id());
        assert!(copy.name().ends_with("(copy)"));
        assert_eq!(copy.start_time(), r.start_time());
    }

    #[test]
    fn test_summary_reports_buffer() {
        let json = serde_json::to_value(region(0.0, 1.0).summary()).unwrap();
        assert_eq!(json["bufferChannels"], 1);
        assert_eq!(json["bufferSampleRate"], 100.0);
    }
}
