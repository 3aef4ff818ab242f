// src/track/player.rs
//
// Timeline player bound to one audio region.

use crate::audio_buffer::AudioBuffer;
use crate::region::AudioRegion;

/// Plays an [`AudioRegion`] wherever the transport crosses it.
///
/// The player holds its own copy of the region (the samples are shared),
/// so an edit reaches playback only when the track rebuilds the player.
#[derive(Debug, Clone)]
pub struct RegionPlayer {
    region: AudioRegion,
}

impl RegionPlayer {
    pub fn new(region: AudioRegion) -> Self {
        Self { region }
    }

    #[inline]
    pub fn region_id(&self) -> &str {
        self.region.id()
    }

    /// True while the timeline position lies inside the region.
    #[inline]
    pub fn is_playing_at(&self, seconds: f64) -> bool {
        self.region.contains(seconds)
    }

    /// Mix the frames starting at transport sample `position` into `out`,
    /// scaled by `gain`.
    pub fn render(&self, position: i64, sample_rate: f64, gain: f32, out: &mut AudioBuffer) {
        let frames = out.frames;
        let block_start = position as f64 / sample_rate;
        let block_end = (position + frames as i64) as f64 / sample_rate;
        if !self.region.overlaps_range(block_start, block_end) {
            return;
        }

        let buffer = self.region.buffer();
        let source_rate = buffer.sample_rate();
        let buffer_duration = buffer.duration();
        let loop_length = buffer_duration - self.region.offset();

        for i in 0..frames {
            let t = (position + i as i64) as f64 / sample_rate;
            let g = self.region.gain_at(t) * gain;
            if g == 0.0 {
                continue;
            }
            let mut source = self.region.source_position(t);
            if self.region.is_looped() && source >= buffer_duration && loop_length > 0.0 {
                source = self.region.offset() + (source - self.region.offset()) % loop_length;
            }
            let frame = source * source_rate;
            for ch in 0..out.channels {
                out.data[ch * frames + i] += buffer.sample_at(ch, frame) * g;
            }
        }
    }
}
