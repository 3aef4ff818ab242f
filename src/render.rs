// src/render.rs
//
// Offline mixdown. A job owns copies of everything it plays, so it runs
// on any thread without touching the live engine.

use std::thread::JoinHandle;

use crate::audio_buffer::{AudioBuffer, AudioData, db_to_gain};
use crate::effects::{EffectsRack, apply_pan};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::instrument::Instrument;
use crate::region::{AudioRegion, MidiRegion};
use crate::track::RegionPlayer;

/// Longest total render accepted, in seconds.
pub const MAX_RENDER_SECONDS: f64 = 30.0 * 60.0;

const PLACEHOLDER_ATTACK: f64 = 0.01;
const PLACEHOLDER_RELEASE: f64 = 0.05;
const FALLBACK_FREQUENCY: f64 = 440.0;
const FALLBACK_GAIN: f32 = 0.05;

/// Mix gain for `active` summed tracks.
pub fn master_gain_for(active: usize) -> f32 {
    match active {
        0 => 0.1,
        1 => 0.5,
        2..=3 => 0.8,
        n => 0.6 / (n as f32).sqrt(),
    }
}

/// Placeholder tone gain for a track at `volume_db` among `active` tracks.
pub fn placeholder_gain(volume_db: f32, active: usize) -> f32 {
    if volume_db != 0.0 {
        return db_to_gain(volume_db);
    }
    match active {
        0..=1 => 0.32,
        2..=3 => 0.2,
        _ => 0.15,
    }
}

/// Sine played by a track with nothing on it.
#[derive(Debug, Clone, Copy)]
pub struct Placeholder {
    pub frequency: f64,
    pub gain: f32,
}

/// Everything one track contributes to a render.
#[derive(Debug)]
pub struct RenderTrack {
    pub name: String,
    pub regions: Vec<AudioRegion>,
    pub midi_regions: Vec<MidiRegion>,
    pub instrument: Option<Instrument>,
    pub rack: EffectsRack,
    /// Linear track volume.
    pub gain: f32,
    pub pan: f32,
    pub placeholder: Option<Placeholder>,
}

/// An isolated offline render.
#[derive(Debug)]
pub struct RenderJob {
    sample_rate: f64,
    max_block: usize,
    duration: f64,
    frames: usize,
    tracks: Vec<RenderTrack>,
}

impl RenderJob {
    /// Validate the timing and size the output.
    pub fn new(sample_rate: f64, max_block: usize, duration: f64, tail: f64) -> EngineResult<Self> {
        if !(duration.is_finite() && duration > 0.0) {
            return Err(EngineError::invalid_parameter(
                "Render duration must be greater than zero",
            ));
        }
        if !(tail.is_finite() && tail >= 0.0) {
            return Err(EngineError::invalid_parameter(
                "Render tail must be zero or more",
            ));
        }
        let total = duration + tail;
        if total > MAX_RENDER_SECONDS {
            return Err(EngineError::new(
                ErrorCode::ExportError,
                format!("Render length {total:.1}s exceeds the {MAX_RENDER_SECONDS}s limit"),
            ));
        }
        Ok(Self {
            sample_rate,
            max_block: max_block.max(1),
            duration,
            frames: (total * sample_rate).floor() as usize,
            tracks: Vec::new(),
        })
    }

    pub fn add_track(&mut self, track: RenderTrack) {
        self.tracks.push(track);
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Render to stereo audio at the engine sample rate.
    pub fn run(mut self) -> EngineResult<AudioData> {
        let frames = self.frames;
        let mut left = vec![0.0_f32; frames];
        let mut right = vec![0.0_f32; frames];

        if self.tracks.is_empty() {
            let tone_frames = ((self.duration.min(1.0)) * self.sample_rate) as usize;
            for i in 0..tone_frames.min(frames) {
                let t = i as f64 / self.sample_rate;
                let s = (std::f64::consts::TAU * FALLBACK_FREQUENCY * t).sin() as f32 * FALLBACK_GAIN;
                left[i] = s;
                right[i] = s;
            }
            log::info!("Offline render: no active tracks, rendered fallback tone");
            return AudioData::new(self.sample_rate, vec![left, right]);
        }

        let master_gain = master_gain_for(self.tracks.len());
        let mut block = vec![0.0_f32; 2 * self.max_block];
        let (sample_rate, duration, max_block) = (self.sample_rate, self.duration, self.max_block);

        for track in &mut self.tracks {
            let players: Vec<RegionPlayer> = track
                .regions
                .iter()
                .map(|r| RegionPlayer::new(r.clone()))
                .collect();
            if let Some(instrument) = track.instrument.as_mut() {
                for region in &track.midi_regions {
                    for note in region.notes() {
                        instrument.play_note(
                            note.pitch,
                            note.velocity,
                            note.duration,
                            region.start_time() + note.time,
                        );
                    }
                }
            }

            let mut offset = 0;
            while offset < frames {
                let n = (frames - offset).min(max_block);
                let mut buf = AudioBuffer::new(&mut block[..2 * n], 2);
                buf.clear();

                for player in &players {
                    player.render(offset as i64, sample_rate, 1.0, &mut buf);
                }
                if let Some(instrument) = track.instrument.as_mut() {
                    instrument.render(offset as f64 / sample_rate, &mut buf);
                }
                if track.gain != 1.0 {
                    buf.scale(track.gain);
                }
                if let Some(tone) = track.placeholder {
                    render_placeholder(tone, offset, sample_rate, duration, &mut buf);
                }

                track.rack.process(&mut buf);
                if track.pan != 0.0 {
                    apply_pan(&mut buf, track.pan);
                }

                for i in 0..n {
                    left[offset + i] += buf.data[i] * master_gain;
                    right[offset + i] += buf.data[n + i] * master_gain;
                }
                offset += n;
            }
            log::debug!("Offline render: mixed track {}", track.name);
        }

        log::info!(
            "Offline render: {} track(s), {:.2}s",
            self.tracks.len(),
            frames as f64 / sample_rate
        );
        AudioData::new(sample_rate, vec![left, right])
    }

    /// Run on a worker thread.
    pub fn spawn(self) -> RenderHandle {
        RenderHandle {
            handle: std::thread::spawn(move || self.run()),
        }
    }
}

fn render_placeholder(
    tone: Placeholder,
    offset: usize,
    sample_rate: f64,
    duration: f64,
    buf: &mut AudioBuffer,
) {
    let hold_end = (duration - PLACEHOLDER_RELEASE).max(PLACEHOLDER_ATTACK);
    for i in 0..buf.frames {
        let t = (offset + i) as f64 / sample_rate;
        if t >= duration {
            break;
        }
        let envelope = if t < PLACEHOLDER_ATTACK {
            t / PLACEHOLDER_ATTACK
        } else if t < hold_end {
            1.0
        } else {
            ((duration - t) / (duration - hold_end)).max(0.0)
        };
        let s = ((std::f64::consts::TAU * tone.frequency * t).sin() * envelope) as f32 * tone.gain;
        for ch in 0..buf.channels {
            buf.data[ch * buf.frames + i] += s;
        }
    }
}

/// Pending render started by [`RenderJob::spawn`].
#[derive(Debug)]
pub struct RenderHandle {
    handle: JoinHandle<EngineResult<AudioData>>,
}

impl RenderHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the render completes.
    pub fn wait(self) -> EngineResult<AudioData> {
        self.handle.join().map_err(|_| {
            EngineError::new(ErrorCode::ExportError, "Offline render thread panicked")
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{EffectKind, create_effect};
    use crate::region::AudioRegionConfig;
    use approx::assert_relative_eq;

    const SR: f64 = 1000.0;

    fn empty_track() -> RenderTrack {
        RenderTrack {
            name: "T".into(),
            regions: Vec::new(),
            midi_regions: Vec::new(),
            instrument: None,
            rack: EffectsRack::new(SR, 64),
            gain: 1.0,
            pan: 0.0,
            placeholder: None,
        }
    }

    #[test]
    fn test_timing_validation() {
        assert_eq!(
            RenderJob::new(SR, 64, 0.0, 0.0).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            RenderJob::new(SR, 64, 1.0, -1.0).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            RenderJob::new(SR, 64, 1800.0, 1.0).unwrap_err().code(),
            ErrorCode::ExportError
        );
        assert_eq!(RenderJob::new(SR, 64, 1.5, 0.25).unwrap().frames(), 1750);
    }

    #[test]
    fn test_gain_tables() {
        assert_eq!(master_gain_for(1), 0.5);
        assert_eq!(master_gain_for(3), 0.8);
        assert_relative_eq!(master_gain_for(4), 0.3);
        assert_eq!(placeholder_gain(0.0, 1), 0.32);
        assert_eq!(placeholder_gain(0.0, 3), 0.2);
        assert_eq!(placeholder_gain(0.0, 9), 0.15);
        assert_relative_eq!(placeholder_gain(-6.0, 1), db_to_gain(-6.0));
    }

    #[test]
    fn test_fallback_tone_without_tracks() {
        let audio = RenderJob::new(SR, 64, 2.0, 0.0).unwrap().run().unwrap();
        assert_eq!(audio.num_channels(), 2);
        assert_eq!(audio.frames(), 2000);
        assert!(audio.channel(0)[..1000].iter().any(|s| s.abs() > 0.04));
        assert!(audio.channel(0)[1000..].iter().all(|s| *s == 0.0));
        assert!(audio.peak() <= FALLBACK_GAIN + 1e-6);
    }

    #[test]
    fn test_region_is_mixed_with_track_and_master_gain() {
        let data = AudioData::new(SR, vec![vec![0.5; 500]]).unwrap();
        let region = AudioRegion::new(data, AudioRegionConfig::at(0.25)).unwrap();
        let mut track = empty_track();
        track.regions.push(region);
        track.gain = 0.5;

        let mut job = RenderJob::new(SR, 64, 1.0, 0.5).unwrap();
        job.add_track(track);
        let audio = job.run().unwrap();

        assert_eq!(audio.channel(0)[100], 0.0);
        // 0.5 sample × 0.5 volume × 0.5 master
        assert_relative_eq!(audio.channel(0)[400], 0.125);
        assert_relative_eq!(audio.channel(1)[400], 0.125);
        assert_eq!(audio.channel(0)[800], 0.0);
    }

    #[test]
    fn test_placeholder_envelope_and_rack() {
        let mut track = empty_track();
        track.placeholder = Some(Placeholder {
            frequency: 50.0,
            gain: 0.32,
        });
        track.rack.add_effect(create_effect(EffectKind::Gain), None).unwrap();

        let mut job = RenderJob::new(SR, 64, 1.0, 0.5).unwrap();
        job.add_track(track);
        let audio = job.run().unwrap();
        let left = audio.channel(0);

        assert_eq!(left[0], 0.0);
        assert!(left[100..900].iter().any(|s| s.abs() > 0.1));
        assert!(left[1000..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_spawned_render_completes() {
        let mut job = RenderJob::new(SR, 64, 0.5, 0.0).unwrap();
        job.add_track(empty_track());
        let audio = job.spawn().wait().unwrap();
        assert_eq!(audio.frames(), 500);
    }
}
