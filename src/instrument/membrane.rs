// src/instrument/membrane.rs

use crate::audio_buffer::{AudioBuffer, db_to_gain};

use super::AttackReleaseTrigger;

const PITCH_DECAY: f64 = 0.05;
const OCTAVES: f64 = 10.0;
const ATTACK: f64 = 0.001;
const DECAY: f64 = 0.3;
/// Amplitude below which a hit is considered finished.
const SILENCE: f64 = 1e-4;

#[derive(Debug, Clone, Copy)]
struct Hit {
    time: f64,
    frequency: f64,
    duration: f64,
    velocity: f32,
}

#[derive(Debug, Clone, Copy)]
struct Sounding {
    frequency: f64,
    duration: f64,
    velocity: f32,
    /// Seconds since the hit started.
    elapsed: f64,
    phase: f64,
}

/// Monophonic pitch-dropping sine, used for metronome clicks.
///
/// Each hit sweeps from `frequency · OCTAVES` down to `frequency` over
/// `PITCH_DECAY`, with a short linear attack and an exponential decay.
#[derive(Debug)]
pub struct MembraneSynth {
    sample_rate: f64,
    volume_db: f32,
    gain: f32,
    pending: Vec<Hit>,
    current: Option<Sounding>,
}

impl MembraneSynth {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            volume_db: 0.0,
            gain: 1.0,
            pending: Vec::with_capacity(16),
            current: None,
        }
    }

    pub fn with_volume_db(mut self, volume_db: f32) -> Self {
        self.volume_db = volume_db;
        self.gain = db_to_gain(volume_db);
        self
    }

    pub fn is_sounding(&self) -> bool {
        self.current.is_some()
    }

    fn next_sample(&mut self) -> f32 {
        let Some(hit) = self.current.as_mut() else {
            return 0.0;
        };
        let t = hit.elapsed;

        let frequency = if t < PITCH_DECAY {
            let start = hit.frequency * OCTAVES;
            start * (hit.frequency / start).powf(t / PITCH_DECAY)
        } else {
            hit.frequency
        };

        let mut amp = if t < ATTACK {
            t / ATTACK
        } else {
            (-(t - ATTACK) * 5.0 / DECAY).exp()
        };
        if t > hit.duration {
            // Short release after the note length
            amp *= (-(t - hit.duration) / 0.01).exp();
        }

        let sample = (hit.phase.sin() * amp) as f32 * hit.velocity;
        hit.phase = (hit.phase + std::f64::consts::TAU * frequency / self.sample_rate)
            % std::f64::consts::TAU;
        hit.elapsed += 1.0 / self.sample_rate;

        if t > ATTACK && amp < SILENCE {
            self.current = None;
        }
        sample
    }
}

impl AttackReleaseTrigger for MembraneSynth {
    fn trigger_attack_release(&mut self, frequency: f64, duration: f64, time: f64, velocity: f32) {
        let hit = Hit {
            time,
            frequency,
            duration,
            velocity,
        };
        let index = self.pending.partition_point(|h| h.time <= time);
        self.pending.insert(index, hit);
    }

    fn render(&mut self, start_time: f64, buffer: &mut AudioBuffer) {
        let frames = buffer.frames;
        let channels = buffer.channels;

        for i in 0..frames {
            let mut due = 0;
            while due < self.pending.len() {
                let offset = ((self.pending[due].time - start_time) * self.sample_rate).round();
                if offset > i as f64 {
                    break;
                }
                due += 1;
            }
            if due > 0 {
                // Monophonic: the latest due hit wins
                let hit = self.pending[due - 1];
                self.current = Some(Sounding {
                    frequency: hit.frequency,
                    duration: hit.duration,
                    velocity: hit.velocity,
                    elapsed: 0.0,
                    phase: 0.0,
                });
                self.pending.drain(..due);
            }

            if self.current.is_none() {
                continue;
            }
            let sample = self.next_sample() * self.gain;
            for ch in 0..channels {
                buffer.data[ch * frames + i] += sample;
            }
        }
    }

    fn release_all(&mut self) {
        self.pending.clear();
        self.current = None;
    }

    fn instance(&self) -> Box<dyn AttackReleaseTrigger> {
        Box::new(MembraneSynth::new(self.sample_rate).with_volume_db(self.volume_db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;

    #[test]
    fn test_click_decays_to_silence() {
        let mut synth = MembraneSynth::new(8000.0);
        synth.trigger_attack_release(261.63, 0.25, 0.0, 1.0);

        let mut scratch = ScratchBuffer::stereo(8000);
        let mut buf = scratch.cleared(8000);
        synth.render(0.0, &mut buf);

        let head = buf.channel(0)[..800].iter().fold(0.0_f32, |a, s| a.max(s.abs()));
        assert!(head > 0.1);
        assert!(!synth.is_sounding());
        assert!(buf.channel(0)[7000..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_hit_waits_for_its_time() {
        let mut synth = MembraneSynth::new(1000.0);
        synth.trigger_attack_release(440.0, 0.1, 1.0, 1.0);
        let mut scratch = ScratchBuffer::stereo(100);
        let mut buf = scratch.cleared(100);
        synth.render(0.0, &mut buf);
        assert!(buf.data.iter().all(|s| *s == 0.0));
        assert!(!synth.is_sounding());
    }
}
