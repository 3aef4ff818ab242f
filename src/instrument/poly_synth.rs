// src/instrument/poly_synth.rs

use crate::audio_buffer::{AudioBuffer, db_to_gain};

use super::{Adsr, GateTrigger};

#[derive(Debug, Clone, Copy)]
enum TriggerKind {
    Attack { velocity: f32 },
    Release,
}

#[derive(Debug, Clone, Copy)]
struct Trigger {
    time: f64,
    frequency: f64,
    kind: TriggerKind,
}

#[derive(Debug, Clone)]
struct SynthVoice {
    active: bool,
    gate: bool,
    frequency: f64,
    velocity: f32,
    phase: f64,
    /// Allocation counter value at note-on; lowest is oldest.
    started: u64,
    envelope: Adsr,
}

impl SynthVoice {
    fn new(sample_rate: f64) -> Self {
        Self {
            active: false,
            gate: false,
            frequency: 0.0,
            velocity: 0.0,
            phase: 0.0,
            started: 0,
            envelope: Adsr::new(sample_rate as f32),
        }
    }
}

/// Polyphonic sine synth with per-voice ADSR.
///
/// Triggers are queued with their render-clock time and applied at the
/// exact frame inside `render`.
#[derive(Debug)]
pub struct PolySynth {
    sample_rate: f64,
    volume_db: f32,
    gain: f32,
    voices: Vec<SynthVoice>,
    /// Sorted by time; equal times keep arrival order.
    pending: Vec<Trigger>,
    alloc_counter: u64,
}

impl PolySynth {
    pub fn new(sample_rate: f64, polyphony: usize, volume_db: f32) -> Self {
        Self {
            sample_rate,
            volume_db,
            gain: db_to_gain(volume_db),
            voices: (0..polyphony.max(1)).map(|_| SynthVoice::new(sample_rate)).collect(),
            pending: Vec::with_capacity(64),
            alloc_counter: 0,
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn enqueue(&mut self, trigger: Trigger) {
        let index = self.pending.partition_point(|t| t.time <= trigger.time);
        self.pending.insert(index, trigger);
    }

    /// First inactive voice, otherwise steal the oldest.
    fn note_on(&mut self, frequency: f64, velocity: f32) {
        self.alloc_counter += 1;
        let counter = self.alloc_counter;
        let index = match self.voices.iter().position(|v| !v.active) {
            Some(i) => i,
            None => self
                .voices
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.started)
                .map(|(i, _)| i)
                .unwrap_or(0),
        };
        let voice = &mut self.voices[index];
        let stolen = voice.active;
        voice.active = true;
        voice.gate = true;
        voice.frequency = frequency;
        voice.velocity = velocity;
        voice.started = counter;
        if stolen {
            voice.phase = 0.0;
        }
        voice.envelope.trigger(stolen);
    }

    fn note_off(&mut self, frequency: f64) {
        if let Some(v) = self
            .voices
            .iter_mut()
            .filter(|v| v.active && v.gate && v.frequency == frequency)
            .min_by_key(|v| v.started)
        {
            v.gate = false;
            v.envelope.release();
        }
    }

    fn apply(&mut self, trigger: Trigger) {
        match trigger.kind {
            TriggerKind::Attack { velocity } => self.note_on(trigger.frequency, velocity),
            TriggerKind::Release => self.note_off(trigger.frequency),
        }
    }
}

impl GateTrigger for PolySynth {
    fn trigger_attack(&mut self, frequency: f64, time: f64, velocity: f32) {
        self.enqueue(Trigger {
            time,
            frequency,
            kind: TriggerKind::Attack { velocity },
        });
    }

    fn trigger_release(&mut self, frequency: f64, time: f64) {
        self.enqueue(Trigger {
            time,
            frequency,
            kind: TriggerKind::Release,
        });
    }

    fn render(&mut self, start_time: f64, buffer: &mut AudioBuffer) {
        let frames = buffer.frames;
        let channels = buffer.channels;
        let two_pi = std::f64::consts::TAU;

        for i in 0..frames {
            // Apply triggers due at or before this frame
            let mut due = 0;
            while due < self.pending.len() {
                let offset = ((self.pending[due].time - start_time) * self.sample_rate).round();
                if offset > i as f64 {
                    break;
                }
                due += 1;
            }
            if due > 0 {
                for k in 0..due {
                    let trigger = self.pending[k];
                    self.apply(trigger);
                }
                self.pending.drain(..due);
            }

            let mut sample = 0.0_f32;
            for voice in self.voices.iter_mut().filter(|v| v.active) {
                let env = voice.envelope.next_sample();
                sample += (voice.phase.sin() as f32) * env * voice.velocity;
                voice.phase = (voice.phase + two_pi * voice.frequency / self.sample_rate) % two_pi;
                if !voice.gate && voice.envelope.is_idle() {
                    voice.active = false;
                }
            }

            if sample != 0.0 {
                let sample = sample * self.gain;
                for ch in 0..channels {
                    buffer.data[ch * frames + i] += sample;
                }
            }
        }
    }

    fn release_all(&mut self) {
        self.pending.clear();
        for voice in self.voices.iter_mut().filter(|v| v.active) {
            voice.gate = false;
            voice.envelope.release();
        }
    }

    fn instance(&self) -> Box<dyn GateTrigger> {
        Box::new(PolySynth::new(self.sample_rate, self.voices.len(), self.volume_db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;

    #[test]
    fn test_attack_lands_on_exact_frame() {
        let mut synth = PolySynth::new(1000.0, 4, 0.0);
        synth.trigger_attack(250.0, 0.010, 1.0);

        let mut scratch = ScratchBuffer::stereo(32);
        let mut buf = scratch.cleared(32);
        synth.render(0.0, &mut buf);

        assert!(buf.channel(0)[..10].iter().all(|s| *s == 0.0));
        assert!(buf.channel(0)[11..].iter().any(|s| *s != 0.0));
        assert_eq!(synth.active_voices(), 1);
    }

    #[test]
    fn test_steals_oldest_when_full() {
        let mut synth = PolySynth::new(1000.0, 2, 0.0);
        synth.trigger_attack(100.0, 0.0, 1.0);
        synth.trigger_attack(200.0, 0.001, 1.0);
        synth.trigger_attack(300.0, 0.002, 1.0);

        let mut scratch = ScratchBuffer::stereo(8);
        let mut buf = scratch.cleared(8);
        synth.render(0.0, &mut buf);

        let freqs: Vec<f64> = synth.voices.iter().map(|v| v.frequency).collect();
        assert_eq!(freqs, vec![300.0, 200.0]);
    }

    #[test]
    fn test_release_frees_voice_after_tail() {
        let mut synth = PolySynth::new(1000.0, 2, 0.0);
        synth.trigger_attack(100.0, 0.0, 1.0);
        synth.trigger_release(100.0, 0.05);

        let mut scratch = ScratchBuffer::stereo(2000);
        let mut buf = scratch.cleared(2000);
        synth.render(0.0, &mut buf);
        assert_eq!(synth.active_voices(), 0);
    }
}
