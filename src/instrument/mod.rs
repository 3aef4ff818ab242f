// src/instrument/mod.rs
//
// Note-playing instruments behind two trigger capabilities.

mod envelope;
mod membrane;
mod poly_synth;

pub use envelope::Adsr;
pub use membrane::MembraneSynth;
pub use poly_synth::PolySynth;

use serde::{Deserialize, Serialize};

use crate::audio_buffer::AudioBuffer;
use crate::region::pitch_to_frequency;

// ═══════════════════════════════════════════════════════════════════
// Capabilities
// ═══════════════════════════════════════════════════════════════════

/// Instrument that takes a whole note (start and length) at once.
///
/// Times are on the engine render clock, in seconds.
pub trait AttackReleaseTrigger: Send {
    fn trigger_attack_release(&mut self, frequency: f64, duration: f64, time: f64, velocity: f32);

    /// Mix the frames starting at render-clock `start_time` into `buffer`.
    fn render(&mut self, start_time: f64, buffer: &mut AudioBuffer);

    fn release_all(&mut self);

    /// Silent instance with the same settings.
    fn instance(&self) -> Box<dyn AttackReleaseTrigger>;
}

/// Instrument driven by separate attack and release calls.
pub trait GateTrigger: Send {
    fn trigger_attack(&mut self, frequency: f64, time: f64, velocity: f32);

    fn trigger_release(&mut self, frequency: f64, time: f64);

    fn render(&mut self, start_time: f64, buffer: &mut AudioBuffer);

    fn release_all(&mut self);

    fn instance(&self) -> Box<dyn GateTrigger>;
}

/// An instrument resolved to one capability at creation time.
pub enum Instrument {
    AttackRelease(Box<dyn AttackReleaseTrigger>),
    Gate(Box<dyn GateTrigger>),
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instrument::AttackRelease(_) => f.write_str("Instrument::AttackRelease"),
            Instrument::Gate(_) => f.write_str("Instrument::Gate"),
        }
    }
}

impl Instrument {
    /// Play a MIDI note at render-clock `time`.
    pub fn play_note(&mut self, pitch: u8, velocity: u8, duration: f64, time: f64) {
        let frequency = pitch_to_frequency(pitch);
        let velocity = f32::from(velocity) / 127.0;
        match self {
            Instrument::AttackRelease(inst) => {
                inst.trigger_attack_release(frequency, duration, time, velocity);
            }
            Instrument::Gate(inst) => {
                inst.trigger_attack(frequency, time, velocity);
                inst.trigger_release(frequency, time + duration);
            }
        }
    }

    pub fn render(&mut self, start_time: f64, buffer: &mut AudioBuffer) {
        match self {
            Instrument::AttackRelease(inst) => inst.render(start_time, buffer),
            Instrument::Gate(inst) => inst.render(start_time, buffer),
        }
    }

    pub fn release_all(&mut self) {
        match self {
            Instrument::AttackRelease(inst) => inst.release_all(),
            Instrument::Gate(inst) => inst.release_all(),
        }
    }

    /// Independent silent copy for offline rendering.
    pub fn offline_instance(&self) -> Instrument {
        match self {
            Instrument::AttackRelease(inst) => Instrument::AttackRelease(inst.instance()),
            Instrument::Gate(inst) => Instrument::Gate(inst.instance()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstrumentKind {
    Synth,
    #[default]
    PolySynth,
    MembraneSynth,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentConfig {
    #[serde(rename = "type")]
    pub kind: InstrumentKind,
    pub polyphony: usize,
    pub volume_db: f32,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            kind: InstrumentKind::PolySynth,
            polyphony: 32,
            volume_db: -6.0,
        }
    }
}

impl InstrumentConfig {
    pub fn new(kind: InstrumentKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_polyphony(mut self, polyphony: usize) -> Self {
        self.polyphony = polyphony;
        self
    }

    pub fn with_volume_db(mut self, volume_db: f32) -> Self {
        self.volume_db = volume_db;
        self
    }
}

pub fn create_instrument(config: &InstrumentConfig, sample_rate: f64) -> Instrument {
    match config.kind {
        InstrumentKind::Synth => {
            Instrument::Gate(Box::new(PolySynth::new(sample_rate, 1, config.volume_db)))
        }
        InstrumentKind::PolySynth => Instrument::Gate(Box::new(PolySynth::new(
            sample_rate,
            config.polyphony.max(1),
            config.volume_db,
        ))),
        InstrumentKind::MembraneSynth => Instrument::AttackRelease(Box::new(
            MembraneSynth::new(sample_rate).with_volume_db(config.volume_db),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;

    fn energy(inst: &mut Instrument, start: f64, frames: usize) -> f32 {
        let mut scratch = ScratchBuffer::stereo(frames);
        let mut buf = scratch.cleared(frames);
        inst.render(start, &mut buf);
        buf.data.iter().map(|s| s * s).sum()
    }

    #[test]
    fn test_both_capabilities_play_notes() {
        for kind in [InstrumentKind::PolySynth, InstrumentKind::MembraneSynth] {
            let mut inst = create_instrument(&InstrumentConfig::new(kind), 8000.0);
            inst.play_note(60, 100, 0.25, 0.0);
            assert!(energy(&mut inst, 0.0, 800) > 0.0, "{kind:?} stayed silent");
        }
    }

    #[test]
    fn test_offline_instance_is_silent() {
        let mut inst = create_instrument(&InstrumentConfig::default(), 8000.0);
        inst.play_note(60, 100, 1.0, 0.0);
        let mut copy = inst.offline_instance();
        assert_eq!(energy(&mut copy, 0.0, 400), 0.0);
    }

    #[test]
    fn test_config_json() {
        let cfg: InstrumentConfig =
            serde_json::from_str(r#"{"type":"membraneSynth","volumeDb":-3}"#).unwrap();
        assert_eq!(cfg.kind, InstrumentKind::MembraneSynth);
        assert_eq!(cfg.polyphony, 32);
        assert_eq!(cfg.volume_db, -3.0);
    }
}
