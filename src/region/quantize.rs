// src/region/quantize.rs
//
// Grid quantization and note-shape transforms for MIDI notes.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ensure_range};

use super::MidiNote;

/// Shortest duration a transform may leave a note with.
pub const MIN_NOTE_DURATION: f64 = 0.01;

// ═══════════════════════════════════════════════════════════════════
// Grid
// ═══════════════════════════════════════════════════════════════════

/// Named note division, including triplets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GridDivision {
    Whole,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
    ThirtySecond,
    SixtyFourth,
    QuarterTriplet,
    EighthTriplet,
    SixteenthTriplet,
}

impl GridDivision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridDivision::Whole => "1/1",
            GridDivision::Half => "1/2",
            GridDivision::Quarter => "1/4",
            GridDivision::Eighth => "1/8",
            GridDivision::Sixteenth => "1/16",
            GridDivision::ThirtySecond => "1/32",
            GridDivision::SixtyFourth => "1/64",
            GridDivision::QuarterTriplet => "1/4T",
            GridDivision::EighthTriplet => "1/8T",
            GridDivision::SixteenthTriplet => "1/16T",
        }
    }

    /// Grid spacing in seconds at `bpm` quarter notes per minute.
    pub fn seconds(&self, bpm: f64) -> f64 {
        let quarter = 60.0 / bpm;
        match self {
            GridDivision::Whole => quarter * 4.0,
            GridDivision::Half => quarter * 2.0,
            GridDivision::Quarter => quarter,
            GridDivision::Eighth => quarter / 2.0,
            GridDivision::Sixteenth => quarter / 4.0,
            GridDivision::ThirtySecond => quarter / 8.0,
            GridDivision::SixtyFourth => quarter / 16.0,
            GridDivision::QuarterTriplet => quarter * 2.0 / 3.0,
            GridDivision::EighthTriplet => quarter / 3.0,
            GridDivision::SixteenthTriplet => quarter / 6.0,
        }
    }
}

impl FromStr for GridDivision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1/1" => GridDivision::Whole,
            "1/2" => GridDivision::Half,
            "1/4" => GridDivision::Quarter,
            "1/8" => GridDivision::Eighth,
            "1/16" => GridDivision::Sixteenth,
            "1/32" => GridDivision::ThirtySecond,
            "1/64" => GridDivision::SixtyFourth,
            "1/4T" => GridDivision::QuarterTriplet,
            "1/8T" => GridDivision::EighthTriplet,
            "1/16T" => GridDivision::SixteenthTriplet,
            other => {
                return Err(EngineError::invalid_parameter(format!(
                    "Unknown grid division: {other}"
                )));
            }
        })
    }
}

impl TryFrom<String> for GridDivision {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GridDivision> for String {
    fn from(grid: GridDivision) -> Self {
        grid.as_str().to_string()
    }
}

impl fmt::Display for GridDivision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════
// Quantize
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuantizeOptions {
    pub grid: GridDivision,
    /// Blend between original (0) and grid (1) positions.
    pub strength: f64,
    /// Delay applied to odd grid indices, as a fraction of half a grid step.
    pub swing: f64,
    pub quantize_starts: bool,
    pub quantize_ends: bool,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            grid: GridDivision::Sixteenth,
            strength: 1.0,
            swing: 0.0,
            quantize_starts: true,
            quantize_ends: false,
        }
    }
}

impl QuantizeOptions {
    pub fn grid(grid: GridDivision) -> Self {
        Self {
            grid,
            ..Self::default()
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_swing(mut self, swing: f64) -> Self {
        self.swing = swing;
        self
    }

    pub fn with_ends(mut self, quantize_ends: bool) -> Self {
        self.quantize_ends = quantize_ends;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        ensure_range("strength", self.strength, 0.0, 1.0)?;
        ensure_range("swing", self.swing, 0.0, 1.0)?;
        Ok(())
    }
}

/// Move `time` toward its nearest grid line.
pub fn quantize_time(time: f64, grid: f64, strength: f64, swing: f64) -> f64 {
    if grid <= 0.0 {
        return time;
    }
    let index = (time / grid).round();
    let mut target = index * grid;
    if swing > 0.0 && (index as i64) % 2 != 0 {
        target += grid * swing * 0.5;
    }
    (time + (target - time) * strength).max(0.0)
}

/// Quantize one note in place.
pub fn quantize_note(note: &mut MidiNote, options: &QuantizeOptions, grid: f64) {
    let original_start = note.time;
    let original_end = note.time + note.duration;

    let start = if options.quantize_starts {
        quantize_time(original_start, grid, options.strength, options.swing)
    } else {
        original_start
    };

    let end = if options.quantize_ends {
        quantize_time(original_end, grid, options.strength, options.swing)
    } else {
        original_end
    };

    note.time = start;
    note.duration = (end - start).max(MIN_NOTE_DURATION);
}

// ═══════════════════════════════════════════════════════════════════
// Shape transforms
// ═══════════════════════════════════════════════════════════════════

/// Randomize timing by up to ±5 ms and velocity by up to ±10, scaled by `amount`.
pub fn humanize_note<R: Rng + ?Sized>(note: &mut MidiNote, amount: f64, rng: &mut R) {
    let time_jitter = (rng.random::<f64>() - 0.5) * 0.01 * amount;
    note.time = (note.time + time_jitter).max(0.0);

    let velocity_jitter = ((rng.random::<f64>() - 0.5) * 20.0 * amount).round() as i32;
    note.velocity = (i32::from(note.velocity) + velocity_jitter).clamp(1, 127) as u8;
}

/// Extend each note to `gap` seconds before the next note of the same pitch.
///
/// `notes` must be sorted by `(time, pitch)`.
pub fn legato(notes: &mut [&mut MidiNote], gap: f64) {
    for i in 0..notes.len() {
        let (time, pitch) = (notes[i].time, notes[i].pitch);
        let next = notes[i + 1..]
            .iter()
            .find(|n| n.pitch == pitch && n.time > time)
            .map(|n| n.time);
        if let Some(next_time) = next {
            let duration = next_time - time - gap;
            if duration > 0.0 {
                notes[i].duration = duration;
            }
        }
    }
}

/// Shorten a note by `factor`, never below `min_duration`.
pub fn staccato_note(note: &mut MidiNote, factor: f64, min_duration: f64) {
    note.duration = (note.duration * factor).max(min_duration);
}
