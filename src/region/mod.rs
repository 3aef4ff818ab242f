// src/region/mod.rs
//
// Time-positioned regions placed on tracks.

mod audio;
mod midi;
pub mod quantize;

pub use audio::{AudioRegion, AudioRegionConfig, AudioRegionSummary};
pub use midi::{
    ControlChange, MidiNote, MidiRegion, MidiRegionConfig, NoteScope, NoteUpdate, PitchBend,
    ProgramChange, pitch_to_frequency,
};
pub use quantize::{GridDivision, QuantizeOptions};

use crate::error::{EngineError, EngineResult};

pub(crate) fn check_start_time(time: f64) -> EngineResult<()> {
    if !(time.is_finite() && time >= 0.0) {
        return Err(EngineError::invalid_parameter(
            "Start time cannot be negative",
        ));
    }
    Ok(())
}

/// Duration left after trimming `amount`, or an error if nothing would remain.
pub(crate) fn check_trim(duration: f64, amount: f64) -> EngineResult<f64> {
    if !(amount.is_finite() && amount >= 0.0) {
        return Err(EngineError::invalid_parameter(
            "Trim amount cannot be negative",
        ));
    }
    let remaining = duration - amount;
    if remaining <= 0.0 {
        return Err(EngineError::invalid_parameter(
            "Trim would result in zero or negative duration",
        ));
    }
    Ok(remaining)
}
