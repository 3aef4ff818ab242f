// src/midi.rs
//
// MIDI input selection and note recording from raw channel messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::ids::TrackId;
use crate::region::quantize::MIN_NOTE_DURATION;
use crate::region::{ControlChange, MidiNote, MidiRegion, MidiRegionConfig, PitchBend};

/// Duration given to notes still held when recording stops.
const HELD_NOTE_MIN_DURATION: f64 = 0.1;

// ═══════════════════════════════════════════════════════════════════
// Device abstraction
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiInputInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
}

/// Host MIDI system: lists the inputs currently available.
pub trait MidiAccess: Send {
    fn inputs(&self) -> Vec<MidiInputInfo>;
}

/// Fixed input list supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct StaticMidiAccess {
    inputs: Vec<MidiInputInfo>,
}

impl StaticMidiAccess {
    pub fn new(inputs: Vec<MidiInputInfo>) -> Self {
        Self { inputs }
    }
}

impl MidiAccess for StaticMidiAccess {
    fn inputs(&self) -> Vec<MidiInputInfo> {
        self.inputs.clone()
    }
}

/// Raw three-byte channel message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
    pub timestamp_ms: f64,
}

impl MidiMessage {
    pub fn new(status: u8, data1: u8, data2: u8, timestamp_ms: f64) -> Self {
        Self {
            status,
            data1,
            data2,
            timestamp_ms,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Recording session
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct HeldNote {
    start: f64,
    velocity: u8,
}

#[derive(Debug)]
struct RecordingSession {
    track_id: TrackId,
    /// Seconds.
    start_time: f64,
    held: HashMap<u8, HeldNote>,
    notes: Vec<MidiNote>,
    control_changes: Vec<ControlChange>,
    pitch_bends: Vec<PitchBend>,
}

impl RecordingSession {
    fn note_off(&mut self, pitch: u8, time: f64) {
        if let Some(held) = self.held.remove(&pitch) {
            let duration = (time - held.start).max(MIN_NOTE_DURATION);
            self.notes
                .push(MidiNote::new(pitch, held.velocity, held.start, duration));
        }
    }
}

/// Input selection plus a single exclusive recording session.
#[derive(Default)]
pub struct MidiManager {
    access: Option<Box<dyn MidiAccess>>,
    active_input: Option<MidiInputInfo>,
    session: Option<RecordingSession>,
}

impl std::fmt::Debug for MidiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiManager")
            .field("active_input", &self.active_input)
            .field("recording", &self.is_recording())
            .finish()
    }
}

impl MidiManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_access(&mut self, access: Box<dyn MidiAccess>) {
        log::info!("MIDI access granted");
        self.access = Some(access);
        self.active_input = None;
    }

    pub fn has_access(&self) -> bool {
        self.access.is_some()
    }

    pub fn inputs(&self) -> Vec<MidiInputInfo> {
        self.access.as_ref().map(|a| a.inputs()).unwrap_or_default()
    }

    /// Select an input by id, or the first available when `None`.
    pub fn select_input(&mut self, id: Option<&str>) -> EngineResult<&MidiInputInfo> {
        let inputs = self.inputs();
        let selected = match id {
            Some(id) => inputs.into_iter().find(|i| i.id == id),
            None => inputs.into_iter().next(),
        };
        let Some(input) = selected else {
            return Err(EngineError::invalid_parameter(match id {
                Some(id) => format!("MIDI input {id} not found"),
                None => "No MIDI inputs available".to_string(),
            }));
        };
        log::info!("MIDI input selected: {}", input.name);
        Ok(self.active_input.insert(input))
    }

    pub fn active_input(&self) -> Option<&MidiInputInfo> {
        self.active_input.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn recording_track(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.track_id.as_str())
    }

    pub fn start_recording(&mut self, track_id: &str, now_ms: f64) -> EngineResult<()> {
        if self.active_input.is_none() {
            return Err(EngineError::invalid_parameter("No MIDI input selected"));
        }
        if self.session.is_some() {
            return Err(EngineError::new(
                ErrorCode::RecordingAlreadyStarted,
                "Already recording",
            )
            .with_track(track_id));
        }
        self.session = Some(RecordingSession {
            track_id: track_id.to_string(),
            start_time: now_ms / 1000.0,
            held: HashMap::new(),
            notes: Vec::new(),
            control_changes: Vec::new(),
            pitch_bends: Vec::new(),
        });
        log::info!("MIDI recording started");
        Ok(())
    }

    /// Decode one message into the active session. Ignored when idle.
    pub fn handle_message(&mut self, message: MidiMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let command = message.status & 0xF0;
        let channel = message.status & 0x0F;
        let (data1, data2) = (message.data1 & 0x7F, message.data2 & 0x7F);
        let time = (message.timestamp_ms / 1000.0 - session.start_time).max(0.0);

        match command {
            0x90 if data2 > 0 => {
                session.held.insert(
                    data1,
                    HeldNote {
                        start: time,
                        velocity: data2,
                    },
                );
            }
            0x90 | 0x80 => session.note_off(data1, time),
            0xB0 => session.control_changes.push(ControlChange {
                controller: data1,
                value: data2,
                time,
                channel,
            }),
            0xE0 => {
                let value = ((i16::from(data2) << 7) | i16::from(data1)) - 8192;
                session.pitch_bends.push(PitchBend {
                    value,
                    time,
                    channel,
                });
            }
            _ => {}
        }
    }

    /// End the session. `None` when no notes were played.
    pub fn stop_recording(&mut self, now_ms: f64) -> EngineResult<Option<MidiRegion>> {
        let Some(mut session) = self.session.take() else {
            return Err(EngineError::new(
                ErrorCode::RecordingNotStarted,
                "Not recording",
            ));
        };

        let elapsed = now_ms / 1000.0 - session.start_time;
        let held: Vec<(u8, HeldNote)> = session.held.drain().collect();
        for (pitch, note) in held {
            let duration = (elapsed - note.start).max(HELD_NOTE_MIN_DURATION);
            session
                .notes
                .push(MidiNote::new(pitch, note.velocity, note.start, duration));
        }

        if session.notes.is_empty() {
            log::warn!("No notes recorded");
            return Ok(None);
        }

        let note_count = session.notes.len();
        let name = format!(
            "MIDI Recording {}",
            chrono::Local::now().format("%H:%M:%S")
        );
        let mut region = MidiRegion::new(
            MidiRegionConfig::at(0.0)
                .with_notes(session.notes)
                .with_name(name)
                .with_track(session.track_id),
        )?;
        for cc in session.control_changes {
            if let Err(e) = region.add_control_change(cc) {
                log::debug!("Dropped recorded control change: {e}");
            }
        }
        for bend in session.pitch_bends {
            if let Err(e) = region.add_pitch_bend(bend) {
                log::debug!("Dropped recorded pitch bend: {e}");
            }
        }

        log::info!("MIDI recording stopped: {} notes", note_count);
        Ok(Some(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn manager() -> MidiManager {
        let mut m = MidiManager::new();
        m.set_access(Box::new(StaticMidiAccess::new(vec![
            MidiInputInfo {
                id: "in-1".into(),
                name: "Keys".into(),
                manufacturer: "Acme".into(),
            },
            MidiInputInfo {
                id: "in-2".into(),
                name: "Pads".into(),
                manufacturer: "Acme".into(),
            },
        ])));
        m
    }

    #[test]
    fn test_select_input() {
        let mut m = manager();
        assert_eq!(m.select_input(None).unwrap().id, "in-1");
        assert_eq!(m.select_input(Some("in-2")).unwrap().name, "Pads");
        assert!(m.select_input(Some("nope")).is_err());
        assert!(MidiManager::new().select_input(None).is_err());
    }

    #[test]
    fn test_recording_requires_input_and_is_exclusive() {
        let mut m = manager();
        let err = m.start_recording("track-1", 0.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);

        m.select_input(None).unwrap();
        m.start_recording("track-1", 0.0).unwrap();
        let err = m.start_recording("track-1", 0.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordingAlreadyStarted);
    }

    #[test]
    fn test_stop_without_start() {
        let mut m = manager();
        let err = m.stop_recording(0.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordingNotStarted);
    }

    #[test]
    fn test_decodes_notes_controllers_and_bends() {
        let mut m = manager();
        m.select_input(None).unwrap();
        m.start_recording("track-1", 1000.0).unwrap();

        m.handle_message(MidiMessage::new(0x90, 60, 100, 1500.0));
        m.handle_message(MidiMessage::new(0x80, 60, 0, 2000.0));
        m.handle_message(MidiMessage::new(0x91, 64, 90, 2000.0));
        m.handle_message(MidiMessage::new(0x91, 64, 0, 2250.0));
        m.handle_message(MidiMessage::new(0xB0, 7, 64, 1600.0));
        m.handle_message(MidiMessage::new(0xE0, 0x00, 0x40, 1700.0));
        m.handle_message(MidiMessage::new(0x90, 67, 80, 2500.0));

        let region = m.stop_recording(2550.0).unwrap().unwrap();
        assert_eq!(region.start_time(), 0.0);
        assert_eq!(region.track_id(), Some("track-1"));
        assert!(region.name().starts_with("MIDI Recording "));

        let notes = region.notes();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].pitch, 60);
        assert_relative_eq!(notes[0].time, 0.5);
        assert_relative_eq!(notes[0].duration, 0.5);
        assert_relative_eq!(notes[1].duration, 0.25);
        // Held note gets the minimum length
        assert_eq!(notes[2].pitch, 67);
        assert_relative_eq!(notes[2].duration, 0.1);

        assert_eq!(region.control_changes()[0].controller, 7);
        assert_eq!(region.pitch_bends()[0].value, 0);
        assert!(!m.is_recording());
    }

    #[test]
    fn test_no_notes_yields_none() {
        let mut m = manager();
        m.select_input(None).unwrap();
        m.start_recording("track-1", 0.0).unwrap();
        m.handle_message(MidiMessage::new(0xB0, 1, 10, 10.0));
        assert!(m.stop_recording(100.0).unwrap().is_none());
    }
}
