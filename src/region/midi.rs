// src/region/midi.rs
//
// MIDI regions: notes and controller data positioned on the timeline.
// Note times are relative to the region start.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ids::{self, NoteId, RegionId, TrackId};

use super::quantize::{self, MIN_NOTE_DURATION, QuantizeOptions};
use super::{check_start_time, check_trim};

const DEFAULT_REGION_DURATION: f64 = 4.0;
const DURATION_ROUNDING: f64 = 0.5;

// ═══════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiNote {
    pub id: NoteId,
    pub pitch: u8,
    pub velocity: u8,
    pub time: f64,
    pub duration: f64,
}

impl MidiNote {
    pub fn new(pitch: u8, velocity: u8, time: f64, duration: f64) -> Self {
        Self {
            id: ids::generate("note"),
            pitch,
            velocity,
            time,
            duration,
        }
    }

    #[inline]
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }

    /// Equal-tempered frequency, A4 = 440 Hz.
    #[inline]
    pub fn frequency(&self) -> f64 {
        pitch_to_frequency(self.pitch)
    }
}

#[inline]
pub fn pitch_to_frequency(pitch: u8) -> f64 {
    440.0 * 2.0_f64.powf((f64::from(pitch) - 69.0) / 12.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlChange {
    pub controller: u8,
    pub value: u8,
    pub time: f64,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitchBend {
    /// -8192..=8191, centre 0.
    pub value: i16,
    pub time: f64,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramChange {
    pub program: u8,
    pub time: f64,
    pub channel: u8,
}

/// Which notes a transform touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoteScope {
    #[default]
    All,
    Selected,
}

/// Partial note edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteUpdate {
    pub pitch: Option<u8>,
    pub velocity: Option<u8>,
    pub time: Option<f64>,
    pub duration: Option<f64>,
}

// ═══════════════════════════════════════════════════════════════════
// Region
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct MidiRegionConfig {
    pub id: Option<RegionId>,
    pub track_id: Option<TrackId>,
    pub name: Option<String>,
    pub start_time: f64,
    /// Derived from the notes when absent.
    pub duration: Option<f64>,
    pub notes: Vec<MidiNote>,
}

impl MidiRegionConfig {
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

    pub fn with_notes(mut self, notes: Vec<MidiNote>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_track(mut self, track_id: impl Into<TrackId>) -> Self {
        self.track_id = Some(track_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct MidiRegion {
    id: RegionId,
    track_id: Option<TrackId>,
    name: String,
    start_time: f64,
    duration: f64,
    notes: Vec<MidiNote>,
    control_changes: Vec<ControlChange>,
    pitch_bends: Vec<PitchBend>,
    program_changes: Vec<ProgramChange>,
    selection: HashSet<NoteId>,
}

impl MidiRegion {
    pub fn new(config: MidiRegionConfig) -> EngineResult<Self> {
        if !(config.start_time.is_finite() && config.start_time >= 0.0) {
            return Err(EngineError::invalid_clip("Clip start time must be non-negative"));
        }

        let duration = match config.duration {
            Some(d) => d,
            None => config
                .notes
                .iter()
                .map(MidiNote::end)
                .fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))))
                .map(|end| (end / DURATION_ROUNDING).ceil() * DURATION_ROUNDING)
                .filter(|d| *d > 0.0)
                .unwrap_or(DEFAULT_REGION_DURATION),
        };
        if !(duration.is_finite() && duration > 0.0) {
            return Err(EngineError::invalid_clip("Clip duration must be positive"));
        }

        let id = config.id.unwrap_or_else(|| ids::generate("midiclip"));
        let name = config
            .name
            .unwrap_or_else(|| format!("MIDI Clip {}", ids::short(&id)));

        let mut region = Self {
            id,
            track_id: config.track_id,
            name,
            start_time: config.start_time,
            duration,
            notes: Vec::with_capacity(config.notes.len()),
            control_changes: Vec::new(),
            pitch_bends: Vec::new(),
            program_changes: Vec::new(),
            selection: HashSet::new(),
        };
        for note in &config.notes {
            region.check_note(note.pitch, note.velocity, note.time, note.duration)?;
        }
        region.notes = config.notes;
        region.sort_notes();
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
    pub fn notes(&self) -> &[MidiNote] {
        &self.notes
    }

    #[inline]
    pub fn control_changes(&self) -> &[ControlChange] {
        &self.control_changes
    }

    #[inline]
    pub fn pitch_bends(&self) -> &[PitchBend] {
        &self.pitch_bends
    }

    #[inline]
    pub fn program_changes(&self) -> &[ProgramChange] {
        &self.program_changes
    }

    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time()
    }

    // ─────────────────────────────────────────────────────────────────
    // Notes
    // ─────────────────────────────────────────────────────────────────

    fn check_note(&self, pitch: u8, velocity: u8, time: f64, duration: f64) -> EngineResult<()> {
        if pitch > 127 {
            return Err(EngineError::invalid_parameter(format!(
                "Pitch must be 0-127, got {pitch}"
            )));
        }
        if !(1..=127).contains(&velocity) {
            return Err(EngineError::invalid_parameter(format!(
                "Velocity must be 1-127, got {velocity}"
            )));
        }
        if !(time.is_finite() && duration.is_finite()) || time < 0.0 || duration <= 0.0 {
            return Err(EngineError::invalid_clip(
                "Note time must be non-negative and duration positive",
            ));
        }
        if time + duration > self.duration + 1e-9 {
            return Err(EngineError::invalid_clip(format!(
                "Note [{time:.3}, {:.3}] exceeds clip duration {:.3}",
                time + duration,
                self.duration
            )));
        }
        Ok(())
    }

    pub fn add_note(
        &mut self,
        pitch: u8,
        velocity: u8,
        time: f64,
        duration: f64,
    ) -> EngineResult<NoteId> {
        self.check_note(pitch, velocity, time, duration)?;
        let note = MidiNote::new(pitch, velocity, time, duration);
        let id = note.id.clone();
        self.notes.push(note);
        self.sort_notes();
        Ok(id)
    }

    pub fn remove_note(&mut self, id: &str) -> bool {
        let before = self.notes.len();
        self.notes.retain(|n| n.id != id);
        self.selection.remove(id);
        self.notes.len() != before
    }

    pub fn update_note(&mut self, id: &str, update: NoteUpdate) -> EngineResult<()> {
        let index = self
            .notes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| EngineError::invalid_parameter(format!("Note {id} not found")))?;

        let current = &self.notes[index];
        let pitch = update.pitch.unwrap_or(current.pitch);
        let velocity = update.velocity.unwrap_or(current.velocity);
        let time = update.time.unwrap_or(current.time);
        let duration = update.duration.unwrap_or(current.duration);
        self.check_note(pitch, velocity, time, duration)?;

        let note = &mut self.notes[index];
        note.pitch = pitch;
        note.velocity = velocity;
        note.time = time;
        note.duration = duration;
        self.sort_notes();
        Ok(())
    }

    pub fn note(&self, id: &str) -> Option<&MidiNote> {
        self.notes.iter().find(|n| n.id == id)
    }

    /// Notes sounding anywhere inside `[start, end)` (region-relative).
    pub fn notes_in_range(&self, start: f64, end: f64) -> Vec<&MidiNote> {
        self.notes
            .iter()
            .filter(|n| n.time < end && n.end() > start)
            .collect()
    }

    fn sort_notes(&mut self) {
        self.notes.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then_with(|| a.pitch.cmp(&b.pitch))
        });
    }

    /// Pull every note back inside `[0, duration]` after a time transform.
    /// Durations are shortened first; a start is only moved when fewer than
    /// `MIN_NOTE_DURATION` seconds remain after it.
    fn refit_notes(&mut self) {
        let limit = self.duration;
        for note in &mut self.notes {
            let max_start = (limit - MIN_NOTE_DURATION).max(0.0);
            note.time = note.time.clamp(0.0, max_start);
            note.duration = note.duration.min(limit - note.time);
        }
        self.sort_notes();
    }

    // ─────────────────────────────────────────────────────────────────
    // Selection
    // ─────────────────────────────────────────────────────────────────

    /// Select a note. Without `additive` the previous selection is replaced.
    pub fn select_note(&mut self, id: &str, additive: bool) -> bool {
        if self.note(id).is_none() {
            return false;
        }
        if !additive {
            self.selection.clear();
        }
        self.selection.insert(id.to_string());
        true
    }

    pub fn select_notes<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        self.selection.clear();
        for id in ids {
            if self.note(id).is_some() {
                self.selection.insert(id.to_string());
            }
        }
    }

    pub fn select_all(&mut self) {
        self.selection = self.notes.iter().map(|n| n.id.clone()).collect();
    }

    pub fn deselect_note(&mut self, id: &str) {
        self.selection.remove(id);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selection.contains(id)
    }

    pub fn selected_notes(&self) -> Vec<&MidiNote> {
        self.notes
            .iter()
            .filter(|n| self.selection.contains(&n.id))
            .collect()
    }

    fn scoped_mut(&mut self, scope: NoteScope) -> Vec<&mut MidiNote> {
        let selection = &self.selection;
        self.notes
            .iter_mut()
            .filter(|n| scope == NoteScope::All || selection.contains(&n.id))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────
    // Transforms
    // ─────────────────────────────────────────────────────────────────

    pub fn transpose(&mut self, semitones: i32, scope: NoteScope) {
        for note in self.scoped_mut(scope) {
            note.pitch = (i32::from(note.pitch) + semitones).clamp(0, 127) as u8;
        }
        self.sort_notes();
    }

    pub fn scale_velocity(&mut self, factor: f64, scope: NoteScope) -> EngineResult<()> {
        if !(factor.is_finite() && factor >= 0.0) {
            return Err(EngineError::invalid_parameter(
                "Velocity factor must be a non-negative number",
            ));
        }
        for note in self.scoped_mut(scope) {
            let scaled = (f64::from(note.velocity) * factor).round();
            note.velocity = scaled.clamp(1.0, 127.0) as u8;
        }
        Ok(())
    }

    pub fn quantize(
        &mut self,
        options: &QuantizeOptions,
        bpm: f64,
        scope: NoteScope,
    ) -> EngineResult<()> {
        options.validate()?;
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(EngineError::invalid_parameter("Tempo must be positive"));
        }
        let grid = options.grid.seconds(bpm);
        let max_start = (self.duration - MIN_NOTE_DURATION).max(0.0);
        for note in self.scoped_mut(scope) {
            quantize::quantize_note(note, options, grid);
            // Snapped onto the region end: fall back one grid step.
            if note.time > max_start && note.time - grid >= 0.0 {
                note.time -= grid;
            }
        }
        self.refit_notes();
        Ok(())
    }

    pub fn humanize<R: Rng + ?Sized>(
        &mut self,
        amount: f64,
        scope: NoteScope,
        rng: &mut R,
    ) -> EngineResult<()> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(EngineError::invalid_parameter(
                "Humanize amount must be a non-negative number",
            ));
        }
        for note in self.scoped_mut(scope) {
            quantize::humanize_note(note, amount, rng);
        }
        self.refit_notes();
        Ok(())
    }

    pub fn legato(&mut self, gap: f64, scope: NoteScope) {
        self.sort_notes();
        let mut notes = self.scoped_mut(scope);
        quantize::legato(&mut notes, gap);
        self.refit_notes();
    }

    pub fn staccato(&mut self, factor: f64, min_duration: f64, scope: NoteScope) {
        for note in self.scoped_mut(scope) {
            quantize::staccato_note(note, factor, min_duration);
        }
        self.refit_notes();
    }

    /// Copy the selection `offset` seconds later. Copies that would not fit
    /// are skipped. The copies become the new selection.
    pub fn duplicate_selected(&mut self, offset: f64) -> Vec<NoteId> {
        let copies: Vec<MidiNote> = self
            .selected_notes()
            .into_iter()
            .filter(|n| n.time + offset >= 0.0 && n.end() + offset <= self.duration)
            .map(|n| MidiNote::new(n.pitch, n.velocity, n.time + offset, n.duration))
            .collect();

        let ids: Vec<NoteId> = copies.iter().map(|n| n.id.clone()).collect();
        self.notes.extend(copies);
        self.sort_notes();
        self.selection = ids.iter().cloned().collect();
        ids
    }

    pub fn delete_selected(&mut self) -> usize {
        let before = self.notes.len();
        let selection = std::mem::take(&mut self.selection);
        self.notes.retain(|n| !selection.contains(&n.id));
        before - self.notes.len()
    }

    // ─────────────────────────────────────────────────────────────────
    // Controllers
    // ─────────────────────────────────────────────────────────────────

    pub fn add_control_change(&mut self, cc: ControlChange) -> EngineResult<()> {
        if cc.controller > 127 || cc.value > 127 {
            return Err(EngineError::invalid_parameter(
                "Controller number and value must be 0-127",
            ));
        }
        self.check_event_time(cc.time)?;
        self.control_changes.push(cc);
        self.control_changes.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(())
    }

    /// Control changes with `start <= time <= end`.
    pub fn control_changes_in_range(&self, start: f64, end: f64) -> Vec<&ControlChange> {
        self.control_changes
            .iter()
            .filter(|cc| cc.time >= start && cc.time <= end)
            .collect()
    }

    pub fn add_pitch_bend(&mut self, bend: PitchBend) -> EngineResult<()> {
        if !(-8192..=8191).contains(&bend.value) {
            return Err(EngineError::out_of_range(
                "pitch bend",
                f64::from(bend.value),
                -8192.0,
                8191.0,
            ));
        }
        self.check_event_time(bend.time)?;
        self.pitch_bends.push(bend);
        self.pitch_bends.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(())
    }

    pub fn pitch_bends_in_range(&self, start: f64, end: f64) -> Vec<&PitchBend> {
        self.pitch_bends
            .iter()
            .filter(|pb| pb.time >= start && pb.time <= end)
            .collect()
    }

    pub fn add_program_change(&mut self, change: ProgramChange) -> EngineResult<()> {
        if change.program > 127 {
            return Err(EngineError::invalid_parameter("Program must be 0-127"));
        }
        self.check_event_time(change.time)?;
        self.program_changes.push(change);
        self.program_changes.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(())
    }

    fn check_event_time(&self, time: f64) -> EngineResult<()> {
        if !(time.is_finite() && time >= 0.0 && time <= self.duration) {
            return Err(EngineError::invalid_clip(format!(
                "Event time {time} lies outside the clip"
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Region edits
    // ─────────────────────────────────────────────────────────────────

    pub fn move_to(&mut self, time: f64) -> EngineResult<()> {
        check_start_time(time)?;
        self.start_time = time;
        Ok(())
    }

    /// Remove `amount` seconds from the head. Notes shift left with the
    /// content; notes ending before the cut are dropped.
    pub fn trim_start(&mut self, amount: f64) -> EngineResult<()> {
        let duration = check_trim(self.duration, amount)?;

        self.notes.retain(|n| n.end() > amount);
        for note in &mut self.notes {
            let end = note.end() - amount;
            note.time = (note.time - amount).max(0.0);
            note.duration = end - note.time;
        }
        self.control_changes.retain(|e| e.time >= amount);
        self.control_changes.iter_mut().for_each(|e| e.time -= amount);
        self.pitch_bends.retain(|e| e.time >= amount);
        self.pitch_bends.iter_mut().for_each(|e| e.time -= amount);
        self.program_changes.retain(|e| e.time >= amount);
        self.program_changes.iter_mut().for_each(|e| e.time -= amount);

        self.start_time += amount;
        self.duration = duration;
        self.retain_selection();
        self.refit_notes();
        Ok(())
    }

    /// Remove `amount` seconds from the tail.
    pub fn trim_end(&mut self, amount: f64) -> EngineResult<()> {
        let duration = check_trim(self.duration, amount)?;
        self.duration = duration;
        self.notes.retain(|n| n.time < duration);
        self.control_changes.retain(|e| e.time <= duration);
        self.pitch_bends.retain(|e| e.time <= duration);
        self.program_changes.retain(|e| e.time <= duration);
        self.retain_selection();
        self.refit_notes();
        Ok(())
    }

    fn retain_selection(&mut self) {
        let notes = &self.notes;
        self.selection.retain(|id| notes.iter().any(|n| &n.id == id));
    }

    /// Split at timeline `time`; the returned region holds the tail.
    ///
    /// Returns `None` unless `start < time < end`: a split at the start
    /// edge would leave an empty head.
    pub fn split(&mut self, time: f64) -> Option<MidiRegion> {
        if time <= self.start_time || time >= self.end_time() {
            return None;
        }
        let at = time - self.start_time;

        let (head, tail): (Vec<MidiNote>, Vec<MidiNote>) =
            std::mem::take(&mut self.notes).into_iter().partition(|n| n.time < at);

        self.notes = head
            .into_iter()
            .map(|mut n| {
                n.duration = n.duration.min(at - n.time);
                n
            })
            .collect();

        let tail_notes = tail
            .into_iter()
            .map(|n| MidiNote::new(n.pitch, n.velocity, n.time - at, n.duration))
            .collect();

        let id = ids::generate("midiclip");
        let mut other = MidiRegion {
            name: format!("{} (split)", self.name),
            id,
            track_id: self.track_id.clone(),
            start_time: time,
            duration: self.duration - at,
            notes: tail_notes,
            control_changes: Vec::new(),
            pitch_bends: Vec::new(),
            program_changes: Vec::new(),
            selection: HashSet::new(),
        };

        let (keep, moved): (Vec<_>, Vec<_>) =
            self.control_changes.drain(..).partition(|e| e.time < at);
        self.control_changes = keep;
        other.control_changes = moved
            .into_iter()
            .map(|e| ControlChange { time: e.time - at, ..e })
            .collect();

        let (keep, moved): (Vec<_>, Vec<_>) =
            self.pitch_bends.drain(..).partition(|e| e.time < at);
        self.pitch_bends = keep;
        other.pitch_bends = moved
            .into_iter()
            .map(|e| PitchBend { time: e.time - at, ..e })
            .collect();

        let (keep, moved): (Vec<_>, Vec<_>) =
            self.program_changes.drain(..).partition(|e| e.time < at);
        self.program_changes = keep;
        other.program_changes = moved
            .into_iter()
            .map(|e| ProgramChange { time: e.time - at, ..e })
            .collect();

        self.duration = at;
        self.retain_selection();
        other.refit_notes();
        Some(other)
    }

    /// Copy with fresh identities for the region and every note.
    pub fn duplicate(&self) -> MidiRegion {
        MidiRegion {
            id: ids::generate("midiclip"),
            name: format!("{} (copy)", self.name),
            notes: self
                .notes
                .iter()
                .map(|n| MidiNote::new(n.pitch, n.velocity, n.time, n.duration))
                .collect(),
            selection: HashSet::new(),
            ..self.clone()
        }
    }
}
