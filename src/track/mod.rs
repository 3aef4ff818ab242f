// src/track/mod.rs
//
// A mixer track: regions, instrument, effect rack, channel strip, sends
// and recording state.

mod channel;
mod player;

pub use channel::{ChannelStrip, MAX_VOLUME_DB, MIN_VOLUME_DB, PeakMeter};
pub use player::RegionPlayer;

pub(crate) use channel::{check_pan, check_volume};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio_buffer::{AudioBuffer, ScratchBuffer};
use crate::capture::{CaptureBackend, CaptureDevice, decode_audio};
use crate::effects::{EffectsRack, RackSnapshot};
use crate::error::{EngineError, EngineResult, ErrorCode, ensure_range};
use crate::ids::{RegionId, TrackId};
use crate::instrument::{Instrument, InstrumentConfig, create_instrument};
use crate::midi::MidiManager;
use crate::region::{AudioRegion, AudioRegionConfig, AudioRegionSummary, MidiRegion};
use crate::scheduler::{ScheduleId, Scheduler, TransportEvent};

/// Colors assigned to new tracks.
pub const TRACK_COLORS: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

/// Smoothing of the per-track meter.
const METER_SMOOTHING: f32 = 0.8;

// ═══════════════════════════════════════════════════════════════════
// Kind
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Midi,
    Aux,
    Folder,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Midi => "midi",
            TrackKind::Aux => "aux",
            TrackKind::Folder => "folder",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(TrackKind::Audio),
            "midi" => Ok(TrackKind::Midi),
            "aux" => Ok(TrackKind::Aux),
            "folder" => Ok(TrackKind::Folder),
            _ => Err(EngineError::new(
                ErrorCode::InvalidTrackType,
                format!("Unknown track type: {s}"),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Render context
// ═══════════════════════════════════════════════════════════════════

/// Where one slice of audio sits on the transport and render clocks.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    pub sample_rate: f64,
    /// Transport position of the first frame, in samples.
    pub position: i64,
    pub playing: bool,
    /// Render-clock time of the first frame, in seconds.
    pub time: f64,
}

/// Serializable view of a track.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: TrackId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub color: String,
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    pub effects: RackSnapshot,
    pub clips: Vec<AudioRegionSummary>,
    pub midi_clips: Vec<RegionId>,
    pub sends: BTreeMap<TrackId, f32>,
}

fn schedule_notes(track_id: &str, region: &MidiRegion, scheduler: &mut Scheduler) -> Vec<ScheduleId> {
    region
        .notes()
        .iter()
        .map(|note| {
            scheduler.schedule(
                region.start_time() + note.time,
                TransportEvent::Note {
                    track_id: track_id.to_string(),
                    pitch: note.pitch,
                    velocity: note.velocity,
                    duration: note.duration,
                },
            )
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════
// Track
// ═══════════════════════════════════════════════════════════════════

pub struct Track {
    id: TrackId,
    name: String,
    kind: TrackKind,
    color: String,

    // Host-facing flags persisted with the project
    record_arm: bool,
    monitor: bool,
    frozen: bool,
    input: String,
    output: String,

    sample_rate: f64,
    strip: ChannelStrip,
    meter: PeakMeter,
    rack: EffectsRack,

    regions: Vec<AudioRegion>,
    players: Vec<RegionPlayer>,
    midi_regions: Vec<MidiRegion>,
    scheduled: HashMap<RegionId, Vec<ScheduleId>>,
    instrument: Option<Instrument>,
    instrument_config: Option<InstrumentConfig>,

    sends: BTreeMap<TrackId, f32>,

    recorder: Option<Box<dyn CaptureDevice>>,
    midi_recording: bool,

    out_buffer: ScratchBuffer,
    send_buffer: ScratchBuffer,
    send_pending: bool,
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("regions", &self.regions.len())
            .field("midi_regions", &self.midi_regions.len())
            .field("recording", &self.is_recording())
            .finish()
    }
}

impl Track {
    pub fn new(
        id: impl Into<TrackId>,
        name: impl Into<String>,
        kind: TrackKind,
        color: impl Into<String>,
        sample_rate: f64,
        max_block: usize,
    ) -> Self {
        let instrument_config = (kind == TrackKind::Midi).then(InstrumentConfig::default);
        let instrument = instrument_config
            .as_ref()
            .map(|config| create_instrument(config, sample_rate));
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            color: color.into(),
            record_arm: false,
            monitor: false,
            frozen: false,
            input: "default".to_string(),
            output: "master".to_string(),
            sample_rate,
            strip: ChannelStrip::new(sample_rate),
            meter: PeakMeter::new(METER_SMOOTHING),
            rack: EffectsRack::new(sample_rate, max_block),
            regions: Vec::new(),
            players: Vec::new(),
            midi_regions: Vec::new(),
            scheduled: HashMap::new(),
            instrument,
            instrument_config,
            sends: BTreeMap::new(),
            recorder: None,
            midi_recording: false,
            out_buffer: ScratchBuffer::stereo(max_block),
            send_buffer: ScratchBuffer::stereo(max_block),
            send_pending: false,
        }
    }

    fn wrong_kind(&self, message: &str) -> EngineError {
        EngineError::new(ErrorCode::InvalidTrackType, message).with_track(self.id.as_str())
    }

    fn require_kind(&self, kind: TrackKind, message: &str) -> EngineResult<()> {
        if self.kind != kind {
            return Err(self.wrong_kind(message));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Identity and flags
    // ─────────────────────────────────────────────────────────────────

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[inline]
    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn set_color(&mut self, color: impl Into<String>) {
        self.color = color.into();
    }

    pub fn record_arm(&self) -> bool {
        self.record_arm
    }

    pub fn set_record_arm(&mut self, armed: bool) {
        self.record_arm = armed;
    }

    pub fn monitor(&self) -> bool {
        self.monitor
    }

    pub fn set_monitor(&mut self, monitor: bool) {
        self.monitor = monitor;
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn set_output(&mut self, output: impl Into<String>) {
        self.output = output.into();
    }

    // ─────────────────────────────────────────────────────────────────
    // Mixer
    // ─────────────────────────────────────────────────────────────────

    #[inline]
    pub fn channel(&self) -> &ChannelStrip {
        &self.strip
    }

    pub fn set_volume(&mut self, db: f64) -> EngineResult<()> {
        self.strip
            .set_volume(db)
            .map_err(|e| e.with_track(self.id.as_str()))
    }

    pub fn set_pan(&mut self, pan: f64) -> EngineResult<()> {
        self.strip
            .set_pan(pan)
            .map_err(|e| e.with_track(self.id.as_str()))
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.strip.set_mute(mute);
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.strip.set_solo(solo);
    }

    /// `!mute && (!any_solo || solo)`.
    #[inline]
    pub fn is_audible(&self, any_solo: bool) -> bool {
        !self.strip.is_muted() && (!any_solo || self.strip.is_soloed())
    }

    /// Post-fader meter level in dB.
    pub fn level_db(&self) -> f32 {
        self.meter.level_db()
    }

    #[inline]
    pub fn rack(&self) -> &EffectsRack {
        &self.rack
    }

    #[inline]
    pub fn rack_mut(&mut self) -> &mut EffectsRack {
        &mut self.rack
    }

    // ─────────────────────────────────────────────────────────────────
    // Audio regions
    // ─────────────────────────────────────────────────────────────────

    pub fn add_region(&mut self, mut region: AudioRegion) -> EngineResult<()> {
        self.require_kind(TrackKind::Audio, "Only audio tracks can hold audio clips")?;
        if region.track_id() != Some(self.id.as_str()) {
            region.set_track_id(self.id.as_str());
        }
        self.players.push(RegionPlayer::new(region.clone()));
        self.regions.push(region);
        Ok(())
    }

    pub fn remove_region(&mut self, region_id: &str) -> EngineResult<AudioRegion> {
        let index = self
            .regions
            .iter()
            .position(|r| r.id() == region_id)
            .ok_or_else(|| EngineError::clip_not_found(region_id).with_track(self.id.as_str()))?;
        self.players.retain(|p| p.region_id() != region_id);
        Ok(self.regions.remove(index))
    }

    pub fn region(&self, region_id: &str) -> Option<&AudioRegion> {
        self.regions.iter().find(|r| r.id() == region_id)
    }

    #[inline]
    pub fn regions(&self) -> &[AudioRegion] {
        &self.regions
    }

    /// Apply `edit` to a region and rebuild its player.
    pub fn edit_region<R>(
        &mut self,
        region_id: &str,
        edit: impl FnOnce(&mut AudioRegion) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let index = self
            .regions
            .iter()
            .position(|r| r.id() == region_id)
            .ok_or_else(|| EngineError::clip_not_found(region_id).with_track(self.id.as_str()))?;
        let result = edit(&mut self.regions[index]);
        let rebuilt = RegionPlayer::new(self.regions[index].clone());
        if let Some(player) = self.players.iter_mut().find(|p| p.region_id() == region_id) {
            *player = rebuilt;
        }
        result
    }

    /// Split a region in two. `None` when `time` is outside it.
    pub fn split_region(&mut self, region_id: &str, time: f64) -> EngineResult<Option<RegionId>> {
        let tail = self.edit_region(region_id, |r| Ok(r.split(time)))?;
        let Some(tail) = tail else {
            return Ok(None);
        };
        let id = tail.id().to_string();
        self.add_region(tail)?;
        Ok(Some(id))
    }

    /// Players whose region is under the playhead.
    pub fn playing_players(&self, seconds: f64) -> usize {
        self.players.iter().filter(|p| p.is_playing_at(seconds)).count()
    }

    // ─────────────────────────────────────────────────────────────────
    // MIDI regions
    // ─────────────────────────────────────────────────────────────────

    pub fn add_midi_region(
        &mut self,
        mut region: MidiRegion,
        scheduler: &mut Scheduler,
    ) -> EngineResult<()> {
        self.require_kind(TrackKind::Midi, "Only MIDI tracks can hold MIDI clips")?;
        if region.track_id() != Some(self.id.as_str()) {
            region.set_track_id(self.id.as_str());
        }
        let ids = schedule_notes(&self.id, &region, scheduler);
        self.scheduled.insert(region.id().to_string(), ids);
        self.midi_regions.push(region);
        Ok(())
    }

    pub fn remove_midi_region(
        &mut self,
        region_id: &str,
        scheduler: &mut Scheduler,
    ) -> EngineResult<MidiRegion> {
        let index = self
            .midi_regions
            .iter()
            .position(|r| r.id() == region_id)
            .ok_or_else(|| EngineError::clip_not_found(region_id).with_track(self.id.as_str()))?;
        if let Some(ids) = self.scheduled.remove(region_id) {
            scheduler.cancel_all(&ids);
        }
        Ok(self.midi_regions.remove(index))
    }

    pub fn midi_region(&self, region_id: &str) -> Option<&MidiRegion> {
        self.midi_regions.iter().find(|r| r.id() == region_id)
    }

    #[inline]
    pub fn midi_regions(&self) -> &[MidiRegion] {
        &self.midi_regions
    }

    /// Unschedule a MIDI region, apply `edit`, then schedule it again.
    pub fn edit_midi_region<R>(
        &mut self,
        region_id: &str,
        scheduler: &mut Scheduler,
        edit: impl FnOnce(&mut MidiRegion) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let index = self
            .midi_regions
            .iter()
            .position(|r| r.id() == region_id)
            .ok_or_else(|| EngineError::clip_not_found(region_id).with_track(self.id.as_str()))?;
        if let Some(ids) = self.scheduled.remove(region_id) {
            scheduler.cancel_all(&ids);
        }
        let result = edit(&mut self.midi_regions[index]);
        let region = &self.midi_regions[index];
        let ids = schedule_notes(&self.id, region, scheduler);
        self.scheduled.insert(region.id().to_string(), ids);
        result
    }

    /// Split a MIDI region at timeline `time`. `None` when outside it.
    pub fn split_midi_region(
        &mut self,
        region_id: &str,
        time: f64,
        scheduler: &mut Scheduler,
    ) -> EngineResult<Option<RegionId>> {
        let tail = self.edit_midi_region(region_id, scheduler, |r| Ok(r.split(time)))?;
        let Some(tail) = tail else {
            return Ok(None);
        };
        let id = tail.id().to_string();
        self.add_midi_region(tail, scheduler)?;
        Ok(Some(id))
    }

    // ─────────────────────────────────────────────────────────────────
    // Instrument
    // ─────────────────────────────────────────────────────────────────

    pub fn set_midi_instrument(&mut self, config: InstrumentConfig) -> EngineResult<()> {
        self.require_kind(TrackKind::Midi, "Only MIDI tracks can have instruments")?;
        if let Some(old) = self.instrument.as_mut() {
            old.release_all();
        }
        self.instrument = Some(create_instrument(&config, self.sample_rate));
        self.instrument_config = Some(config);
        log::info!("Track {}: MIDI instrument set to {:?}", self.name, config.kind);
        Ok(())
    }

    pub fn midi_instrument(&self) -> Option<&InstrumentConfig> {
        self.instrument_config.as_ref()
    }

    pub fn instrument(&self) -> Option<&Instrument> {
        self.instrument.as_ref()
    }

    /// Trigger a note on the bound instrument at render-clock `time`.
    pub fn play_note(&mut self, pitch: u8, velocity: u8, duration: f64, time: f64) {
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.play_note(pitch, velocity, duration, time);
        }
    }

    /// Silence every sounding note.
    pub fn release_notes(&mut self) {
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.release_all();
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Sends
    // ─────────────────────────────────────────────────────────────────

    /// Create or replace the post-fader send to `target`.
    pub fn send_to(&mut self, target: &str, amount: f64) -> EngineResult<()> {
        if target == self.id {
            return Err(
                EngineError::invalid_parameter("A track cannot send to itself")
                    .with_track(self.id.as_str()),
            );
        }
        ensure_range("send amount", amount, 0.0, 1.0)
            .map_err(|e| e.with_track(self.id.as_str()))?;
        self.sends.insert(target.to_string(), amount as f32);
        Ok(())
    }

    pub fn remove_send(&mut self, target: &str) -> bool {
        self.sends.remove(target).is_some()
    }

    #[inline]
    pub fn sends(&self) -> &BTreeMap<TrackId, f32> {
        &self.sends
    }

    /// Mix a send arriving from another track into the next render.
    pub fn accept_send(&mut self, source: &AudioBuffer, amount: f32) {
        let mut input = self.send_buffer.as_buffer(source.frames);
        input.add_from(source, amount);
        self.send_pending = true;
    }

    // ─────────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some() || self.midi_recording
    }

    pub fn start_recording(&mut self, backend: &dyn CaptureBackend) -> EngineResult<()> {
        self.require_kind(TrackKind::Audio, "Only audio tracks can record")?;
        if self.is_recording() {
            return Err(EngineError::new(
                ErrorCode::RecordingAlreadyStarted,
                "Track is already recording",
            )
            .with_track(self.id.as_str()));
        }
        let mut device = backend
            .open()
            .map_err(|e| e.with_track(self.id.as_str()))?;
        device.start()?;
        self.recorder = Some(device);
        log::info!("Track {}: Recording started", self.name);
        Ok(())
    }

    /// Stop capture and add the recording as a region at `at` seconds.
    pub fn stop_recording(&mut self, at: f64) -> EngineResult<AudioRegion> {
        let Some(mut device) = self.recorder.take() else {
            return Err(EngineError::new(
                ErrorCode::RecordingNotStarted,
                "Track is not recording",
            )
            .with_track(self.id.as_str()));
        };
        let encoded = device.stop();
        device.close();

        let audio = decode_audio(&encoded?).map_err(|e| e.with_track(self.id.as_str()))?;
        let name = format!("Recording {}", chrono::Utc::now().to_rfc3339());
        let mut region = AudioRegion::new(
            audio,
            AudioRegionConfig::at(at.max(0.0)).with_name(name),
        )?;
        region.set_track_id(self.id.as_str());
        self.add_region(region.clone())?;
        log::info!("Track {}: Recording stopped, clip created", self.name);
        Ok(region)
    }

    pub fn start_midi_recording(&mut self, midi: &mut MidiManager, now_ms: f64) -> EngineResult<()> {
        self.require_kind(TrackKind::Midi, "Only MIDI tracks can record MIDI")?;
        if self.is_recording() {
            return Err(EngineError::new(
                ErrorCode::RecordingAlreadyStarted,
                "Track is already recording",
            )
            .with_track(self.id.as_str()));
        }
        midi.start_recording(&self.id, now_ms)?;
        self.midi_recording = true;
        log::info!("Track {}: MIDI recording started", self.name);
        Ok(())
    }

    /// Stop MIDI capture. `None` when nothing was played.
    pub fn stop_midi_recording(
        &mut self,
        midi: &mut MidiManager,
        now_ms: f64,
        scheduler: &mut Scheduler,
    ) -> EngineResult<Option<RegionId>> {
        if !self.midi_recording {
            return Err(EngineError::new(
                ErrorCode::RecordingNotStarted,
                "Track is not recording",
            )
            .with_track(self.id.as_str()));
        }
        self.midi_recording = false;
        let Some(region) = midi.stop_recording(now_ms)? else {
            log::warn!("Track {}: MIDI recording stopped, no notes recorded", self.name);
            return Ok(None);
        };
        let id = region.id().to_string();
        self.add_midi_region(region, scheduler)?;
        log::info!("Track {}: MIDI recording stopped, clip created", self.name);
        Ok(Some(id))
    }

    // ─────────────────────────────────────────────────────────────────
    // Rendering
    // ─────────────────────────────────────────────────────────────────

    /// Render one slice into the track's output buffer.
    pub fn render(&mut self, ctx: &RenderContext, frames: usize, audible: bool) {
        let frames = frames.min(self.out_buffer.capacity());
        let mut out = self.out_buffer.cleared(frames);

        if self.send_pending {
            let input = self.send_buffer.as_buffer(frames);
            out.add_from(&input, 1.0);
            let capacity = self.send_buffer.capacity();
            self.send_buffer.cleared(capacity);
            self.send_pending = false;
        }

        if ctx.playing {
            for player in &self.players {
                player.render(ctx.position, ctx.sample_rate, 1.0, &mut out);
            }
        }
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.render(ctx.time, &mut out);
        }

        self.rack.process(&mut out);
        self.strip.process(&mut out, audible);
        self.meter.process(&out);
    }

    /// The most recent rendered slice.
    pub fn output_buffer(&mut self, frames: usize) -> AudioBuffer<'_> {
        self.out_buffer.as_buffer(frames)
    }

    // ─────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────

    /// Stop recording, unschedule everything and release owned units.
    pub fn dispose(&mut self, scheduler: &mut Scheduler, midi: &mut MidiManager, now_ms: f64) {
        if let Some(mut device) = self.recorder.take() {
            if let Err(e) = device.stop() {
                log::error!("Track {}: failed to stop recording: {e}", self.name);
            }
            device.close();
        }
        if self.midi_recording {
            self.midi_recording = false;
            if let Err(e) = midi.stop_recording(now_ms) {
                log::error!("Track {}: failed to stop MIDI recording: {e}", self.name);
            }
        }

        self.players.clear();
        for (_, ids) in self.scheduled.drain() {
            scheduler.cancel_all(&ids);
        }
        self.midi_regions.clear();
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.release_all();
        }
        self.instrument = None;
        self.sends.clear();
        self.rack.clear();
        self.meter.reset();
        log::debug!("Track {} disposed", self.name);
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            color: self.color.clone(),
            volume: self.strip.volume_db(),
            pan: self.strip.pan(),
            mute: self.strip.is_muted(),
            solo: self.strip.is_soloed(),
            effects: self.rack.snapshot(),
            clips: self.regions.iter().map(AudioRegion::summary).collect(),
            midi_clips: self.midi_regions.iter().map(|r| r.id().to_string()).collect(),
            sends: self.sends.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::AudioData;
    use crate::capture::{InputCapture, encode_wav};
    use crate::effects::{EffectKind, create_effect};
    use crate::midi::{MidiInputInfo, MidiMessage, StaticMidiAccess};
    use crate::region::{MidiNote, MidiRegionConfig};
    use approx::assert_relative_eq;

    fn track(kind: TrackKind) -> Track {
        Track::new("track-a", "A", kind, TRACK_COLORS[0], 1000.0, 256)
    }

    fn clip(start: f64, seconds: f64) -> AudioRegion {
        let audio = AudioData::new(1000.0, vec![vec![0.5; (seconds * 1000.0) as usize]]).unwrap();
        AudioRegion::new(audio, AudioRegionConfig::at(start)).unwrap()
    }

    fn ctx(position: i64, playing: bool) -> RenderContext {
        RenderContext {
            sample_rate: 1000.0,
            position,
            playing,
            time: position as f64 / 1000.0,
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("MIDI".parse::<TrackKind>().unwrap(), TrackKind::Midi);
        assert_eq!(
            "bus".parse::<TrackKind>().unwrap_err().code(),
            ErrorCode::InvalidTrackType
        );
    }

    #[test]
    fn test_region_kind_rules() {
        let mut midi = track(TrackKind::Midi);
        let err = midi.add_region(clip(0.0, 1.0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTrackType);

        let mut audio = track(TrackKind::Audio);
        let mut scheduler = Scheduler::new(1000.0);
        let region = MidiRegion::new(MidiRegionConfig::at(0.0)).unwrap();
        let err = audio.add_midi_region(region, &mut scheduler).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTrackType);
        assert!(audio.set_midi_instrument(InstrumentConfig::default()).is_err());
    }

    #[test]
    fn test_add_region_claims_ownership() {
        let mut t = track(TrackKind::Audio);
        let region = clip(0.0, 1.0);
        let id = region.id().to_string();
        t.add_region(region).unwrap();
        assert_eq!(t.region(&id).unwrap().track_id(), Some("track-a"));

        let err = t.remove_region("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClipNotFound);
        t.remove_region(&id).unwrap();
        assert!(t.regions().is_empty());
        assert_eq!(t.playing_players(0.5), 0);
    }

    #[test]
    fn test_renders_only_while_playing() {
        let mut t = track(TrackKind::Audio);
        t.add_region(clip(0.0, 1.0)).unwrap();

        t.render(&ctx(0, false), 100, true);
        assert_eq!(t.output_buffer(100).peak(0), 0.0);

        t.render(&ctx(0, true), 100, true);
        assert_relative_eq!(t.output_buffer(100).peak(0), 0.5);
    }

    #[test]
    fn test_edit_region_reaches_playback() {
        let mut t = track(TrackKind::Audio);
        let region = clip(0.0, 1.0);
        let id = region.id().to_string();
        t.add_region(region).unwrap();
        t.edit_region(&id, |r| r.move_to(2.0)).unwrap();

        t.render(&ctx(0, true), 100, true);
        assert_eq!(t.output_buffer(100).peak(0), 0.0);
        assert_eq!(t.playing_players(2.5), 1);
    }

    #[test]
    fn test_split_adds_tail() {
        let mut t = track(TrackKind::Audio);
        let region = clip(2.0, 4.0);
        let id = region.id().to_string();
        t.add_region(region).unwrap();
        let tail = t.split_region(&id, 4.0).unwrap().unwrap();
        assert_eq!(t.regions().len(), 2);
        assert_relative_eq!(t.region(&tail).unwrap().start_time(), 4.0);
        assert_eq!(t.split_region(&id, 9.0).unwrap(), None);
    }

    #[test]
    fn test_midi_scheduling_follows_edits() {
        let mut t = track(TrackKind::Midi);
        let mut scheduler = Scheduler::new(1000.0);
        let region = MidiRegion::new(
            MidiRegionConfig::at(1.0).with_notes(vec![
                MidiNote::new(60, 100, 0.0, 0.5),
                MidiNote::new(64, 100, 0.5, 0.5),
            ]),
        )
        .unwrap();
        let id = region.id().to_string();
        t.add_midi_region(region, &mut scheduler).unwrap();
        assert_eq!(scheduler.len(), 2);

        t.edit_midi_region(&id, &mut scheduler, |r| r.move_to(2.0)).unwrap();
        assert_eq!(scheduler.len(), 2);

        t.remove_midi_region(&id, &mut scheduler).unwrap();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_send_rules() {
        let mut t = track(TrackKind::Audio);
        assert_eq!(
            t.send_to("track-a", 0.5).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            t.send_to("track-b", 1.5).unwrap_err().code(),
            ErrorCode::ParameterOutOfRange
        );
        t.send_to("track-b", 0.5).unwrap();
        t.send_to("track-b", 0.25).unwrap();
        assert_eq!(t.sends().len(), 1);
        assert_eq!(t.sends()["track-b"], 0.25);
        assert!(t.remove_send("track-b"));
    }

    #[test]
    fn test_accepted_send_is_rendered_once() {
        let mut t = track(TrackKind::Aux);
        let mut source = vec![1.0_f32; 20];
        t.accept_send(&AudioBuffer::new(&mut source, 2), 0.5);

        t.render(&ctx(0, true), 10, true);
        assert_relative_eq!(t.output_buffer(10).channel(0)[0], 0.5);
        t.render(&ctx(10, true), 10, true);
        assert_eq!(t.output_buffer(10).peak(0), 0.0);
    }

    #[test]
    fn test_recording_state_machine() {
        let backend = InputCapture::new(1000.0, 2);
        let mut t = track(TrackKind::Audio);
        assert_eq!(
            t.stop_recording(0.0).unwrap_err().code(),
            ErrorCode::RecordingNotStarted
        );

        t.start_recording(&backend).unwrap();
        assert_eq!(
            t.start_recording(&backend).unwrap_err().code(),
            ErrorCode::RecordingAlreadyStarted
        );

        let mut block = vec![0.25_f32; 200];
        backend.push(&AudioBuffer::new(&mut block, 2));
        let region = t.stop_recording(3.0).unwrap();
        assert_relative_eq!(region.start_time(), 3.0);
        assert_relative_eq!(region.duration(), 0.1);
        assert_eq!(t.regions().len(), 1);
        assert!(!t.is_recording());
        assert_eq!(backend.open_devices(), 0);
    }

    #[test]
    fn test_recording_rejected_on_midi_track() {
        let backend = InputCapture::new(1000.0, 2);
        let mut t = track(TrackKind::Midi);
        assert_eq!(
            t.start_recording(&backend).unwrap_err().code(),
            ErrorCode::InvalidTrackType
        );
        // The decoder itself works on captured material
        assert!(decode_audio(&encode_wav(1000.0, &[vec![0.0; 4]]).unwrap()).is_ok());
    }

    #[test]
    fn test_midi_recording_creates_region() {
        let mut midi = MidiManager::new();
        midi.set_access(Box::new(StaticMidiAccess::new(vec![MidiInputInfo {
            id: "in".into(),
            name: "Keys".into(),
            manufacturer: String::new(),
        }])));
        midi.select_input(None).unwrap();

        let mut scheduler = Scheduler::new(1000.0);
        let mut t = track(TrackKind::Midi);
        t.start_midi_recording(&mut midi, 0.0).unwrap();
        midi.handle_message(MidiMessage::new(0x90, 60, 100, 100.0));
        midi.handle_message(MidiMessage::new(0x80, 60, 0, 400.0));
        let id = t
            .stop_midi_recording(&mut midi, 500.0, &mut scheduler)
            .unwrap()
            .unwrap();
        assert_eq!(t.midi_region(&id).unwrap().notes().len(), 1);
        assert_eq!(scheduler.len(), 1);

        t.start_midi_recording(&mut midi, 600.0).unwrap();
        assert!(t.stop_midi_recording(&mut midi, 700.0, &mut scheduler).unwrap().is_none());
    }

    #[test]
    fn test_dispose_clears_everything() {
        let backend = InputCapture::new(1000.0, 2);
        let mut midi = MidiManager::new();
        let mut scheduler = Scheduler::new(1000.0);

        let mut t = track(TrackKind::Audio);
        t.add_region(clip(0.0, 1.0)).unwrap();
        t.rack_mut()
            .add_effect(create_effect(EffectKind::Gain), None)
            .unwrap();
        t.send_to("track-b", 0.5).unwrap();
        t.start_recording(&backend).unwrap();

        t.dispose(&mut scheduler, &mut midi, 0.0);
        assert!(!t.is_recording());
        assert!(t.sends().is_empty());
        assert!(t.rack().is_empty());
        assert_eq!(t.playing_players(0.5), 0);
        assert_eq!(backend.open_devices(), 0);
    }

    #[test]
    fn test_solo_rule() {
        let mut t = track(TrackKind::Audio);
        assert!(t.is_audible(false));
        assert!(!t.is_audible(true));
        t.set_solo(true);
        assert!(t.is_audible(true));
        t.set_mute(true);
        assert!(!t.is_audible(true));
    }
}
