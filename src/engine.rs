// src/engine.rs
//
// Root orchestrator: owns the transport, scheduler, tracks, master bus,
// analyzer, automation, loop recorder and MIDI manager, and renders them
// block by block.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::analyzer::{AudioAnalyzer, LoudnessData, PeakData, PhaseCorrelation, SpectrumData};
use crate::audio_buffer::{AudioBuffer, AudioData, ScratchBuffer, db_to_gain};
use crate::automation::{AutomatedValue, Automation, CurveType, DEFAULT_POINT_TOLERANCE};
use crate::capture::{CaptureBackend, InputCapture};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::effects::{Effect, create_effect_named};
use crate::error::{EngineError, EngineResult, ErrorCode, ensure_finite};
use crate::event::{EngineEvent, EventBus, Subscription};
use crate::ids::{self, EffectId, LaneId, RegionId, TrackId};
use crate::instrument::InstrumentConfig;
use crate::master_bus::{MasterBus, MasterLevel};
use crate::midi::{MidiManager, MidiMessage};
use crate::project::{ProjectData, TrackData, TrackSettings};
use crate::recording::{LoopRecordingOptions, LoopRecordingState, RecordingManager, Take};
use crate::region::{AudioRegion, MidiRegion, NoteScope, QuantizeOptions};
use crate::render::{Placeholder, RenderHandle, RenderJob, RenderTrack, placeholder_gain};
use crate::scheduler::{BlockPlan, Scheduler, SlicePlan, TransportEvent};
use crate::track::{
    MAX_VOLUME_DB, MIN_VOLUME_DB, RenderContext, TRACK_COLORS, Track, TrackKind, TrackSummary,
};
use crate::transport::{LoopRegion, PlaybackState, TimeSignature, Transport};

/// Automation target id addressing the master fader.
pub const MASTER_TARGET: &str = "master";

const PLAYER_LOAD: f32 = 0.02;
const EFFECT_LOAD: f32 = 0.05;
const PLACEHOLDER_BASE_HZ: f64 = 440.0;
const PLACEHOLDER_SPREAD_HZ: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Suspended,
    Running,
    Closed,
}

fn find_track<'a>(tracks: &'a [Track], id: &str) -> EngineResult<&'a Track> {
    tracks
        .iter()
        .find(|t| t.id() == id)
        .ok_or_else(|| EngineError::track_not_found(id))
}

fn find_track_mut<'a>(tracks: &'a mut [Track], id: &str) -> EngineResult<&'a mut Track> {
    tracks
        .iter_mut()
        .find(|t| t.id() == id)
        .ok_or_else(|| EngineError::track_not_found(id))
}

/// Track indices ordered so every send source renders before its target.
///
/// Ties keep creation order. Tracks caught in a send cycle go last, in
/// creation order.
fn send_order(tracks: &[Track]) -> Vec<usize> {
    let n = tracks.len();
    let mut indegree = vec![0usize; n];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, track) in tracks.iter().enumerate() {
        for target in track.sends().keys() {
            if let Some(j) = tracks.iter().position(|t| t.id() == target) {
                edges[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while let Some(i) = (0..n).find(|&i| !placed[i] && indegree[i] == 0) {
        placed[i] = true;
        order.push(i);
        for &j in &edges[i] {
            indegree[j] -= 1;
        }
    }
    if order.len() < n {
        log::warn!(
            "Send cycle between {} track(s); their sends arrive one slice late",
            n - order.len()
        );
        order.extend((0..n).filter(|&i| !placed[i]));
    }
    order
}

//
// ===============================
// MARK: Engine
// ===============================
//

pub struct Engine {
    config: EngineConfig,
    clock: SharedClock,
    state: EngineState,
    initialized: bool,
    events: EventBus,
    rng: SmallRng,

    transport: Transport,
    scheduler: Scheduler,
    plan: BlockPlan,
    /// Seconds rendered since construction; instruments and the
    /// metronome are scheduled on this clock.
    render_time: f64,

    tracks: Vec<Track>,
    render_order: Vec<usize>,
    order_dirty: bool,
    send_targets: Vec<(usize, f32)>,

    mix: ScratchBuffer,
    send_scratch: ScratchBuffer,
    input_scratch: ScratchBuffer,

    master: MasterBus,
    analyzer: AudioAnalyzer,
    automation: Automation,
    /// Last value written per (target, parameter).
    automation_applied: HashMap<(String, String), f64>,
    recording: RecordingManager,
    midi: MidiManager,

    capture: InputCapture,
    backend: Arc<dyn CaptureBackend>,
    record_starts: HashMap<TrackId, f64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("initialized", &self.initialized)
            .field("tracks", &self.tracks.len())
            .field("transport", &self.transport)
            .field("recording", &self.recording)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> EngineResult<Self> {
        config.validate()?;
        let sr = config.sample_rate;
        let max_block = config.max_block_size;
        let seed = config.rng_seed.unwrap_or(clock.now_ms() as u64);
        let events = EventBus::new();
        let capture = InputCapture::new(sr, 2);
        let backend: Arc<dyn CaptureBackend> = Arc::new(capture.clone());

        log::info!("Engine created: {sr} Hz, {max_block} frame blocks");
        Ok(Self {
            state: EngineState::Suspended,
            initialized: false,
            rng: SmallRng::seed_from_u64(seed),
            transport: Transport::new(sr),
            scheduler: Scheduler::new(sr),
            plan: BlockPlan::default(),
            render_time: 0.0,
            tracks: Vec::new(),
            render_order: Vec::new(),
            order_dirty: false,
            send_targets: Vec::new(),
            mix: ScratchBuffer::stereo(max_block),
            send_scratch: ScratchBuffer::stereo(max_block),
            input_scratch: ScratchBuffer::stereo(max_block),
            master: MasterBus::new(&config, Arc::clone(&clock)),
            analyzer: AudioAnalyzer::new(&config, Arc::clone(&clock)),
            automation: Automation::new(),
            automation_applied: HashMap::new(),
            recording: RecordingManager::new(sr, max_block, events.clone()),
            midi: MidiManager::new(),
            capture,
            backend,
            record_starts: HashMap::new(),
            events,
            clock,
            config,
        })
    }

    // -------------------------------
    // MARK: Lifecycle
    // -------------------------------

    pub fn initialize(&mut self) -> EngineResult<()> {
        if self.state == EngineState::Closed {
            return Err(closed());
        }
        if self.initialized {
            return Err(EngineError::new(
                ErrorCode::AlreadyInitialized,
                "Engine is already initialized",
            ));
        }
        self.initialized = true;
        self.state = EngineState::Running;
        log::info!("Engine initialized");
        Ok(())
    }

    pub fn suspend(&mut self) -> EngineResult<()> {
        self.check_lifecycle()?;
        self.state = EngineState::Suspended;
        log::info!("Engine suspended");
        Ok(())
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        self.check_lifecycle()?;
        self.state = EngineState::Running;
        log::info!("Engine resumed");
        Ok(())
    }

    /// Dispose every track and shut down. Terminal.
    pub fn close(&mut self) {
        if self.state == EngineState::Closed {
            return;
        }
        let now = self.clock.now_ms();
        self.recording.dispose(&mut self.scheduler);
        for track in &mut self.tracks {
            track.dispose(&mut self.scheduler, &mut self.midi, now);
        }
        self.tracks.clear();
        self.render_order.clear();
        self.record_starts.clear();
        self.scheduler.clear();
        self.transport.stop();
        self.state = EngineState::Closed;
        log::info!("Engine closed");
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.state == EngineState::Closed {
            return Err(closed());
        }
        Ok(())
    }

    fn check_lifecycle(&self) -> EngineResult<()> {
        self.check_open()?;
        if !self.initialized {
            return Err(EngineError::not_initialized());
        }
        Ok(())
    }

    fn check_running(&self) -> EngineResult<()> {
        self.check_lifecycle()?;
        if self.state == EngineState::Suspended {
            return Err(EngineError::new(
                ErrorCode::AudioContextSuspended,
                "Audio context is suspended",
            ));
        }
        Ok(())
    }

    // -------------------------------
    // MARK: Events
    // -------------------------------

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    // -------------------------------
    // MARK: Tracks
    // -------------------------------

    pub fn add_track(&mut self, name: impl Into<String>, kind: TrackKind) -> EngineResult<TrackId> {
        let id = ids::generate("track");
        self.add_track_with_id(id.clone(), name, kind)?;
        Ok(id)
    }

    pub fn add_track_with_id(
        &mut self,
        id: impl Into<TrackId>,
        name: impl Into<String>,
        kind: TrackKind,
    ) -> EngineResult<()> {
        self.check_open()?;
        let id = id.into();
        if self.tracks.iter().any(|t| t.id() == id) {
            return Err(EngineError::new(
                ErrorCode::TrackAlreadyExists,
                format!("Track {id} already exists"),
            )
            .with_track(id.as_str()));
        }
        let name = name.into();
        let color = TRACK_COLORS[self.rng.random_range(0..TRACK_COLORS.len())];
        let track = Track::new(
            id.as_str(),
            name.as_str(),
            kind,
            color,
            self.config.sample_rate,
            self.config.max_block_size,
        );
        self.tracks.push(track);
        self.order_dirty = true;
        log::info!("Track created: {name} ({kind})");
        self.events.emit(EngineEvent::TrackCreated { track_id: id, name });
        Ok(())
    }

    pub fn remove_track(&mut self, id: &str) -> EngineResult<()> {
        self.check_open()?;
        let index = self
            .tracks
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| EngineError::track_not_found(id))?;
        let mut track = self.tracks.remove(index);
        track.dispose(&mut self.scheduler, &mut self.midi, self.clock.now_ms());
        for other in &mut self.tracks {
            other.remove_send(id);
        }
        self.record_starts.remove(id);
        self.order_dirty = true;
        log::info!("Track deleted: {}", track.name());
        self.events.emit(EngineEvent::TrackDeleted {
            track_id: id.to_string(),
        });
        Ok(())
    }

    pub fn track(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn track_mut(&mut self, id: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track_summaries(&self) -> Vec<TrackSummary> {
        self.tracks.iter().map(Track::summary).collect()
    }

    pub fn set_track_volume(&mut self, id: &str, db: f64) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, id)?.set_volume(db)
    }

    pub fn set_track_pan(&mut self, id: &str, pan: f64) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, id)?.set_pan(pan)
    }

    pub fn set_track_mute(&mut self, id: &str, mute: bool) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, id)?.set_mute(mute);
        Ok(())
    }

    pub fn set_track_solo(&mut self, id: &str, solo: bool) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, id)?.set_solo(solo);
        Ok(())
    }

    /// Create or replace a send from `from` into `to`.
    pub fn route_to_send(&mut self, from: &str, to: &str, amount: f64) -> EngineResult<()> {
        find_track(&self.tracks, to)?;
        find_track_mut(&mut self.tracks, from)?.send_to(to, amount)?;
        self.order_dirty = true;
        log::debug!("Send {from} -> {to} at {amount}");
        Ok(())
    }

    pub fn remove_send(&mut self, from: &str, to: &str) -> EngineResult<bool> {
        let removed = find_track_mut(&mut self.tracks, from)?.remove_send(to);
        self.order_dirty |= removed;
        Ok(removed)
    }

    pub fn set_midi_instrument(&mut self, id: &str, config: InstrumentConfig) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, id)?.set_midi_instrument(config)
    }

    /// Current render order as track ids.
    pub fn render_order(&mut self) -> Vec<TrackId> {
        self.refresh_render_order();
        self.render_order
            .iter()
            .map(|&i| self.tracks[i].id().to_string())
            .collect()
    }

    fn refresh_render_order(&mut self) {
        if self.order_dirty || self.render_order.len() != self.tracks.len() {
            self.render_order = send_order(&self.tracks);
            self.order_dirty = false;
        }
    }

    // -------------------------------
    // MARK: Regions
    // -------------------------------

    pub fn add_region(&mut self, track_id: &str, region: AudioRegion) -> EngineResult<RegionId> {
        let id = region.id().to_string();
        find_track_mut(&mut self.tracks, track_id)?.add_region(region)?;
        Ok(id)
    }

    pub fn remove_region(&mut self, track_id: &str, region_id: &str) -> EngineResult<AudioRegion> {
        find_track_mut(&mut self.tracks, track_id)?.remove_region(region_id)
    }

    pub fn split_region(
        &mut self,
        track_id: &str,
        region_id: &str,
        time: f64,
    ) -> EngineResult<Option<RegionId>> {
        find_track_mut(&mut self.tracks, track_id)?.split_region(region_id, time)
    }

    pub fn edit_region<R>(
        &mut self,
        track_id: &str,
        region_id: &str,
        edit: impl FnOnce(&mut AudioRegion) -> EngineResult<R>,
    ) -> EngineResult<R> {
        find_track_mut(&mut self.tracks, track_id)?.edit_region(region_id, edit)
    }

    pub fn add_midi_region(&mut self, track_id: &str, region: MidiRegion) -> EngineResult<RegionId> {
        let id = region.id().to_string();
        find_track_mut(&mut self.tracks, track_id)?.add_midi_region(region, &mut self.scheduler)?;
        Ok(id)
    }

    pub fn remove_midi_region(&mut self, track_id: &str, region_id: &str) -> EngineResult<MidiRegion> {
        find_track_mut(&mut self.tracks, track_id)?.remove_midi_region(region_id, &mut self.scheduler)
    }

    /// Split a MIDI region at timeline `time`.
    pub fn split_midi_region(
        &mut self,
        track_id: &str,
        region_id: &str,
        time: f64,
    ) -> EngineResult<Option<RegionId>> {
        find_track_mut(&mut self.tracks, track_id)?.split_midi_region(
            region_id,
            time,
            &mut self.scheduler,
        )
    }

    pub fn edit_midi_region<R>(
        &mut self,
        track_id: &str,
        region_id: &str,
        edit: impl FnOnce(&mut MidiRegion) -> EngineResult<R>,
    ) -> EngineResult<R> {
        find_track_mut(&mut self.tracks, track_id)?.edit_midi_region(
            region_id,
            &mut self.scheduler,
            edit,
        )
    }

    /// Quantize at the current tempo.
    pub fn quantize_midi_region(
        &mut self,
        track_id: &str,
        region_id: &str,
        options: &QuantizeOptions,
        scope: NoteScope,
    ) -> EngineResult<()> {
        let bpm = self.transport.bpm();
        self.edit_midi_region(track_id, region_id, |r| r.quantize(options, bpm, scope))
    }

    pub fn humanize_midi_region(
        &mut self,
        track_id: &str,
        region_id: &str,
        amount: f64,
        scope: NoteScope,
    ) -> EngineResult<()> {
        let rng = &mut self.rng;
        find_track_mut(&mut self.tracks, track_id)?.edit_midi_region(
            region_id,
            &mut self.scheduler,
            |r| r.humanize(amount, scope, rng),
        )
    }

    // -------------------------------
    // MARK: Transport
    // -------------------------------

    pub fn play(&mut self) -> EngineResult<()> {
        self.check_running()?;
        if self.transport.is_playing() {
            log::warn!("Already playing");
            return Ok(());
        }
        self.transport.start();
        self.automation_applied.clear();
        let time = self.transport.seconds();
        log::info!("Playback started at {time:.3}s");
        self.events.emit(EngineEvent::PlaybackPlay { time });
        Ok(())
    }

    pub fn stop(&mut self) -> EngineResult<()> {
        self.check_running()?;
        if self.transport.state() == PlaybackState::Stopped {
            log::warn!("Already stopped");
            return Ok(());
        }
        let time = self.transport.seconds();
        self.transport.stop();
        self.release_all_notes();
        log::info!("Playback stopped");
        self.events.emit(EngineEvent::PlaybackStop { time });
        Ok(())
    }

    pub fn pause(&mut self) -> EngineResult<()> {
        self.check_running()?;
        if !self.transport.is_playing() {
            log::warn!("Not playing, nothing to pause");
            return Ok(());
        }
        self.transport.pause();
        self.release_all_notes();
        let time = self.transport.seconds();
        log::info!("Playback paused at {time:.3}s");
        self.events.emit(EngineEvent::PlaybackPause { time });
        Ok(())
    }

    fn release_all_notes(&mut self) {
        for track in &mut self.tracks {
            track.release_notes();
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.transport.state()
    }

    pub fn tempo(&self) -> f64 {
        self.transport.bpm()
    }

    /// Scheduled MIDI keeps its timeline seconds.
    pub fn set_tempo(&mut self, bpm: f64) -> EngineResult<()> {
        self.check_open()?;
        self.transport.set_bpm(bpm)?;
        log::info!("Tempo set to {bpm} BPM");
        Ok(())
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.transport.time_signature()
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> EngineResult<()> {
        self.check_open()?;
        self.transport.set_time_signature(numerator, denominator)?;
        log::info!("Time signature set to {numerator}/{denominator}");
        Ok(())
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.transport.loop_region()
    }

    pub fn set_loop(&mut self, start: f64, end: f64, enabled: bool) -> EngineResult<()> {
        self.check_open()?;
        self.transport.set_loop(start, end, enabled)
    }

    pub fn current_time(&self) -> f64 {
        self.transport.seconds()
    }

    /// Seek the transport.
    pub fn set_current_time(&mut self, seconds: f64) -> EngineResult<()> {
        self.check_running()?;
        ensure_finite("time", seconds)?;
        if seconds < 0.0 {
            return Err(EngineError::invalid_parameter(format!(
                "Time must be zero or more, got {seconds}"
            )));
        }
        self.transport.set_seconds(seconds);
        self.release_all_notes();
        self.automation_applied.clear();
        Ok(())
    }

    // -------------------------------
    // MARK: Recording
    // -------------------------------

    /// Replace the capture backend used by track and loop recording.
    pub fn set_capture_backend(&mut self, backend: Arc<dyn CaptureBackend>) {
        self.backend = backend;
    }

    /// The built-in backend fed by [`process_block_with_input`](Self::process_block_with_input).
    pub fn input_capture(&self) -> &InputCapture {
        &self.capture
    }

    pub fn start_recording(&mut self, track_id: &str) -> EngineResult<()> {
        self.check_running()?;
        find_track_mut(&mut self.tracks, track_id)?.start_recording(self.backend.as_ref())?;
        self.events.emit(EngineEvent::RecordStart {
            track_id: track_id.to_string(),
        });
        Ok(())
    }

    /// Stop capture and place the take at the current transport position.
    pub fn stop_recording(&mut self, track_id: &str) -> EngineResult<RegionId> {
        self.check_running()?;
        let at = self.transport.seconds().max(0.0);
        let region = find_track_mut(&mut self.tracks, track_id)?.stop_recording(at)?;
        self.events.emit(EngineEvent::RecordStop {
            track_id: track_id.to_string(),
            duration: region.duration(),
        });
        Ok(region.id().to_string())
    }

    pub fn start_midi_recording(&mut self, track_id: &str) -> EngineResult<()> {
        self.check_running()?;
        let now = self.clock.now_ms();
        find_track_mut(&mut self.tracks, track_id)?.start_midi_recording(&mut self.midi, now)?;
        self.record_starts
            .insert(track_id.to_string(), self.transport.seconds().max(0.0));
        self.events.emit(EngineEvent::RecordStart {
            track_id: track_id.to_string(),
        });
        Ok(())
    }

    /// `None` when nothing was played.
    pub fn stop_midi_recording(&mut self, track_id: &str) -> EngineResult<Option<RegionId>> {
        self.check_running()?;
        let now = self.clock.now_ms();
        let track = find_track_mut(&mut self.tracks, track_id)?;
        let region_id = track.stop_midi_recording(&mut self.midi, now, &mut self.scheduler)?;
        let at = self.record_starts.remove(track_id).unwrap_or(0.0);

        let mut duration = 0.0;
        if let Some(id) = &region_id {
            duration = track.edit_midi_region(id, &mut self.scheduler, |r| {
                r.move_to(at)?;
                Ok(r.duration())
            })?;
        }
        self.events.emit(EngineEvent::RecordStop {
            track_id: track_id.to_string(),
            duration,
        });
        Ok(region_id)
    }

    pub fn handle_midi_message(&mut self, message: MidiMessage) {
        self.midi.handle_message(message);
    }

    pub fn midi(&self) -> &MidiManager {
        &self.midi
    }

    pub fn midi_mut(&mut self) -> &mut MidiManager {
        &mut self.midi
    }

    // -------------------------------
    // MARK: Loop recording
    // -------------------------------

    pub fn start_loop_recording(&mut self, options: LoopRecordingOptions) -> EngineResult<()> {
        self.check_running()?;
        let track = find_track(&self.tracks, &options.track_id)?;
        if track.kind() != TrackKind::Audio {
            return Err(EngineError::new(
                ErrorCode::InvalidTrackType,
                "Loop recording needs an audio track",
            )
            .with_track(options.track_id.as_str()));
        }
        self.recording.start(
            &options,
            self.backend.as_ref(),
            &mut self.transport,
            &mut self.scheduler,
        )
    }

    pub fn stop_loop_recording(&mut self) -> EngineResult<&[Take]> {
        self.check_running()?;
        for track in &mut self.tracks {
            track.release_notes();
        }
        self.recording.stop(&mut self.transport, &mut self.scheduler)
    }

    pub fn loop_recording_state(&self) -> LoopRecordingState {
        self.recording.state()
    }

    pub fn takes(&self) -> &[Take] {
        self.recording.takes()
    }

    pub fn best_take(&self) -> Option<&Take> {
        self.recording.best_take()
    }

    pub fn set_metronome_volume(&mut self, volume: f32) -> EngineResult<()> {
        self.recording.set_metronome_volume(volume)
    }

    pub fn recording(&self) -> &RecordingManager {
        &self.recording
    }

    // -------------------------------
    // MARK: Effects
    // -------------------------------

    /// Insert an effect into a track's rack at `index` (end when `None`).
    pub fn connect_effect(
        &mut self,
        track_id: &str,
        effect: Box<dyn Effect>,
        index: Option<usize>,
    ) -> EngineResult<EffectId> {
        let effect_id = effect.id().to_string();
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .add_effect(effect, index)
            .map_err(|e| e.with_track(track_id))?;
        self.events.emit(EngineEvent::EffectAdded {
            track_id: track_id.to_string(),
            effect_id: effect_id.clone(),
        });
        Ok(effect_id)
    }

    /// Create an effect by name (`gain`, `pan`, `delay`, `reverb`) and append it.
    pub fn add_effect(&mut self, track_id: &str, name: &str) -> EngineResult<EffectId> {
        find_track(&self.tracks, track_id)?;
        let effect = create_effect_named(name).map_err(|e| e.with_track(track_id))?;
        self.connect_effect(track_id, effect, None)
    }

    pub fn remove_effect(&mut self, track_id: &str, effect_id: &str) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .remove_effect(effect_id)
            .map_err(|e| e.with_track(track_id))
    }

    pub fn reorder_effect(&mut self, track_id: &str, from: usize, to: usize) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .reorder_effect(from, to)
            .map_err(|e| e.with_track(track_id))
    }

    pub fn set_effect_enabled(
        &mut self,
        track_id: &str,
        effect_id: &str,
        enabled: bool,
    ) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .set_effect_enabled(effect_id, enabled)
            .map_err(|e| e.with_track(track_id))
    }

    pub fn bypass_effects(&mut self, track_id: &str, bypass: bool) -> EngineResult<()> {
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .bypass_all(bypass);
        Ok(())
    }

    pub fn set_effect_param(
        &mut self,
        track_id: &str,
        effect_id: &str,
        name: &str,
        value: f64,
    ) -> EngineResult<()> {
        ensure_finite(name, value)?;
        find_track_mut(&mut self.tracks, track_id)?
            .rack_mut()
            .effect_mut(effect_id)
            .and_then(|effect| effect.set_param(name, value as f32))
            .map_err(|e| e.with_track(track_id))
    }

    // -------------------------------
    // MARK: Automation
    // -------------------------------

    pub fn automation(&self) -> &Automation {
        &self.automation
    }

    pub fn automation_mut(&mut self) -> &mut Automation {
        self.automation_applied.clear();
        &mut self.automation
    }

    /// Lane over `target_id` (a track, an effect or [`MASTER_TARGET`]).
    pub fn create_automation_lane(
        &mut self,
        target_id: &str,
        parameter: &str,
        curve: CurveType,
    ) -> LaneId {
        self.automation.create_lane(target_id, parameter, curve)
    }

    pub fn delete_automation_lane(&mut self, lane_id: &str) -> bool {
        self.automation_applied.clear();
        self.automation.delete_lane(lane_id)
    }

    pub fn add_automation_point(&mut self, lane_id: &str, time: f64, value: f64) -> EngineResult<()> {
        self.automation.add_point(lane_id, time, value)?;
        self.automation_applied.clear();
        self.events.emit(EngineEvent::AutomationPointAdded {
            lane_id: lane_id.to_string(),
            time,
            value,
        });
        Ok(())
    }

    pub fn remove_automation_point(&mut self, lane_id: &str, time: f64) -> EngineResult<bool> {
        let removed = self
            .automation
            .remove_point(lane_id, time, DEFAULT_POINT_TOLERANCE)?;
        if removed {
            self.automation_applied.clear();
            self.events.emit(EngineEvent::AutomationPointRemoved {
                lane_id: lane_id.to_string(),
                time,
            });
        }
        Ok(removed)
    }

    pub fn start_automation_recording(&mut self, lane_id: &str) -> EngineResult<()> {
        self.automation.start_recording(lane_id)?;
        self.events.emit(EngineEvent::AutomationRecordingStarted {
            lane_id: lane_id.to_string(),
        });
        Ok(())
    }

    pub fn stop_automation_recording(&mut self) -> Option<LaneId> {
        let lane_id = self.automation.stop_recording()?;
        self.events.emit(EngineEvent::AutomationRecordingStopped {
            lane_id: lane_id.clone(),
        });
        Some(lane_id)
    }

    /// Record `value` at the current transport time.
    pub fn record_automation_value(&mut self, value: f64) -> bool {
        let time = self.transport.seconds().max(0.0);
        self.automation.record_point(time, value)
    }

    pub fn automation_value(&self, lane_id: &str, time: f64) -> Option<f64> {
        self.automation.value_at(lane_id, time)
    }

    fn apply_automation(&mut self, seconds: f64) {
        for AutomatedValue {
            target_id,
            parameter,
            value,
        } in self.automation.evaluate(seconds)
        {
            let key = (target_id, parameter);
            if self.automation_applied.get(&key) == Some(&value) {
                continue;
            }
            self.apply_automated(&key.0, &key.1, value);
            self.automation_applied.insert(key, value);
        }
    }

    fn apply_automated(&mut self, target: &str, parameter: &str, value: f64) {
        let result = if target == MASTER_TARGET {
            match parameter {
                "volume" => self
                    .master
                    .set_volume(value.clamp(MIN_VOLUME_DB, MAX_VOLUME_DB)),
                "mute" => {
                    self.master.set_mute(value >= 0.5);
                    Ok(())
                }
                other => Err(unknown_target_param(target, other)),
            }
        } else if let Some(track) = self.tracks.iter_mut().find(|t| t.id() == target) {
            match parameter {
                "volume" => track.set_volume(value.clamp(MIN_VOLUME_DB, MAX_VOLUME_DB)),
                "pan" => track.set_pan(value.clamp(-1.0, 1.0)),
                "mute" => {
                    track.set_mute(value >= 0.5);
                    Ok(())
                }
                other => Err(unknown_target_param(target, other)),
            }
        } else {
            self.tracks
                .iter_mut()
                .find_map(|t| t.rack_mut().effect_mut(target).ok())
                .ok_or_else(|| EngineError::effect_not_found(target))
                .and_then(|effect| effect.set_param(parameter, value as f32))
        };
        if let Err(e) = result {
            log::warn!("Automation on {target}.{parameter} skipped: {e}");
        }
    }

    // -------------------------------
    // MARK: Master and analysis
    // -------------------------------

    pub fn master(&self) -> &MasterBus {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut MasterBus {
        &mut self.master
    }

    pub fn set_master_volume(&mut self, db: f64) -> EngineResult<()> {
        self.master.set_volume(db)
    }

    pub fn master_level(&mut self) -> MasterLevel {
        self.master.level()
    }

    pub fn is_output_clipping(&self) -> bool {
        self.master.is_output_clipping()
    }

    pub fn master_spectrum(&mut self) -> Vec<f32> {
        self.master.spectrum()
    }

    pub fn master_waveform(&self) -> Vec<f32> {
        self.master.waveform()
    }

    pub fn analyzer(&self) -> &AudioAnalyzer {
        &self.analyzer
    }

    pub fn analyzer_mut(&mut self) -> &mut AudioAnalyzer {
        &mut self.analyzer
    }

    pub fn spectrum_data(&mut self) -> SpectrumData {
        self.analyzer.spectrum_data()
    }

    pub fn peak_data(&self, window_count: usize) -> PeakData {
        self.analyzer.peak_data(window_count)
    }

    pub fn loudness_data(&mut self) -> LoudnessData {
        self.analyzer.loudness_data()
    }

    pub fn phase_correlation(&self) -> PhaseCorrelation {
        self.analyzer.phase_correlation()
    }

    pub fn reset_analysis(&mut self) {
        self.analyzer.reset();
        self.master.reset_peaks();
    }

    /// Rough load estimate from playing regions and enabled effects.
    pub fn cpu_load(&self) -> f32 {
        let seconds = self.transport.seconds();
        let players: usize = if self.transport.is_playing() {
            self.tracks.iter().map(|t| t.playing_players(seconds)).sum()
        } else {
            0
        };
        let effects: usize = self.tracks.iter().map(|t| t.rack().enabled_count()).sum();
        (players as f32 * PLAYER_LOAD + effects as f32 * EFFECT_LOAD).min(1.0)
    }

    // -------------------------------
    // MARK: Real-time processing
    // -------------------------------

    /// Render the next block into `output` (planar).
    pub fn process_block(&mut self, output: &mut AudioBuffer) {
        self.process(None, output);
    }

    /// Render the next block, feeding `input` to any open capture device.
    pub fn process_block_with_input(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        self.process(Some(input), output);
    }

    fn process(&mut self, input: Option<&AudioBuffer>, output: &mut AudioBuffer) {
        output.clear();
        if self.state != EngineState::Running {
            return;
        }
        self.refresh_render_order();

        let max_block = self.mix.capacity();
        let mut done = 0;
        while done < output.frames {
            let frames = (output.frames - done).min(max_block);
            self.process_chunk(input, done, frames);
            let mix = self.mix.as_buffer(frames);
            output.write_at(done, &mix);
            done += frames;
        }
    }

    fn process_chunk(&mut self, input: Option<&AudioBuffer>, input_offset: usize, frames: usize) {
        let sr = self.config.sample_rate;
        let playing = self.transport.is_playing();

        let mut plan = std::mem::take(&mut self.plan);
        self.scheduler
            .compile_block(&mut self.transport, frames, &mut plan);
        self.mix.cleared(frames);
        let any_solo = self.tracks.iter().any(|t| t.channel().is_soloed());

        for slice in &plan.slices {
            let time = self.render_time + slice.start_frame as f64 / sr;
            for event in &slice.events {
                self.dispatch(event, time);
            }
            if slice.frame_count == 0 {
                continue;
            }
            if let Some(input) = input {
                self.feed_input(input, input_offset + slice.start_frame, slice.frame_count);
            }
            if playing && !self.automation.lanes().is_empty() {
                self.apply_automation(slice.position as f64 / sr);
            }
            self.render_slice(slice, frames, time, playing, any_solo);
        }
        self.plan = plan;

        let mut mix = self.mix.as_buffer(frames);
        self.recording.render_metronome(self.render_time, &mut mix);
        self.master.process(&mut mix);
        self.analyzer.process(&mix);
        self.render_time += frames as f64 / sr;
    }

    fn dispatch(&mut self, event: &TransportEvent, time: f64) {
        match event {
            TransportEvent::Note {
                track_id,
                pitch,
                velocity,
                duration,
            } => {
                if let Some(track) = self.tracks.iter_mut().find(|t| t.id() == track_id) {
                    track.play_note(*pitch, *velocity, *duration, time);
                }
            }
            TransportEvent::CountInBeat {
                bar,
                beat,
                total,
                remaining,
            } => {
                let beat_seconds = self.transport.seconds_per_beat();
                self.recording
                    .on_count_in_beat(*bar, *beat, *total, *remaining, time, beat_seconds);
            }
            TransportEvent::CountInComplete => {
                if let Err(e) = self.recording.on_count_in_complete() {
                    log::error!("Loop recording failed to start capture: {e}");
                }
            }
            TransportEvent::LoopBoundary => {
                self.recording.on_loop_boundary(self.transport.bpm());
            }
        }
    }

    fn feed_input(&mut self, input: &AudioBuffer, offset: usize, frames: usize) {
        if input.channels == 0 {
            return;
        }
        let available = input.frames.saturating_sub(offset).min(frames);
        let mut buf = self.input_scratch.cleared(frames);
        if available == 0 {
            return;
        }
        for ch in 0..buf.channels {
            let src = &input.channel(ch % input.channels)[offset..offset + available];
            buf.channel_mut(ch)[..available].copy_from_slice(src);
        }
        self.capture.push(&buf);
    }

    /// Render every track for one slice and sum into the chunk mix.
    fn render_slice(
        &mut self,
        slice: &SlicePlan,
        chunk_frames: usize,
        time: f64,
        playing: bool,
        any_solo: bool,
    ) {
        let frames = slice.frame_count;
        let ctx = RenderContext {
            sample_rate: self.config.sample_rate,
            position: slice.position,
            playing,
            time,
        };

        for k in 0..self.render_order.len() {
            let i = self.render_order[k];
            let audible = self.tracks[i].is_audible(any_solo);
            self.tracks[i].render(&ctx, frames, audible);

            {
                let mut mix = self.mix.as_buffer(chunk_frames);
                let out = self.tracks[i].output_buffer(frames);
                for ch in 0..mix.channels {
                    let src = out.channel(ch % out.channels);
                    let dst = &mut mix.channel_mut(ch)[slice.start_frame..slice.start_frame + frames];
                    for (d, s) in dst.iter_mut().zip(src) {
                        *d += s;
                    }
                }
            }

            self.send_targets.clear();
            for (target, amount) in self.tracks[i].sends() {
                if let Some(j) = self.tracks.iter().position(|t| t.id() == target) {
                    self.send_targets.push((j, *amount));
                }
            }
            if self.send_targets.is_empty() {
                continue;
            }
            {
                let mut scratch = self.send_scratch.cleared(frames);
                scratch.add_from(&self.tracks[i].output_buffer(frames), 1.0);
            }
            for &(j, amount) in &self.send_targets {
                let source = self.send_scratch.as_buffer(frames);
                self.tracks[j].accept_send(&source, amount);
            }
        }
    }

    // -------------------------------
    // MARK: Offline render
    // -------------------------------

    /// Build an isolated render of the current arrangement.
    pub fn prepare_render(&mut self, duration: f64, tail: f64) -> EngineResult<RenderJob> {
        let mut job = RenderJob::new(
            self.config.sample_rate,
            self.config.max_block_size,
            duration,
            tail,
        )?;
        let total = duration + tail;
        let active = self.tracks.iter().filter(|t| !t.channel().is_muted()).count();

        for track in self.tracks.iter().filter(|t| !t.channel().is_muted()) {
            let has_regions = !track.regions().is_empty() || !track.midi_regions().is_empty();
            let placeholder = if has_regions {
                None
            } else {
                Some(Placeholder {
                    frequency: PLACEHOLDER_BASE_HZ
                        + self.rng.random_range(0.0..PLACEHOLDER_SPREAD_HZ),
                    gain: placeholder_gain(track.channel().volume_db(), active),
                })
            };
            job.add_track(RenderTrack {
                name: track.name().to_string(),
                regions: track
                    .regions()
                    .iter()
                    .filter(|r| r.start_time() < total)
                    .cloned()
                    .collect(),
                midi_regions: track
                    .midi_regions()
                    .iter()
                    .filter(|r| r.start_time() < total)
                    .cloned()
                    .collect(),
                instrument: track.instrument().map(|i| i.offline_instance()),
                rack: track.rack().offline_copy(),
                gain: db_to_gain(track.channel().volume_db()),
                pan: track.channel().pan(),
                placeholder,
            });
        }
        log::info!(
            "Offline render prepared: {active} active track(s), {total:.2}s"
        );
        Ok(job)
    }

    /// Mix the arrangement down to stereo without touching live playback.
    pub fn render_offline(&mut self, duration: f64, tail: f64) -> EngineResult<AudioData> {
        self.check_running()?;
        self.prepare_render(duration, tail)?.run()
    }

    /// Same as [`render_offline`](Self::render_offline) on a worker thread.
    pub fn render_offline_async(&mut self, duration: f64, tail: f64) -> EngineResult<RenderHandle> {
        self.check_running()?;
        Ok(self.prepare_render(duration, tail)?.spawn())
    }

    // -------------------------------
    // MARK: Persistence
    // -------------------------------

    /// Track settings, tempo and meter. Effects, clips and automation are
    /// not included.
    pub fn serialize(&self) -> ProjectData {
        ProjectData {
            tracks: self
                .tracks
                .iter()
                .enumerate()
                .map(|(order, track)| TrackData {
                    id: track.id().to_string(),
                    name: track.name().to_string(),
                    kind: track.kind(),
                    color: track.color().to_string(),
                    order,
                    settings: TrackSettings {
                        volume: track.channel().volume_db(),
                        pan: track.channel().pan(),
                        mute: track.channel().is_muted(),
                        solo: track.channel().is_soloed(),
                        record_arm: track.record_arm(),
                        monitor: track.monitor(),
                        frozen: track.frozen(),
                        input: track.input().to_string(),
                        output: track.output().to_string(),
                    },
                })
                .collect(),
            tempo: self.transport.bpm(),
            time_signature: self.transport.time_signature(),
            effects: Vec::new(),
            clips: Vec::new(),
        }
    }

    /// Replace every track with the project's tracks and apply its settings.
    pub fn deserialize(&mut self, project: &ProjectData) -> EngineResult<()> {
        self.check_open()?;
        let ts = project.time_signature;
        TimeSignature::new(ts.numerator, ts.denominator)?;
        crate::error::ensure_range(
            "tempo",
            project.tempo,
            crate::transport::MIN_BPM,
            crate::transport::MAX_BPM,
        )?;

        let existing: Vec<TrackId> = self.tracks.iter().map(|t| t.id().to_string()).collect();
        for id in existing {
            self.remove_track(&id)?;
        }

        let mut ordered: Vec<&TrackData> = project.tracks.iter().collect();
        ordered.sort_by_key(|t| t.order);
        for data in ordered {
            self.add_track_with_id(data.id.as_str(), data.name.as_str(), data.kind)?;
            let track = find_track_mut(&mut self.tracks, &data.id)?;
            let s = &data.settings;
            track.set_color(data.color.as_str());
            track.set_volume(f64::from(s.volume))?;
            track.set_pan(f64::from(s.pan))?;
            track.set_mute(s.mute);
            track.set_solo(s.solo);
            track.set_record_arm(s.record_arm);
            track.set_monitor(s.monitor);
            track.set_frozen(s.frozen);
            track.set_input(s.input.as_str());
            track.set_output(s.output.as_str());
        }

        self.transport.set_bpm(project.tempo)?;
        self.transport.set_time_signature(ts.numerator, ts.denominator)?;
        log::info!("Project loaded: {} track(s)", self.tracks.len());
        Ok(())
    }
}

fn closed() -> EngineError {
    EngineError::new(ErrorCode::AudioContextClosed, "Audio context is closed")
}

fn unknown_target_param(target: &str, parameter: &str) -> EngineError {
    EngineError::invalid_parameter(format!("Unknown parameter '{parameter}' on {target}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::effects::{EffectKind, create_effect};
    use crate::region::{AudioRegionConfig, MidiNote, MidiRegionConfig};
    use approx::assert_relative_eq;
    use parking_lot::Mutex;

    const SR: f64 = 1000.0;

    fn config() -> EngineConfig {
        EngineConfig::new()
            .with_sample_rate(SR)
            .with_max_block_size(256)
            .with_rng_seed(7)
    }

    fn engine() -> Engine {
        let mut engine = Engine::with_clock(config(), Arc::new(ManualClock::new(0.0))).unwrap();
        engine.initialize().unwrap();
        engine
    }

    fn record_events(engine: &Engine) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine.subscribe(move |e| sink.lock().push(e.name().to_string()));
        seen
    }

    fn render(engine: &mut Engine, frames: usize) -> Vec<f32> {
        let mut data = vec![0.0; frames * 2];
        let mut out = AudioBuffer::new(&mut data, 2);
        engine.process_block(&mut out);
        data
    }

    fn dc_clip(start: f64, seconds: f64, level: f32) -> AudioRegion {
        let audio = AudioData::new(SR, vec![vec![level; (seconds * SR) as usize]]).unwrap();
        AudioRegion::new(audio, AudioRegionConfig::at(start)).unwrap()
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut engine = Engine::with_clock(config(), Arc::new(ManualClock::new(0.0))).unwrap();
        assert_eq!(engine.state(), EngineState::Suspended);
        assert_eq!(engine.play().unwrap_err().code(), ErrorCode::NotInitialized);

        engine.initialize().unwrap();
        assert_eq!(
            engine.initialize().unwrap_err().code(),
            ErrorCode::AlreadyInitialized
        );

        engine.suspend().unwrap();
        assert_eq!(
            engine.play().unwrap_err().code(),
            ErrorCode::AudioContextSuspended
        );
        engine.resume().unwrap();
        engine.play().unwrap();

        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.play().unwrap_err().code(), ErrorCode::AudioContextClosed);
        assert_eq!(
            engine.add_track("A", TrackKind::Audio).unwrap_err().code(),
            ErrorCode::AudioContextClosed
        );
        assert_eq!(
            engine.initialize().unwrap_err().code(),
            ErrorCode::AudioContextClosed
        );
    }

    #[test]
    fn test_track_registry_events() {
        let mut engine = engine();
        let seen = record_events(&engine);

        let a = engine.add_track("Drums", TrackKind::Audio).unwrap();
        assert!(TRACK_COLORS.contains(&engine.track(&a).unwrap().color()));
        assert_eq!(
            engine
                .add_track_with_id(a.as_str(), "Dup", TrackKind::Audio)
                .unwrap_err()
                .code(),
            ErrorCode::TrackAlreadyExists
        );
        engine.remove_track(&a).unwrap();
        assert_eq!(
            engine.remove_track(&a).unwrap_err().code(),
            ErrorCode::TrackNotFound
        );
        assert_eq!(
            engine.set_track_volume(&a, -3.0).unwrap_err().code(),
            ErrorCode::TrackNotFound
        );
        assert_eq!(*seen.lock(), vec!["track:created", "track:deleted"]);
    }

    #[test]
    fn test_transport_is_idempotent() {
        let mut engine = engine();
        let seen = record_events(&engine);
        engine.play().unwrap();
        engine.play().unwrap();
        engine.pause().unwrap();
        engine.pause().unwrap();
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["playback:play", "playback:pause", "playback:stop"]
        );
    }

    #[test]
    fn test_tempo_and_meter_validation() {
        let mut engine = engine();
        engine.set_tempo(140.0).unwrap();
        assert_eq!(engine.tempo(), 140.0);
        assert_eq!(
            engine.set_tempo(19.0).unwrap_err().code(),
            ErrorCode::ParameterOutOfRange
        );
        assert_eq!(
            engine.set_tempo(1000.0).unwrap_err().code(),
            ErrorCode::ParameterOutOfRange
        );
        assert_eq!(engine.tempo(), 140.0);
        assert!(engine.set_time_signature(7, 8).is_ok());
        assert_eq!(
            engine.set_time_signature(4, 6).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            engine.set_loop(2.0, 1.0, true).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
    }

    #[test]
    fn test_send_sources_render_first() {
        let mut engine = engine();
        let bus = engine.add_track("Bus", TrackKind::Aux).unwrap();
        let a = engine.add_track("A", TrackKind::Audio).unwrap();
        let b = engine.add_track("B", TrackKind::Audio).unwrap();
        engine.route_to_send(&a, &bus, 0.5).unwrap();
        engine.route_to_send(&b, &a, 0.5).unwrap();
        assert_eq!(engine.render_order(), vec![b.clone(), a.clone(), bus.clone()]);

        assert_eq!(
            engine.route_to_send(&a, "missing", 0.5).unwrap_err().code(),
            ErrorCode::TrackNotFound
        );
        engine.remove_track(&a).unwrap();
        assert!(engine.track(&b).unwrap().sends().is_empty());
        assert_eq!(engine.render_order(), vec![bus, b]);
    }

    #[test]
    fn test_send_cycle_still_renders_every_track() {
        let mut engine = engine();
        let a = engine.add_track("A", TrackKind::Aux).unwrap();
        let b = engine.add_track("B", TrackKind::Aux).unwrap();
        let c = engine.add_track("C", TrackKind::Aux).unwrap();
        engine.route_to_send(&a, &b, 1.0).unwrap();
        engine.route_to_send(&b, &a, 1.0).unwrap();
        assert_eq!(engine.render_order(), vec![c, a, b]);
    }

    #[test]
    fn test_region_plays_through_master() {
        let mut engine = engine();
        let t = engine.add_track("A", TrackKind::Audio).unwrap();
        engine.add_region(&t, dc_clip(0.1, 0.5, 0.25)).unwrap();

        let silent = render(&mut engine, 300);
        assert!(silent.iter().all(|s| *s == 0.0));

        engine.play().unwrap();
        let out = render(&mut engine, 300);
        assert_eq!(out[50], 0.0);
        assert_relative_eq!(out[200], 0.25, epsilon = 1e-4);
        assert_relative_eq!(out[300 + 200], 0.25, epsilon = 1e-4);
        assert_relative_eq!(engine.current_time(), 0.3);
        assert!(engine.cpu_load() > 0.0);
    }

    #[test]
    fn test_suspended_engine_outputs_silence() {
        let mut engine = engine();
        let t = engine.add_track("A", TrackKind::Audio).unwrap();
        engine.add_region(&t, dc_clip(0.0, 1.0, 0.5)).unwrap();
        engine.play().unwrap();
        engine.suspend().unwrap();
        assert!(render(&mut engine, 100).iter().all(|s| *s == 0.0));
        assert_eq!(engine.current_time(), 0.0);
    }

    #[test]
    fn test_mute_solo_and_send_mix() {
        let mut engine = engine();
        let a = engine.add_track("A", TrackKind::Audio).unwrap();
        let bus = engine.add_track("Bus", TrackKind::Aux).unwrap();
        engine.add_region(&a, dc_clip(0.0, 1.0, 0.2)).unwrap();
        engine.route_to_send(&a, &bus, 0.5).unwrap();
        engine.play().unwrap();

        // direct 0.2 + send 0.1
        let out = render(&mut engine, 100);
        assert_relative_eq!(out[50], 0.3, epsilon = 1e-4);

        // soloing the source silences the bus it feeds
        engine.set_track_solo(&a, true).unwrap();
        let out = render(&mut engine, 100);
        assert_relative_eq!(out[50], 0.2, epsilon = 1e-4);

        engine.set_track_solo(&a, false).unwrap();
        engine.set_track_mute(&a, true).unwrap();
        assert!(render(&mut engine, 100).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_automation_drives_track_volume() {
        let mut engine = engine();
        let t = engine.add_track("A", TrackKind::Audio).unwrap();
        let seen = record_events(&engine);
        let lane = engine.create_automation_lane(&t, "volume", CurveType::Linear);
        engine.add_automation_point(&lane, 0.0, -200.0).unwrap();
        assert_eq!(engine.remove_automation_point(&lane, 5.0).unwrap(), false);
        engine.play().unwrap();
        render(&mut engine, 10);

        assert_eq!(engine.track(&t).unwrap().channel().volume_db(), -96.0);
        assert_eq!(
            *seen.lock(),
            vec!["automation:pointAdded", "playback:play"]
        );
    }

    #[test]
    fn test_automation_recording_at_transport_time() {
        let mut engine = engine();
        let t = engine.add_track("A", TrackKind::Audio).unwrap();
        let lane = engine.create_automation_lane(&t, "pan", CurveType::Linear);
        assert!(!engine.record_automation_value(0.5));
        engine.start_automation_recording(&lane).unwrap();
        engine.play().unwrap();
        render(&mut engine, 250);
        assert!(engine.record_automation_value(0.5));
        assert_eq!(engine.stop_automation_recording(), Some(lane.clone()));
        assert_eq!(engine.automation_value(&lane, 0.25), Some(0.5));
    }

    #[test]
    fn test_effect_wrappers() {
        let mut engine = engine();
        let t = engine.add_track("A", TrackKind::Audio).unwrap();
        let seen = record_events(&engine);
        let gain = engine.add_effect(&t, "gain").unwrap();
        let delay = engine
            .connect_effect(&t, create_effect(EffectKind::Delay), Some(0))
            .unwrap();
        assert_eq!(engine.track(&t).unwrap().rack().chain(), vec![delay.clone(), gain.clone()]);

        assert_eq!(
            engine.add_effect(&t, "chorus").unwrap_err().code(),
            ErrorCode::InvalidEffectType
        );
        let err = engine.remove_effect(&t, "nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::EffectNotFound);
        assert_eq!(err.track_id(), Some(t.as_str()));

        engine.set_effect_param(&t, &gain, "gain", 0.5).unwrap();
        engine.remove_effect(&t, &delay).unwrap();
        assert_eq!(*seen.lock(), vec!["effect:added", "effect:added"]);
    }

    #[test]
    fn test_render_offline_rules() {
        let mut engine = engine();
        assert_eq!(
            engine.render_offline(0.0, 1.0).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(
            engine.render_offline(1801.0, 0.0).unwrap_err().code(),
            ErrorCode::ExportError
        );

        let a = engine.add_track("A", TrackKind::Audio).unwrap();
        let b = engine.add_track("B", TrackKind::Audio).unwrap();
        engine.add_region(&a, dc_clip(0.0, 0.5, 0.5)).unwrap();
        engine.set_track_mute(&b, true).unwrap();

        let audio = engine.render_offline(1.0, 0.5).unwrap();
        assert_eq!(audio.num_channels(), 2);
        assert_eq!(audio.frames(), 1500);
        // one active track: master gain 0.5
        assert_relative_eq!(audio.channel(0)[100], 0.25, epsilon = 1e-6);
        assert_eq!(audio.channel(0)[700], 0.0);

        // live state untouched
        assert_eq!(engine.current_time(), 0.0);
        assert_eq!(engine.playback_state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_render_offline_placeholder_and_async() {
        let mut engine = engine();
        engine.add_track("Empty", TrackKind::Audio).unwrap();
        let handle = engine.render_offline_async(1.0, 0.0).unwrap();
        let audio = handle.wait().unwrap();
        assert_eq!(audio.frames(), 1000);
        assert!(audio.peak() > 0.05);
        assert!(audio.peak() <= 0.32 * 0.5 + 1e-6);
    }

    #[test]
    fn test_serialize_round_trip_settings() {
        let mut source = engine();
        let a = source.add_track("Lead", TrackKind::Midi).unwrap();
        source.set_track_volume(&a, -6.0).unwrap();
        source.set_track_pan(&a, 0.5).unwrap();
        source.set_track_solo(&a, true).unwrap();
        source.track_mut(&a).unwrap().set_record_arm(true);
        source.set_tempo(98.0).unwrap();
        source.set_time_signature(6, 8).unwrap();
        let json = source.serialize().to_json().unwrap();

        let mut other = engine();
        other.add_track("Stale", TrackKind::Audio).unwrap();
        other.deserialize(&ProjectData::from_json(&json).unwrap()).unwrap();

        assert_eq!(other.tracks().len(), 1);
        let track = other.track(&a).unwrap();
        assert_eq!(track.name(), "Lead");
        assert_eq!(track.kind(), TrackKind::Midi);
        assert_eq!(track.color(), source.track(&a).unwrap().color());
        assert_eq!(track.channel().volume_db(), -6.0);
        assert_eq!(track.channel().pan(), 0.5);
        assert!(track.channel().is_soloed());
        assert!(track.record_arm());
        assert_eq!(other.tempo(), 98.0);
        assert_eq!(other.time_signature(), TimeSignature::new(6, 8).unwrap());
    }

    #[test]
    fn test_track_recording_places_clip_at_stop_position() {
        let mut engine = engine();
        let t = engine.add_track("Vox", TrackKind::Audio).unwrap();
        let seen = record_events(&engine);
        engine.play().unwrap();
        render(&mut engine, 200);
        engine.start_recording(&t).unwrap();

        let mut input = vec![0.5_f32; 300 * 2];
        let input = AudioBuffer::new(&mut input, 2);
        let mut out = vec![0.0; 300 * 2];
        let mut out = AudioBuffer::new(&mut out, 2);
        engine.process_block_with_input(&input, &mut out);

        assert_relative_eq!(engine.current_time(), 0.5);
        let region_id = engine.stop_recording(&t).unwrap();
        let region = engine.track(&t).unwrap().region(&region_id).unwrap();
        assert_relative_eq!(region.start_time(), 0.5);
        assert_relative_eq!(region.duration(), 0.3);
        assert_eq!(
            engine.stop_recording(&t).unwrap_err().code(),
            ErrorCode::RecordingNotStarted
        );
        assert_eq!(
            *seen.lock(),
            vec!["playback:play", "playback:record-start", "playback:record-stop"]
        );
    }

    #[test]
    fn test_midi_notes_reach_the_instrument() {
        let mut engine = engine();
        let t = engine.add_track("Keys", TrackKind::Midi).unwrap();
        let region = MidiRegion::new(
            MidiRegionConfig::at(0.1).with_notes(vec![MidiNote::new(69, 100, 0.0, 0.2)]),
        )
        .unwrap();
        engine.add_midi_region(&t, region).unwrap();
        engine.play().unwrap();

        let out = render(&mut engine, 400);
        assert!(out[..100].iter().all(|s| *s == 0.0));
        assert!(out[100..400].iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn test_loop_recording_through_engine() {
        let mut engine = engine();
        let t = engine.add_track("Loop", TrackKind::Audio).unwrap();
        let keys = engine.add_track("Keys", TrackKind::Midi).unwrap();
        let seen = record_events(&engine);
        engine.set_tempo(240.0).unwrap();

        assert_eq!(
            engine
                .start_loop_recording(LoopRecordingOptions::new(keys.as_str(), 1))
                .unwrap_err()
                .code(),
            ErrorCode::InvalidTrackType
        );

        // 4/4 at 240 BPM: one bar is 1 s, the count-in bar too
        engine
            .start_loop_recording(LoopRecordingOptions::new(t.as_str(), 1))
            .unwrap();
        assert_eq!(engine.loop_recording_state(), LoopRecordingState::CountingIn);

        let mut input = vec![0.25_f32; 250 * 2];
        let input = AudioBuffer::new(&mut input, 2);
        let mut out = vec![0.0; 250 * 2];
        for _ in 0..4 {
            let mut out = AudioBuffer::new(&mut out, 2);
            engine.process_block_with_input(&input, &mut out);
        }
        assert_eq!(engine.loop_recording_state(), LoopRecordingState::CountingIn);

        for _ in 0..6 {
            let mut out = AudioBuffer::new(&mut out, 2);
            engine.process_block_with_input(&input, &mut out);
        }
        assert_eq!(engine.loop_recording_state(), LoopRecordingState::Recording);
        assert_eq!(engine.recording().pass_index(), 1);

        let takes = engine.stop_loop_recording().unwrap();
        assert_eq!(takes.len(), 2);
        assert_eq!(engine.loop_recording_state(), LoopRecordingState::Idle);

        let names = seen.lock();
        assert_eq!(names.iter().filter(|n| *n == "recording:countIn").count(), 4);
        assert!(names.contains(&"recording:started".to_string()));
        assert!(names.contains(&"recording:loopComplete".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("recording:stopped"));
    }
}
