//! WebAssembly bindings via wasm-bindgen for browser integration.
//!
//! This module is only compiled when the `web` feature is enabled.
//!
//! # Usage
//!
//! Build with wasm-pack:
//! ```bash
//! wasm-pack build --target web --features web
//! ```
//!
//! # JavaScript Example
//!
//! ```javascript
//! import init, { tracklab_init, TracklabEngine } from './tracklab.js';
//!
//! await init();
//! tracklab_init();
//!
//! const engine = new TracklabEngine(48000, 128);
//! engine.initialize();
//! const drums = engine.add_track("Drums", "audio");
//! engine.play();
//!
//! // In the AudioWorklet: planar [L..., R...]
//! engine.process(output, 2);
//! for (const event of JSON.parse(engine.drain_events())) { ... }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use wasm_bindgen::prelude::*;

use crate::audio_buffer::AudioBuffer;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::Subscription;
use crate::midi::MidiMessage;
use crate::project::ProjectData;
use crate::track::TrackKind;

// ═══════════════════════════════════════════════════════════════════════════
// Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize the wasm module. Call this once before using any other functions.
/// Sets up panic hooks and console logging.
#[wasm_bindgen]
pub fn tracklab_init() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).ok();
}

/// Errors cross the boundary as a JSON `ErrorReport`.
fn to_js(err: EngineError) -> JsValue {
    let report = err.to_report();
    match serde_json::to_string(&report) {
        Ok(json) => JsValue::from_str(&json),
        Err(_) => JsValue::from_str(&err.to_string()),
    }
}

fn json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// Browser-facing engine handle.
#[wasm_bindgen]
pub struct TracklabEngine {
    inner: Engine,
    queue: Arc<Mutex<Vec<String>>>,
    subscription: Option<Subscription>,
}

#[wasm_bindgen]
impl TracklabEngine {
    /// Create an engine at the AudioContext's sample rate.
    #[wasm_bindgen(constructor)]
    pub fn new(sample_rate: f64, max_block_size: u32) -> Result<TracklabEngine, JsValue> {
        let config = EngineConfig::new()
            .with_sample_rate(sample_rate)
            .with_max_block_size(max_block_size as usize);
        Self::create(config)
    }

    /// Create from an `EngineConfig` JSON document.
    pub fn from_config(config_json: &str) -> Result<TracklabEngine, JsValue> {
        Self::create(EngineConfig::from_json(config_json).map_err(to_js)?)
    }

    fn create(config: EngineConfig) -> Result<TracklabEngine, JsValue> {
        let inner = Engine::new(config).map_err(to_js)?;
        let queue = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&queue);
        let subscription = inner.subscribe(move |event| {
            if let Ok(json) = serde_json::to_string(event) {
                sink.lock().push(json);
            }
        });
        Ok(Self {
            inner,
            queue,
            subscription: Some(subscription),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn initialize(&mut self) -> Result<(), JsValue> {
        self.inner.initialize().map_err(to_js)
    }

    pub fn suspend(&mut self) -> Result<(), JsValue> {
        self.inner.suspend().map_err(to_js)
    }

    pub fn resume(&mut self) -> Result<(), JsValue> {
        self.inner.resume().map_err(to_js)
    }

    pub fn close(&mut self) {
        self.inner.close();
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// `suspended`, `running` or `closed`.
    pub fn state(&self) -> String {
        json(&self.inner.state()).trim_matches('"').to_string()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracks
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a track (`audio`, `midi`, `aux`, `folder`). Returns its id.
    pub fn add_track(&mut self, name: &str, kind: &str) -> Result<String, JsValue> {
        let kind: TrackKind = kind.parse().map_err(to_js)?;
        self.inner.add_track(name, kind).map_err(to_js)
    }

    pub fn remove_track(&mut self, track_id: &str) -> Result<(), JsValue> {
        self.inner.remove_track(track_id).map_err(to_js)
    }

    /// JSON array of track summaries.
    pub fn tracks(&self) -> String {
        json(&self.inner.track_summaries())
    }

    pub fn set_track_volume(&mut self, track_id: &str, db: f64) -> Result<(), JsValue> {
        self.inner.set_track_volume(track_id, db).map_err(to_js)
    }

    pub fn set_track_pan(&mut self, track_id: &str, pan: f64) -> Result<(), JsValue> {
        self.inner.set_track_pan(track_id, pan).map_err(to_js)
    }

    pub fn set_track_mute(&mut self, track_id: &str, mute: bool) -> Result<(), JsValue> {
        self.inner.set_track_mute(track_id, mute).map_err(to_js)
    }

    pub fn set_track_solo(&mut self, track_id: &str, solo: bool) -> Result<(), JsValue> {
        self.inner.set_track_solo(track_id, solo).map_err(to_js)
    }

    pub fn add_effect(&mut self, track_id: &str, name: &str) -> Result<String, JsValue> {
        self.inner.add_effect(track_id, name).map_err(to_js)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    pub fn play(&mut self) -> Result<(), JsValue> {
        self.inner.play().map_err(to_js)
    }

    pub fn stop(&mut self) -> Result<(), JsValue> {
        self.inner.stop().map_err(to_js)
    }

    pub fn pause(&mut self) -> Result<(), JsValue> {
        self.inner.pause().map_err(to_js)
    }

    pub fn set_tempo(&mut self, bpm: f64) -> Result<(), JsValue> {
        self.inner.set_tempo(bpm).map_err(to_js)
    }

    pub fn tempo(&self) -> f64 {
        self.inner.tempo()
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> Result<(), JsValue> {
        self.inner
            .set_time_signature(numerator, denominator)
            .map_err(to_js)
    }

    pub fn set_loop(&mut self, start: f64, end: f64, enabled: bool) -> Result<(), JsValue> {
        self.inner.set_loop(start, end, enabled).map_err(to_js)
    }

    pub fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    pub fn seek(&mut self, seconds: f64) -> Result<(), JsValue> {
        self.inner.set_current_time(seconds).map_err(to_js)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.transport().is_playing()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audio
    // ─────────────────────────────────────────────────────────────────────────

    /// Render the next block into a planar buffer `[ch0..., ch1..., ...]`.
    pub fn process(&mut self, output: &mut [f32], channels: u32) {
        let mut out = AudioBuffer::new(output, channels as usize);
        self.inner.process_block(&mut out);
    }

    /// Planar render that also feeds `input` to open capture devices.
    pub fn process_with_input(
        &mut self,
        input: &mut [f32],
        input_channels: u32,
        output: &mut [f32],
        output_channels: u32,
    ) {
        let input = AudioBuffer::new(input, input_channels as usize);
        let mut out = AudioBuffer::new(output, output_channels as usize);
        self.inner.process_block_with_input(&input, &mut out);
    }

    /// Offline mixdown as interleaved stereo `[L0, R0, L1, R1, ...]`.
    pub fn render_offline(&mut self, duration: f64, tail: f64) -> Result<Vec<f32>, JsValue> {
        let audio = self.inner.render_offline(duration, tail).map_err(to_js)?;
        Ok(audio.to_interleaved())
    }

    pub fn cpu_load(&self) -> f32 {
        self.inner.cpu_load()
    }

    /// JSON `{left, right, peak, rms}`.
    pub fn master_level(&mut self) -> String {
        json(&self.inner.master_level())
    }

    pub fn spectrum_data(&mut self) -> String {
        json(&self.inner.spectrum_data())
    }

    pub fn loudness_data(&mut self) -> String {
        json(&self.inner.loudness_data())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recording and MIDI
    // ─────────────────────────────────────────────────────────────────────────

    pub fn start_recording(&mut self, track_id: &str) -> Result<(), JsValue> {
        self.inner.start_recording(track_id).map_err(to_js)
    }

    /// Returns the new region id.
    pub fn stop_recording(&mut self, track_id: &str) -> Result<String, JsValue> {
        self.inner.stop_recording(track_id).map_err(to_js)
    }

    pub fn handle_midi_message(&mut self, status: u8, data1: u8, data2: u8, timestamp_ms: f64) {
        self.inner
            .handle_midi_message(MidiMessage::new(status, data1, data2, timestamp_ms));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Project and events
    // ─────────────────────────────────────────────────────────────────────────

    pub fn serialize(&self) -> Result<String, JsValue> {
        self.inner.serialize().to_json().map_err(to_js)
    }

    pub fn deserialize(&mut self, project_json: &str) -> Result<(), JsValue> {
        let project = ProjectData::from_json(project_json).map_err(to_js)?;
        self.inner.deserialize(&project).map_err(to_js)
    }

    /// Notifications since the last call, as a JSON array.
    pub fn drain_events(&mut self) -> String {
        let events: Vec<String> = std::mem::take(&mut *self.queue.lock());
        format!("[{}]", events.join(","))
    }
}
