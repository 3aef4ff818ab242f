// src/recording.rs
//
// Loop recording: count-in, pass-per-loop takes and take metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio_buffer::{AudioBuffer, AudioData, ScratchBuffer};
use crate::capture::{CaptureBackend, CaptureDevice, decode_audio};
use crate::error::{EngineError, EngineResult, ErrorCode, ensure_range};
use crate::event::{EngineEvent, EventBus};
use crate::ids::{self, TakeId, TrackId};
use crate::instrument::{AttackReleaseTrigger, MembraneSynth};
use crate::region::pitch_to_frequency;
use crate::scheduler::{ScheduleId, Scheduler, TransportEvent};
use crate::transport::Transport;

pub const DEFAULT_METRONOME_VOLUME: f32 = 0.3;

const ACCENT_PITCH: u8 = 72; // C5
const CLICK_PITCH: u8 = 60; // C4
const TRANSIENT_THRESHOLD: f32 = 0.1;
const FLOOR: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopRecordingState {
    #[default]
    Idle,
    CountingIn,
    Recording,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRecordingOptions {
    pub track_id: TrackId,
    pub bars: u32,
    #[serde(default = "default_count_in")]
    pub count_in_bars: u32,
    #[serde(default = "default_metronome_volume")]
    pub metronome_volume: f32,
}

fn default_count_in() -> u32 {
    1
}

fn default_metronome_volume() -> f32 {
    DEFAULT_METRONOME_VOLUME
}

impl LoopRecordingOptions {
    pub fn new(track_id: impl Into<TrackId>, bars: u32) -> Self {
        Self {
            track_id: track_id.into(),
            bars,
            count_in_bars: default_count_in(),
            metronome_volume: DEFAULT_METRONOME_VOLUME,
        }
    }

    pub fn with_count_in(mut self, bars: u32) -> Self {
        self.count_in_bars = bars;
        self
    }

    pub fn with_metronome_volume(mut self, volume: f32) -> Self {
        self.metronome_volume = volume;
        self
    }

    fn validate(&self) -> EngineResult<()> {
        if self.bars == 0 {
            return Err(EngineError::invalid_parameter(
                "Loop recording needs at least one bar",
            ));
        }
        ensure_range("metronomeVolume", f64::from(self.metronome_volume), 0.0, 1.0)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Takes
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeMetrics {
    pub peak_db: f32,
    pub rms_db: f32,
    /// Peak over the 10th-percentile noise floor, in dB.
    pub snr: f32,
    /// Distance of the first transient from the nearest beat.
    pub timing_error_ms: f64,
}

/// One recorded pass of the loop.
#[derive(Debug, Clone)]
pub struct Take {
    pub id: TakeId,
    pub pass_index: u32,
    pub start_bar: u32,
    pub end_bar: u32,
    pub audio: AudioData,
    pub metrics: TakeMetrics,
    pub created_at: DateTime<Utc>,
}

#[inline]
fn db(linear: f32) -> f32 {
    20.0 * linear.max(FLOOR).log10()
}

/// Level, noise and timing figures of channel 0 of `audio`.
pub fn calculate_metrics(audio: &AudioData, bpm: f64) -> TakeMetrics {
    let data = audio.channel(0);
    if data.is_empty() {
        let silent = db(0.0);
        return TakeMetrics {
            peak_db: silent,
            rms_db: silent,
            snr: 0.0,
            timing_error_ms: 0.0,
        };
    }

    let mut peak = 0.0_f32;
    let mut sum_sq = 0.0_f32;
    for s in data {
        let a = s.abs();
        peak = peak.max(a);
        sum_sq += a * a;
    }
    let rms = (sum_sq / data.len() as f32).sqrt();

    let mut sorted: Vec<f32> = data.iter().map(|s| s.abs()).collect();
    sorted.sort_by(f32::total_cmp);
    let noise_floor = sorted[data.len() / 10];

    let peak_db = db(peak);
    TakeMetrics {
        peak_db,
        rms_db: db(rms),
        snr: peak_db - db(noise_floor),
        timing_error_ms: timing_error_ms(data, audio.sample_rate(), bpm),
    }
}

fn timing_error_ms(data: &[f32], sample_rate: f64, bpm: f64) -> f64 {
    let beat = 60.0 / bpm;
    let transient = (1..data.len()).find(|&i| {
        let a = data[i].abs();
        a > TRANSIENT_THRESHOLD && a > data[i - 1].abs()
    });
    let Some(index) = transient else {
        return 0.0;
    };
    let t = index as f64 / sample_rate;
    let expected = (t / beat).round() * beat;
    (t - expected).abs() * 1000.0
}

// ═══════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════

/// Drives loop recording on the transport timeline.
///
/// The count-in runs at negative transport positions and hands over to
/// capture at 0. Every loop wrap closes the running pass as a take.
pub struct RecordingManager {
    sample_rate: f64,
    events: EventBus,
    state: LoopRecordingState,

    track_id: Option<TrackId>,
    bars: u32,
    pass_index: u32,
    takes: Vec<Take>,
    device: Option<Box<dyn CaptureDevice>>,
    pending: Vec<ScheduleId>,

    metronome: MembraneSynth,
    metronome_volume: f32,
    metronome_scratch: ScratchBuffer,
}

impl std::fmt::Debug for RecordingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingManager")
            .field("state", &self.state)
            .field("track_id", &self.track_id)
            .field("pass_index", &self.pass_index)
            .field("takes", &self.takes.len())
            .finish()
    }
}

impl RecordingManager {
    pub fn new(sample_rate: f64, max_block: usize, events: EventBus) -> Self {
        Self {
            sample_rate,
            events,
            state: LoopRecordingState::Idle,
            track_id: None,
            bars: 0,
            pass_index: 0,
            takes: Vec::new(),
            device: None,
            pending: Vec::new(),
            metronome: MembraneSynth::new(sample_rate),
            metronome_volume: DEFAULT_METRONOME_VOLUME,
            metronome_scratch: ScratchBuffer::stereo(max_block),
        }
    }

    pub fn state(&self) -> LoopRecordingState {
        self.state
    }

    pub fn pass_index(&self) -> u32 {
        self.pass_index
    }

    pub fn recording_track(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    pub fn takes(&self) -> &[Take] {
        &self.takes
    }

    pub fn take(&self, id: &str) -> Option<&Take> {
        self.takes.iter().find(|t| t.id == id)
    }

    /// Highest SNR; ties go to the smaller timing error.
    pub fn best_take(&self) -> Option<&Take> {
        self.takes.iter().max_by(|a, b| {
            a.metrics
                .snr
                .total_cmp(&b.metrics.snr)
                .then_with(|| b.metrics.timing_error_ms.total_cmp(&a.metrics.timing_error_ms))
        })
    }

    pub fn clear_takes(&mut self) {
        self.takes.clear();
    }

    pub fn metronome_volume(&self) -> f32 {
        self.metronome_volume
    }

    pub fn set_metronome_volume(&mut self, volume: f32) -> EngineResult<()> {
        ensure_range("metronomeVolume", f64::from(volume), 0.0, 1.0)?;
        self.metronome_volume = volume;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Start / stop
    // ─────────────────────────────────────────────────────────────────

    /// Arm the loop and start the count-in (or capture right away when
    /// `count_in_bars` is 0). Starts the transport.
    pub fn start(
        &mut self,
        options: &LoopRecordingOptions,
        backend: &dyn CaptureBackend,
        transport: &mut Transport,
        scheduler: &mut Scheduler,
    ) -> EngineResult<()> {
        if self.state != LoopRecordingState::Idle {
            return Err(EngineError::new(
                ErrorCode::RecordingAlreadyStarted,
                "Loop recording already in progress",
            ));
        }
        options.validate()?;

        // Fails fast on a denied device
        let device = backend.open()?;

        let loop_end = f64::from(options.bars) * transport.bar_seconds();
        transport.set_loop(0.0, loop_end, true)?;

        self.takes.clear();
        self.pass_index = 0;
        self.bars = options.bars;
        self.track_id = Some(options.track_id.clone());
        self.metronome_volume = options.metronome_volume;
        self.device = Some(device);

        if options.count_in_bars == 0 {
            transport.set_position(0);
            transport.start();
            return self.begin_capture();
        }

        let per_bar = transport.time_signature().numerator;
        let total = options.count_in_bars * per_bar;
        let beat = transport.seconds_per_beat();
        let pre_roll = f64::from(total) * beat;

        self.pending.clear();
        for k in 0..total {
            let id = scheduler.schedule_once(
                -pre_roll + f64::from(k) * beat,
                TransportEvent::CountInBeat {
                    bar: k / per_bar + 1,
                    beat: k % per_bar + 1,
                    total,
                    remaining: total - k - 1,
                },
            );
            self.pending.push(id);
        }
        self.pending
            .push(scheduler.schedule_once(0.0, TransportEvent::CountInComplete));

        self.state = LoopRecordingState::CountingIn;
        transport.set_seconds(-pre_roll);
        transport.start();
        log::info!(
            "Loop recording armed: {} bar(s), {} count-in beat(s)",
            options.bars,
            total
        );
        Ok(())
    }

    /// Finish the running pass as the last take and return to idle.
    pub fn stop(
        &mut self,
        transport: &mut Transport,
        scheduler: &mut Scheduler,
    ) -> EngineResult<&[Take]> {
        if self.state != LoopRecordingState::Recording {
            return Err(EngineError::new(
                ErrorCode::RecordingNotStarted,
                "No loop recording in progress",
            ));
        }
        self.state = LoopRecordingState::Processing;
        transport.stop();

        let bpm = transport.bpm();
        let result = match self.device.take() {
            Some(mut device) => {
                let finished = device
                    .stop()
                    .and_then(|bytes| self.process_take(&bytes, self.pass_index, bpm));
                device.close();
                finished
            }
            None => Ok(()),
        };

        transport.set_loop_enabled(false);
        scheduler.cancel_all(&self.pending);
        self.pending.clear();
        self.state = LoopRecordingState::Idle;

        let track_id = self.track_id.clone().unwrap_or_default();
        log::info!("Loop recording stopped with {} take(s)", self.takes.len());
        self.events.emit(EngineEvent::RecordingStopped {
            track_id,
            take_count: self.takes.len(),
        });

        result?;
        Ok(&self.takes)
    }

    /// Drop any session without producing takes.
    pub fn dispose(&mut self, scheduler: &mut Scheduler) {
        scheduler.cancel_all(&self.pending);
        self.pending.clear();
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.metronome.release_all();
        self.state = LoopRecordingState::Idle;
    }

    // ─────────────────────────────────────────────────────────────────
    // Transport callbacks
    // ─────────────────────────────────────────────────────────────────

    /// One count-in beat reached at render-clock `time`.
    pub fn on_count_in_beat(
        &mut self,
        bar: u32,
        beat: u32,
        total: u32,
        remaining: u32,
        time: f64,
        beat_seconds: f64,
    ) {
        let pitch = if beat == 1 { ACCENT_PITCH } else { CLICK_PITCH };
        self.metronome
            .trigger_attack_release(pitch_to_frequency(pitch), beat_seconds / 2.0, time, 1.0);
        self.events.emit(EngineEvent::RecordingCountIn {
            bar,
            beat,
            total,
            remaining,
        });
    }

    pub fn on_count_in_complete(&mut self) -> EngineResult<()> {
        if self.state != LoopRecordingState::CountingIn {
            return Ok(());
        }
        self.pending.clear();
        self.begin_capture()
    }

    /// The loop wrapped: close the pass and start the next one.
    pub fn on_loop_boundary(&mut self, bpm: f64) {
        if self.state != LoopRecordingState::Recording {
            return;
        }
        let Some(mut device) = self.device.take() else {
            return;
        };

        let finished = device
            .stop()
            .and_then(|bytes| self.process_take(&bytes, self.pass_index, bpm));
        if let Err(e) = finished {
            log::error!("Skipping loop pass {}: {}", self.pass_index, e);
        }
        self.pass_index += 1;

        if let Err(e) = device.start() {
            log::error!("Failed to restart capture: {e}");
        }
        self.device = Some(device);

        self.events.emit(EngineEvent::RecordingLoopComplete {
            pass_index: self.pass_index,
            total_takes: self.takes.len(),
        });
    }

    /// Mix pending metronome clicks into `out`.
    pub fn render_metronome(&mut self, start_time: f64, out: &mut AudioBuffer) {
        if self.metronome_volume == 0.0 {
            return;
        }
        let mut frames_done = 0;
        while frames_done < out.frames {
            let frames = (out.frames - frames_done).min(self.metronome_scratch.capacity());
            let mut click = self.metronome_scratch.cleared(frames);
            let t = start_time + frames_done as f64 / self.sample_rate;
            self.metronome.render(t, &mut click);
            for ch in 0..out.channels {
                let src = click.channel(ch % click.channels);
                let dst = &mut out.channel_mut(ch)[frames_done..frames_done + frames];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += s * self.metronome_volume;
                }
            }
            frames_done += frames;
        }
    }

    fn begin_capture(&mut self) -> EngineResult<()> {
        let started = match self.device.as_mut() {
            Some(device) => device.start(),
            None => Err(EngineError::new(
                ErrorCode::RecordingNotStarted,
                "No capture device open",
            )),
        };
        if let Err(e) = started {
            if let Some(mut device) = self.device.take() {
                device.close();
            }
            self.state = LoopRecordingState::Idle;
            return Err(e);
        }

        self.state = LoopRecordingState::Recording;
        let track_id = self.track_id.clone().unwrap_or_default();
        log::info!("Loop recording started on {track_id}");
        self.events.emit(EngineEvent::RecordingStarted {
            track_id,
            bars: self.bars,
        });
        Ok(())
    }

    fn process_take(&mut self, bytes: &[u8], pass_index: u32, bpm: f64) -> EngineResult<()> {
        let audio = decode_audio(bytes)?;
        let metrics = calculate_metrics(&audio, bpm);
        let take = Take {
            id: ids::generate("take"),
            pass_index,
            start_bar: 0,
            end_bar: self.bars,
            audio,
            metrics,
            created_at: Utc::now(),
        };
        log::debug!(
            "Take {} (pass {}): snr {:.1} dB, timing {:.1} ms",
            take.id,
            pass_index,
            metrics.snr,
            metrics.timing_error_ms
        );
        self.events.emit(EngineEvent::RecordingTakeCreated {
            take_id: take.id.clone(),
            pass_index,
            metrics,
        });
        self.takes.push(take);
        Ok(())
    }
}
