// src/main.rs
//
// tracklab-render: builds a small demo session and bounces it to a WAV file.
//
//     tracklab-render [out.wav] [seconds]

use std::process::ExitCode;

use tracklab::{
    AudioData, AudioRegion, AudioRegionConfig, Engine, EngineConfig, EngineError, MidiNote,
    MidiRegion, MidiRegionConfig, TrackKind,
};

const SAMPLE_RATE: f64 = 48_000.0;
const TAIL_SECONDS: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
enum RenderError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("wav output: {0}")]
    Wav(#[from] hound::Error),
    #[error("invalid duration: {0}")]
    Duration(String),
}

// ===============================
// Demo session
// ===============================

fn sine_clip(frequency: f64, seconds: f64, gain: f32) -> Result<AudioData, EngineError> {
    let frames = (seconds * SAMPLE_RATE) as usize;
    let samples: Vec<f32> = (0..frames)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE;
            (std::f64::consts::TAU * frequency * t).sin() as f32 * gain
        })
        .collect();
    AudioData::new(SAMPLE_RATE, vec![samples.clone(), samples])
}

fn build_session(engine: &mut Engine) -> Result<(), EngineError> {
    // --------------------------------
    // Audio track: two sine regions
    // --------------------------------

    let pad = engine.add_track("Pad", TrackKind::Audio)?;
    engine.add_region(
        &pad,
        AudioRegion::new(sine_clip(220.0, 2.0, 0.4)?, AudioRegionConfig::at(0.0))?,
    )?;
    engine.add_region(
        &pad,
        AudioRegion::new(sine_clip(330.0, 2.0, 0.3)?, AudioRegionConfig::at(2.0))?,
    )?;
    engine.set_track_volume(&pad, -3.0)?;
    engine.set_track_pan(&pad, -0.3)?;

    // --------------------------------
    // MIDI track: an arpeggio through a delay
    // --------------------------------

    let lead = engine.add_track("Lead", TrackKind::Midi)?;
    let notes: Vec<MidiNote> = [60u8, 64, 67, 72, 67, 64, 60, 55]
        .iter()
        .enumerate()
        .map(|(i, &pitch)| MidiNote::new(pitch, 96, i as f64 * 0.5, 0.4))
        .collect();
    engine.add_midi_region(
        &lead,
        MidiRegion::new(
            MidiRegionConfig::at(0.0)
                .with_duration(4.0)
                .with_notes(notes)
                .with_name("Arp"),
        )?,
    )?;
    let delay = engine.add_effect(&lead, "delay")?;
    engine.set_effect_param(&lead, &delay, "time", 0.375)?;
    engine.set_effect_param(&lead, &delay, "mix", 0.3)?;
    engine.set_track_pan(&lead, 0.3)?;

    Ok(())
}

// ===============================
// Main
// ===============================

fn run(path: &str, seconds: f64) -> Result<(), RenderError> {
    let config = EngineConfig::new().with_sample_rate(SAMPLE_RATE);
    let mut engine = Engine::new(config)?;
    engine.initialize()?;
    build_session(&mut engine)?;

    log::info!("Rendering {} track(s), {seconds}s to {path}", engine.tracks().len());
    let audio = engine.render_offline(seconds, TAIL_SECONDS)?;

    let spec = hound::WavSpec {
        channels: audio.num_channels() as u16,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in audio.to_interleaved() {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    log::info!(
        "Wrote {} frames, peak {:.3}",
        audio.frames(),
        audio.peak()
    );
    engine.close();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "tracklab-demo.wav".to_string());
    let seconds = match args.next().map(|s| s.parse::<f64>()) {
        None => Ok(4.0),
        Some(Ok(seconds)) => Ok(seconds),
        Some(Err(e)) => Err(RenderError::Duration(e.to_string())),
    };

    match seconds.and_then(|seconds| run(&path, seconds)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
