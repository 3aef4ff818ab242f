// src/lib.rs
//
// Library entry point: the multitrack engine plus its browser bindings
// (`web` feature).

pub mod analyzer;
pub mod audio_buffer;
pub mod automation;
pub mod capture;
pub mod clock;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod event;
pub mod ids;
pub mod instrument;
pub mod master_bus;
pub mod midi;
pub mod project;
pub mod recording;
pub mod region;
pub mod render;
pub mod scheduler;
pub mod spectrum;
pub mod track;
pub mod transport;

#[cfg(feature = "web")]
pub mod wasm;

// Re-export key types for Rust consumers
pub use audio_buffer::{AudioBuffer, AudioData};
pub use automation::CurveType;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use effects::{Effect, EffectKind, EffectsRack, create_effect};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, EngineResult, ErrorCode, ErrorReport};
pub use event::{EngineEvent, EventBus, Subscription};
pub use instrument::{InstrumentConfig, InstrumentKind};
pub use midi::MidiMessage;
pub use project::ProjectData;
pub use recording::{LoopRecordingOptions, LoopRecordingState, Take, TakeMetrics};
pub use region::{AudioRegion, AudioRegionConfig, MidiNote, MidiRegion, MidiRegionConfig};
pub use render::{RenderHandle, RenderJob};
pub use track::{Track, TrackKind};
pub use transport::{PlaybackState, TimeSignature};
