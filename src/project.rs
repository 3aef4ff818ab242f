// src/project.rs
//
// Persisted project shape. Only track mixer settings, tempo and meter
// round-trip; `effects` and `clips` are carried as opaque lists.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::ids::TrackId;
use crate::track::TrackKind;
use crate::transport::TimeSignature;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    /// Fader level in dB.
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    #[serde(default)]
    pub record_arm: bool,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default = "default_route")]
    pub input: String,
    #[serde(default = "master_route")]
    pub output: String,
}

fn default_route() -> String {
    "default".to_string()
}

fn master_route() -> String {
    "master".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    pub id: TrackId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub color: String,
    #[serde(default)]
    pub order: usize,
    pub settings: TrackSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub tracks: Vec<TrackData>,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    #[serde(default)]
    pub effects: Vec<serde_json::Value>,
    #[serde(default)]
    pub clips: Vec<serde_json::Value>,
}

impl ProjectData {
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(|e| {
            EngineError::new(ErrorCode::OperationFailed, "Failed to serialize project")
                .with_source(e)
        })
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            EngineError::new(
                ErrorCode::FileLoadError,
                format!("Invalid project data: {e}"),
            )
            .with_source(e)
        })
    }
}
