// src/error.rs
//
// Engine error type shared by every fallible operation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════
// Error codes
// ═══════════════════════════════════════════════════════════════════

/// Stable, machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotInitialized,
    AlreadyInitialized,
    AudioContextError,
    AudioContextSuspended,
    AudioContextClosed,
    TrackNotFound,
    TrackAlreadyExists,
    InvalidTrackType,
    ClipNotFound,
    InvalidClipData,
    EffectNotFound,
    InvalidEffectType,
    RecordingNotStarted,
    RecordingAlreadyStarted,
    MicrophoneAccessDenied,
    InvalidParameter,
    ParameterOutOfRange,
    BufferDecodeError,
    BufferNotFound,
    NetworkError,
    FileLoadError,
    ExportError,
    UnsupportedFormat,
    UnknownError,
    OperationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotInitialized => "NOT_INITIALIZED",
            ErrorCode::AlreadyInitialized => "ALREADY_INITIALIZED",
            ErrorCode::AudioContextError => "AUDIO_CONTEXT_ERROR",
            ErrorCode::AudioContextSuspended => "AUDIO_CONTEXT_SUSPENDED",
            ErrorCode::AudioContextClosed => "AUDIO_CONTEXT_CLOSED",
            ErrorCode::TrackNotFound => "TRACK_NOT_FOUND",
            ErrorCode::TrackAlreadyExists => "TRACK_ALREADY_EXISTS",
            ErrorCode::InvalidTrackType => "INVALID_TRACK_TYPE",
            ErrorCode::ClipNotFound => "CLIP_NOT_FOUND",
            ErrorCode::InvalidClipData => "INVALID_CLIP_DATA",
            ErrorCode::EffectNotFound => "EFFECT_NOT_FOUND",
            ErrorCode::InvalidEffectType => "INVALID_EFFECT_TYPE",
            ErrorCode::RecordingNotStarted => "RECORDING_NOT_STARTED",
            ErrorCode::RecordingAlreadyStarted => "RECORDING_ALREADY_STARTED",
            ErrorCode::MicrophoneAccessDenied => "MICROPHONE_ACCESS_DENIED",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ParameterOutOfRange => "PARAMETER_OUT_OF_RANGE",
            ErrorCode::BufferDecodeError => "BUFFER_DECODE_ERROR",
            ErrorCode::BufferNotFound => "BUFFER_NOT_FOUND",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::FileLoadError => "FILE_LOAD_ERROR",
            ErrorCode::ExportError => "EXPORT_ERROR",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════
// Engine error
// ═══════════════════════════════════════════════════════════════════

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Typed engine failure.
///
/// Carries a stable [`ErrorCode`], a human message and the moment it was
/// raised. Track- and effect-scoped failures also name the object involved.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct EngineError {
    code: ErrorCode,
    message: String,
    timestamp: DateTime<Utc>,
    track_id: Option<String>,
    effect_id: Option<String>,
    #[source]
    source: Option<BoxedSource>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            track_id: None,
            effect_id: None,
            source: None,
        }
    }

    pub fn with_track(mut self, track_id: impl Into<String>) -> Self {
        self.track_id = Some(track_id.into());
        self
    }

    pub fn with_effect(mut self, effect_id: impl Into<String>) -> Self {
        self.effect_id = Some(effect_id.into());
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────
    // Common constructors
    // ─────────────────────────────────────────────────────────────────

    pub fn not_initialized() -> Self {
        Self::new(
            ErrorCode::NotInitialized,
            "Audio engine not initialized. Call initialize() first.",
        )
    }

    pub fn track_not_found(track_id: &str) -> Self {
        Self::new(ErrorCode::TrackNotFound, format!("Track {track_id} not found"))
            .with_track(track_id)
    }

    pub fn effect_not_found(effect_id: &str) -> Self {
        Self::new(
            ErrorCode::EffectNotFound,
            format!("Effect {effect_id} not found"),
        )
        .with_effect(effect_id)
    }

    pub fn clip_not_found(region_id: &str) -> Self {
        Self::new(ErrorCode::ClipNotFound, format!("Clip {region_id} not found"))
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }

    pub fn invalid_clip(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClipData, message)
    }

    pub fn out_of_range(name: &str, value: f64, min: f64, max: f64) -> Self {
        Self::new(
            ErrorCode::ParameterOutOfRange,
            format!("{name} must be between {min} and {max}, got {value}"),
        )
    }

    // ─────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────

    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[inline]
    pub fn track_id(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    #[inline]
    pub fn effect_id(&self) -> Option<&str> {
        self.effect_id.as_deref()
    }

    /// Serializable view for UI layers.
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code,
            message: self.message.clone(),
            timestamp: self.timestamp,
            track_id: self.track_id.clone(),
            effect_id: self.effect_id.clone(),
            cause: self.source.as_ref().map(|s| s.to_string()),
        }
    }
}

/// Plain representation of an [`EngineError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Reject NaN/inf control values.
pub(crate) fn ensure_finite(name: &str, value: f64) -> EngineResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EngineError::invalid_parameter(format!(
            "{name} must be a finite number"
        )))
    }
}

/// Validate a control parameter against an inclusive range.
pub(crate) fn ensure_range(name: &str, value: f64, min: f64, max: f64) -> EngineResult<()> {
    ensure_finite(name, value)?;
    if value < min || value > max {
        return Err(EngineError::out_of_range(name, value, min, max));
    }
    Ok(())
}
