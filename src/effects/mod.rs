// src/effects/mod.rs
//
// Track effect units and the rack that chains them.

mod builtin;
mod rack;

pub use builtin::*;
pub use rack::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio_buffer::AudioBuffer;
use crate::error::{EngineError, EngineResult, ErrorCode};

// ═══════════════════════════════════════════════════════════════════
// Effect trait
// ═══════════════════════════════════════════════════════════════════

/// In-place stereo processing unit owned by an [`EffectsRack`].
///
/// Effects:
/// - do NOT know about the rack's link topology
/// - do NOT allocate in `process`
/// - keep their parameters clamped to a legal range
pub trait Effect: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> EffectKind;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Called when the unit is inserted into a rack or the rate changes.
    fn prepare(&mut self, sample_rate: f64, max_block: usize);

    fn process(&mut self, buffer: &mut AudioBuffer);

    /// Set a named parameter. Values are clamped; unknown names are rejected.
    fn set_param(&mut self, name: &str, value: f32) -> EngineResult<()>;

    fn param(&self, name: &str) -> Option<f32>;

    fn params(&self) -> Vec<EffectParam>;

    /// Clear internal DSP state (delay lines, filters).
    fn reset(&mut self) {}

    /// Same identity and settings with cleared DSP state.
    fn fresh_instance(&self) -> Box<dyn Effect>;
}

/// Parameter description reported by [`Effect::params`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectParam {
    pub name: &'static str,
    pub value: f32,
    pub min: f32,
    pub max: f32,
}

pub(crate) fn unknown_param(effect: &dyn Effect, name: &str) -> EngineError {
    EngineError::invalid_parameter(format!(
        "Unknown parameter '{name}' for {} effect",
        effect.kind()
    ))
    .with_effect(effect.id())
}

pub(crate) fn check_value(effect_id: &str, name: &str, value: f32) -> EngineResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(
            EngineError::invalid_parameter(format!("{name} must be a finite number"))
                .with_effect(effect_id),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════
// Kinds and factory
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Gain,
    Pan,
    Delay,
    Reverb,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Gain => "gain",
            EffectKind::Pan => "pan",
            EffectKind::Delay => "delay",
            EffectKind::Reverb => "reverb",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffectKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gain" => Ok(EffectKind::Gain),
            "pan" | "panner" => Ok(EffectKind::Pan),
            "delay" => Ok(EffectKind::Delay),
            "reverb" => Ok(EffectKind::Reverb),
            _ => Err(EngineError::new(
                ErrorCode::InvalidEffectType,
                format!("Unknown effect type: {s}"),
            )),
        }
    }
}

pub fn create_effect(kind: EffectKind) -> Box<dyn Effect> {
    match kind {
        EffectKind::Gain => Box::new(GainEffect::new()),
        EffectKind::Pan => Box::new(PanEffect::new()),
        EffectKind::Delay => Box::new(DelayEffect::new()),
        EffectKind::Reverb => Box::new(ReverbEffect::new()),
    }
}

pub fn create_effect_named(name: &str) -> EngineResult<Box<dyn Effect>> {
    Ok(create_effect(name.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Reverb".parse::<EffectKind>().unwrap(), EffectKind::Reverb);
        let err = "flanger".parse::<EffectKind>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEffectType);
    }

    #[test]
    fn test_factory_builds_requested_kind() {
        for kind in [
            EffectKind::Gain,
            EffectKind::Pan,
            EffectKind::Delay,
            EffectKind::Reverb,
        ] {
            let fx = create_effect(kind);
            assert_eq!(fx.kind(), kind);
            assert!(fx.is_enabled());
            assert!(fx.id().starts_with("fx-"));
        }
    }

    #[test]
    fn test_unknown_param_rejected() {
        let mut fx = create_effect_named("delay").unwrap();
        let err = fx.set_param("wobble", 1.0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        assert_eq!(err.effect_id(), Some(fx.id()));
        assert!(fx.set_param("mix", f32::NAN).is_err());
    }
}
