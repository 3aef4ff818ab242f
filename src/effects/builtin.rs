// src/effects/builtin.rs
//
// Built-in effect units.

use crate::audio_buffer::{AudioBuffer, db_to_gain};
use crate::config::DEFAULT_SAMPLE_RATE;
use crate::error::EngineResult;
use crate::ids::{self, EffectId};

use super::{Effect, EffectKind, EffectParam, check_value, unknown_param};

// ═══════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════

const MAX_DELAY_SECONDS: f32 = 2.0;

// Comb filter delay times in samples at 48kHz, scaled in prepare()
const COMB_DELAYS: [usize; 4] = [1557, 1617, 1491, 1422];
const ALLPASS_DELAYS: [usize; 2] = [225, 556];
const ALLPASS_GAIN: f32 = 0.5;

/// Equal-power stereo panning, unity at center.
///
/// Stereo input is balanced: the far channel folds into the near one.
/// Mono buffers are left untouched.
pub(crate) fn apply_pan(buffer: &mut AudioBuffer, pan: f32) {
    let pan = pan.clamp(-1.0, 1.0);
    let (left, Some(right)) = buffer.stereo_mut() else {
        return;
    };
    let half_pi = std::f32::consts::FRAC_PI_2;
    if pan <= 0.0 {
        let x = (pan + 1.0) * half_pi;
        let (gl, gr) = (x.cos(), x.sin());
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            *l += *r * gl;
            *r *= gr;
        }
    } else {
        let x = pan * half_pi;
        let (gl, gr) = (x.cos(), x.sin());
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            *r += *l * gr;
            *l *= gl;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Gain
// ═══════════════════════════════════════════════════════════════════

pub struct GainEffect {
    id: EffectId,
    enabled: bool,
    gain_db: f32,
    gain_linear: f32,
}

impl GainEffect {
    pub fn new() -> Self {
        Self {
            id: ids::generate("fx"),
            enabled: true,
            gain_db: 0.0,
            gain_linear: 1.0,
        }
    }

    fn update_linear(&mut self) {
        self.gain_linear = db_to_gain(self.gain_db);
    }
}

impl Default for GainEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for GainEffect {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Gain
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    fn process(&mut self, buffer: &mut AudioBuffer) {
        if self.gain_linear < 0.0001 {
            buffer.clear();
            return;
        }
        buffer.scale(self.gain_linear);
    }

    fn set_param(&mut self, name: &str, value: f32) -> EngineResult<()> {
        check_value(&self.id, name, value)?;
        match name {
            "gain" => {
                self.gain_db = value.clamp(-96.0, 24.0);
                self.update_linear();
                Ok(())
            }
            _ => Err(unknown_param(&*self, name)),
        }
    }

    fn param(&self, name: &str) -> Option<f32> {
        (name == "gain").then_some(self.gain_db)
    }

    fn params(&self) -> Vec<EffectParam> {
        vec![EffectParam {
            name: "gain",
            value: self.gain_db,
            min: -96.0,
            max: 24.0,
        }]
    }

    fn fresh_instance(&self) -> Box<dyn Effect> {
        Box::new(Self {
            id: self.id.clone(),
            enabled: self.enabled,
            gain_db: self.gain_db,
            gain_linear: self.gain_linear,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════
// Pan (constant power panning)
// ═══════════════════════════════════════════════════════════════════

pub struct PanEffect {
    id: EffectId,
    enabled: bool,
    pan: f32, // -1 (left) to +1 (right)
}

impl PanEffect {
    pub fn new() -> Self {
        Self {
            id: ids::generate("fx"),
            enabled: true,
            pan: 0.0,
        }
    }
}

impl Default for PanEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for PanEffect {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Pan
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    fn process(&mut self, buffer: &mut AudioBuffer) {
        apply_pan(buffer, self.pan);
    }

    fn set_param(&mut self, name: &str, value: f32) -> EngineResult<()> {
        check_value(&self.id, name, value)?;
        match name {
            "pan" => {
                self.pan = value.clamp(-1.0, 1.0);
                Ok(())
            }
            _ => Err(unknown_param(&*self, name)),
        }
    }

    fn param(&self, name: &str) -> Option<f32> {
        (name == "pan").then_some(self.pan)
    }

    fn params(&self) -> Vec<EffectParam> {
        vec![EffectParam {
            name: "pan",
            value: self.pan,
            min: -1.0,
            max: 1.0,
        }]
    }

    fn fresh_instance(&self) -> Box<dyn Effect> {
        Box::new(Self {
            id: self.id.clone(),
            enabled: self.enabled,
            pan: self.pan,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════
// Delay
// ═══════════════════════════════════════════════════════════════════

/// Simple stereo feedback delay.
pub struct DelayEffect {
    id: EffectId,
    enabled: bool,
    delay_time: f32, // In seconds
    feedback: f32,   // 0.0 - 0.99
    mix: f32,        // Dry/wet mix (0.0 = dry, 1.0 = wet)

    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
}

impl DelayEffect {
    pub fn new() -> Self {
        let mut fx = Self {
            id: ids::generate("fx"),
            enabled: true,
            delay_time: 0.25,
            feedback: 0.4,
            mix: 0.5,
            buffer_l: Vec::new(),
            buffer_r: Vec::new(),
            write_pos: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
        };
        fx.allocate();
        fx
    }

    fn allocate(&mut self) {
        let len = (MAX_DELAY_SECONDS as f64 * self.sample_rate) as usize + 1;
        self.buffer_l = vec![0.0; len];
        self.buffer_r = vec![0.0; len];
        self.write_pos = 0;
    }

    fn delay_samples(&self) -> usize {
        let samples = (self.delay_time as f64 * self.sample_rate).round() as usize;
        samples.clamp(1, self.buffer_l.len() - 1)
    }
}

impl Default for DelayEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for DelayEffect {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Delay
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.allocate();
        }
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        let delay = self.delay_samples();
        let buf_len = self.buffer_l.len();
        let (feedback, mix) = (self.feedback, self.mix);

        let (left, right) = buffer.stereo_mut();
        let start = self.write_pos;

        let mut pos = start;
        for s in left.iter_mut() {
            let dry = *s;
            let read_pos = (pos + buf_len - delay) % buf_len;
            let delayed = self.buffer_l[read_pos];
            self.buffer_l[pos] = dry + delayed * feedback;
            *s = dry * (1.0 - mix) + delayed * mix;
            pos = (pos + 1) % buf_len;
        }

        if let Some(right) = right {
            let mut pos = start;
            for s in right.iter_mut() {
                let dry = *s;
                let read_pos = (pos + buf_len - delay) % buf_len;
                let delayed = self.buffer_r[read_pos];
                self.buffer_r[pos] = dry + delayed * feedback;
                *s = dry * (1.0 - mix) + delayed * mix;
                pos = (pos + 1) % buf_len;
            }
        }

        self.write_pos = pos;
    }

    fn set_param(&mut self, name: &str, value: f32) -> EngineResult<()> {
        check_value(&self.id, name, value)?;
        match name {
            "time" => self.delay_time = value.clamp(0.001, MAX_DELAY_SECONDS),
            "feedback" => self.feedback = value.clamp(0.0, 0.99),
            "mix" => self.mix = value.clamp(0.0, 1.0),
            _ => return Err(unknown_param(&*self, name)),
        }
        Ok(())
    }

    fn param(&self, name: &str) -> Option<f32> {
        match name {
            "time" => Some(self.delay_time),
            "feedback" => Some(self.feedback),
            "mix" => Some(self.mix),
            _ => None,
        }
    }

    fn params(&self) -> Vec<EffectParam> {
        vec![
            EffectParam {
                name: "time",
                value: self.delay_time,
                min: 0.001,
                max: MAX_DELAY_SECONDS,
            },
            EffectParam {
                name: "feedback",
                value: self.feedback,
                min: 0.0,
                max: 0.99,
            },
            EffectParam {
                name: "mix",
                value: self.mix,
                min: 0.0,
                max: 1.0,
            },
        ]
    }

    fn reset(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
    }

    fn fresh_instance(&self) -> Box<dyn Effect> {
        let mut fx = Self {
            id: self.id.clone(),
            enabled: self.enabled,
            delay_time: self.delay_time,
            feedback: self.feedback,
            mix: self.mix,
            buffer_l: Vec::new(),
            buffer_r: Vec::new(),
            write_pos: 0,
            sample_rate: self.sample_rate,
        };
        fx.allocate();
        Box::new(fx)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Reverb (simple Schroeder reverb)
// ═══════════════════════════════════════════════════════════════════

/// Algorithmic reverb: 4 parallel damped combs into 2 series allpasses.
pub struct ReverbEffect {
    id: EffectId,
    enabled: bool,
    decay: f32,   // Comb feedback (0.0 - 0.99)
    damping: f32, // High frequency damping (0.0 - 1.0)
    mix: f32,

    comb_buffers: [Vec<f32>; 4],
    comb_pos: [usize; 4],
    comb_filter: [f32; 4], // Low-pass filtered feedback

    allpass_buffers: [Vec<f32>; 2],
    allpass_pos: [usize; 2],

    sample_rate: f64,
}

impl ReverbEffect {
    pub fn new() -> Self {
        let mut fx = Self {
            id: ids::generate("fx"),
            enabled: true,
            decay: 0.5,
            damping: 0.5,
            mix: 0.3,
            comb_buffers: Default::default(),
            comb_pos: [0; 4],
            comb_filter: [0.0; 4],
            allpass_buffers: Default::default(),
            allpass_pos: [0; 2],
            sample_rate: DEFAULT_SAMPLE_RATE,
        };
        fx.allocate();
        fx
    }

    /// Size each line to its scaled delay so the read tap is the oldest sample.
    fn allocate(&mut self) {
        let scale = self.sample_rate / 48_000.0;
        for (buf, base) in self.comb_buffers.iter_mut().zip(COMB_DELAYS) {
            *buf = vec![0.0; ((base as f64 * scale) as usize).max(1)];
        }
        for (buf, base) in self.allpass_buffers.iter_mut().zip(ALLPASS_DELAYS) {
            *buf = vec![0.0; ((base as f64 * scale) as usize).max(1)];
        }
        self.comb_pos = [0; 4];
        self.allpass_pos = [0; 2];
        self.comb_filter = [0.0; 4];
    }

    #[inline]
    fn process_comb(&mut self, index: usize, input: f32) -> f32 {
        let buf = &mut self.comb_buffers[index];
        let pos = self.comb_pos[index];
        let delayed = buf[pos];

        // Low-pass filtered feedback for damping
        self.comb_filter[index] =
            delayed * (1.0 - self.damping) + self.comb_filter[index] * self.damping;

        buf[pos] = input + self.comb_filter[index] * self.decay;
        self.comb_pos[index] = (pos + 1) % buf.len();

        delayed
    }

    #[inline]
    fn process_allpass(&mut self, index: usize, input: f32) -> f32 {
        let buf = &mut self.allpass_buffers[index];
        let pos = self.allpass_pos[index];
        let delayed = buf[pos];

        let output = -ALLPASS_GAIN * input + delayed;
        buf[pos] = input + ALLPASS_GAIN * delayed;
        self.allpass_pos[index] = (pos + 1) % buf.len();

        output
    }
}

impl Default for ReverbEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for ReverbEffect {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Reverb
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.allocate();
        }
    }

    fn process(&mut self, buffer: &mut AudioBuffer) {
        let frames = buffer.frames;
        let mix = self.mix;
        let stereo = buffer.channels > 1;

        for i in 0..frames {
            let dry_l = buffer.data[i];
            let dry_r = if stereo { buffer.data[frames + i] } else { dry_l };
            let mono = (dry_l + dry_r) * 0.5;

            // Parallel comb filters
            let mut wet = 0.0_f32;
            for c in 0..4 {
                wet += self.process_comb(c, mono);
            }
            wet *= 0.25;

            // Series allpass filters
            wet = self.process_allpass(0, wet);
            wet = self.process_allpass(1, wet);

            buffer.data[i] = dry_l * (1.0 - mix) + wet * mix;
            if stereo {
                buffer.data[frames + i] = dry_r * (1.0 - mix) + wet * mix;
            }
        }
    }

    fn set_param(&mut self, name: &str, value: f32) -> EngineResult<()> {
        check_value(&self.id, name, value)?;
        match name {
            "decay" => self.decay = value.clamp(0.0, 0.99),
            "damping" => self.damping = value.clamp(0.0, 1.0),
            "mix" => self.mix = value.clamp(0.0, 1.0),
            _ => return Err(unknown_param(&*self, name)),
        }
        Ok(())
    }

    fn param(&self, name: &str) -> Option<f32> {
        match name {
            "decay" => Some(self.decay),
            "damping" => Some(self.damping),
            "mix" => Some(self.mix),
            _ => None,
        }
    }

    fn params(&self) -> Vec<EffectParam> {
        vec![
            EffectParam {
                name: "decay",
                value: self.decay,
                min: 0.0,
                max: 0.99,
            },
            EffectParam {
                name: "damping",
                value: self.damping,
                min: 0.0,
                max: 1.0,
            },
            EffectParam {
                name: "mix",
                value: self.mix,
                min: 0.0,
                max: 1.0,
            },
        ]
    }

    fn reset(&mut self) {
        for buf in &mut self.comb_buffers {
            buf.fill(0.0);
        }
        for buf in &mut self.allpass_buffers {
            buf.fill(0.0);
        }
        self.comb_pos = [0; 4];
        self.allpass_pos = [0; 2];
        self.comb_filter = [0.0; 4];
    }

    fn fresh_instance(&self) -> Box<dyn Effect> {
        let mut fx = Self {
            id: self.id.clone(),
            enabled: self.enabled,
            decay: self.decay,
            damping: self.damping,
            mix: self.mix,
            comb_buffers: Default::default(),
            comb_pos: [0; 4],
            comb_filter: [0.0; 4],
            allpass_buffers: Default::default(),
            allpass_pos: [0; 2],
            sample_rate: self.sample_rate,
        };
        fx.allocate();
        Box::new(fx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::ScratchBuffer;
    use approx::assert_relative_eq;

    #[test]
    fn test_gain_scales_in_db() {
        let mut fx = GainEffect::new();
        fx.set_param("gain", -6.0).unwrap();
        let mut scratch = ScratchBuffer::stereo(4);
        let mut buf = scratch.as_buffer(4);
        buf.data.fill(1.0);
        fx.process(&mut buf);
        assert_relative_eq!(buf.data[0], 0.501_187, epsilon = 1e-5);

        fx.set_param("gain", 100.0).unwrap();
        assert_eq!(fx.param("gain"), Some(24.0));
    }

    #[test]
    fn test_pan_center_is_unity_and_hard_left_folds() {
        let mut scratch = ScratchBuffer::stereo(1);
        let mut buf = scratch.as_buffer(1);
        buf.data.copy_from_slice(&[0.5, 0.25]);
        apply_pan(&mut buf, 0.0);
        assert_relative_eq!(buf.data[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(buf.data[1], 0.25, epsilon = 1e-6);

        apply_pan(&mut buf, -1.0);
        assert_relative_eq!(buf.data[0], 0.75, epsilon = 1e-6);
        assert_relative_eq!(buf.data[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_delay_echoes_impulse() {
        let mut fx = DelayEffect::new();
        fx.prepare(1000.0, 64);
        fx.set_param("time", 0.01).unwrap();
        fx.set_param("mix", 1.0).unwrap();
        fx.set_param("feedback", 0.0).unwrap();

        let mut scratch = ScratchBuffer::stereo(16);
        let mut buf = scratch.cleared(16);
        buf.data[0] = 1.0;
        fx.process(&mut buf);
        assert_eq!(buf.data[0], 0.0);
        assert_relative_eq!(buf.data[10], 1.0);
    }

    #[test]
    fn test_fresh_instance_keeps_identity_clears_state() {
        let mut fx = ReverbEffect::new();
        fx.set_param("mix", 1.0).unwrap();
        let mut scratch = ScratchBuffer::stereo(64);
        let mut buf = scratch.cleared(64);
        buf.data[0] = 1.0;
        fx.process(&mut buf);

        let mut copy = fx.fresh_instance();
        assert_eq!(copy.id(), fx.id());
        assert_eq!(copy.param("mix"), Some(1.0));

        let mut silent = scratch.cleared(64);
        copy.process(&mut silent);
        assert!(silent.data.iter().all(|s| *s == 0.0));
    }
}
