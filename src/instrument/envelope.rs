// src/instrument/envelope.rs

// ═══════════════════════════════════════════════════════════════════
// ADSR Envelope
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Linear ADSR with one-pole smoothing on the output.
#[derive(Debug, Clone)]
pub struct Adsr {
    stage: EnvelopeStage,
    level: f32,
    smooth_level: f32,
    smooth_coeff: f32,

    // Parameters (in seconds)
    attack: f32,
    decay: f32,
    sustain: f32, // 0-1 level
    release: f32,

    sample_rate: f32,
    release_level: f32,
}

impl Adsr {
    pub fn new(sample_rate: f32) -> Self {
        let mut env = Self {
            stage: EnvelopeStage::Idle,
            level: 0.0,
            smooth_level: 0.0,
            smooth_coeff: 1.0,
            attack: 0.005,
            decay: 0.1,
            sustain: 0.3,
            release: 1.0,
            sample_rate,
            release_level: 0.0,
        };
        env.update_coeff();
        env
    }

    pub fn with_times(mut self, attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        self.attack = attack.max(0.001);
        self.decay = decay.max(0.001);
        self.sustain = sustain.clamp(0.0, 1.0);
        self.release = release.max(0.001);
        self
    }

    fn update_coeff(&mut self) {
        let cutoff = 1000.0;
        self.smooth_coeff = 1.0 - (-2.0 * std::f32::consts::PI * cutoff / self.sample_rate).exp();
    }

    /// Start the attack. A stolen voice restarts from silence.
    pub fn trigger(&mut self, restart: bool) {
        if self.stage == EnvelopeStage::Idle || restart {
            self.level = 0.0;
            self.smooth_level = 0.0;
        }
        self.stage = EnvelopeStage::Attack;
    }

    pub fn release(&mut self) {
        if self.stage != EnvelopeStage::Idle && self.stage != EnvelopeStage::Release {
            self.release_level = self.level;
            self.stage = EnvelopeStage::Release;
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle && self.smooth_level < 1e-5
    }

    #[inline]
    pub fn is_releasing(&self) -> bool {
        self.stage == EnvelopeStage::Release
    }

    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.level = 0.0;
        self.smooth_level = 0.0;
    }

    /// Next smoothed envelope value.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        let env = self.process_sample();
        self.smooth_level += (env - self.smooth_level) * self.smooth_coeff;
        self.smooth_level
    }

    #[inline]
    fn process_sample(&mut self) -> f32 {
        match self.stage {
            EnvelopeStage::Idle => 0.0,

            EnvelopeStage::Attack => {
                let rate = 1.0 / (self.attack * self.sample_rate).max(1.0);
                self.level += rate;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
                self.level
            }

            EnvelopeStage::Decay => {
                let rate = (1.0 - self.sustain) / (self.decay * self.sample_rate).max(1.0);
                self.level -= rate;
                if self.level <= self.sustain {
                    self.level = self.sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
                self.level
            }

            EnvelopeStage::Sustain => self.sustain,

            EnvelopeStage::Release => {
                let rate = self.release_level / (self.release * self.sample_rate).max(1.0);
                self.level -= rate;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
                self.level
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attack_decay_sustain_release() {
        let mut env = Adsr::new(1000.0).with_times(0.01, 0.01, 0.5, 0.01);
        env.trigger(false);
        let peak = (0..12).map(|_| env.process_sample()).fold(0.0_f32, f32::max);
        assert_eq!(peak, 1.0);

        for _ in 0..20 {
            env.process_sample();
        }
        assert_eq!(env.process_sample(), 0.5);

        env.release();
        assert!(env.is_releasing());
        for _ in 0..20 {
            env.process_sample();
        }
        assert_eq!(env.process_sample(), 0.0);
        for _ in 0..200 {
            env.next_sample();
        }
        assert!(env.is_idle());
    }

    #[test]
    fn test_release_when_idle_is_noop() {
        let mut env = Adsr::new(48_000.0);
        env.release();
        assert!(!env.is_releasing());
        assert_eq!(env.next_sample(), 0.0);
    }
}
