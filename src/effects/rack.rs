// src/effects/rack.rs
//
// Ordered effect chain with an explicit input/output boundary.

use serde::Serialize;

use crate::audio_buffer::AudioBuffer;
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::ids::EffectId;

use super::{Effect, EffectKind, EffectParam};

// ═══════════════════════════════════════════════════════════════════
// Links
// ═══════════════════════════════════════════════════════════════════

/// Endpoint of a rack link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNode {
    Input,
    Effect(EffectId),
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub from: ChainNode,
    pub to: ChainNode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectSnapshot {
    pub id: EffectId,
    pub kind: EffectKind,
    pub enabled: bool,
    pub params: Vec<EffectParam>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RackSnapshot {
    pub effects: Vec<EffectSnapshot>,
    pub links: Vec<Link>,
    pub cpu_usage: f32,
}

// ═══════════════════════════════════════════════════════════════════
// Rack
// ═══════════════════════════════════════════════════════════════════

/// A track's effect chain.
///
/// The logical order lives in `effects`. After every structural or
/// enable-state change, [`materialize`](Self::materialize) rebuilds the
/// physical links and the processing route from scratch, so the route
/// seen by `process` always matches the logical order.
pub struct EffectsRack {
    effects: Vec<Box<dyn Effect>>,
    links: Vec<Link>,
    /// Indices into `effects`, in processing order.
    route: Vec<usize>,
    sample_rate: f64,
    max_block: usize,
}

impl std::fmt::Debug for EffectsRack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectsRack")
            .field("effects", &self.effect_ids())
            .field("links", &self.links)
            .finish()
    }
}

impl EffectsRack {
    pub fn new(sample_rate: f64, max_block: usize) -> Self {
        let mut rack = Self {
            effects: Vec::new(),
            links: Vec::new(),
            route: Vec::new(),
            sample_rate,
            max_block,
        };
        rack.materialize();
        rack
    }

    // ─────────────────────────────────────────────────────────────────
    // Structure
    // ─────────────────────────────────────────────────────────────────

    /// Insert at `index` (appends when `None` or past the end).
    pub fn add_effect(&mut self, mut effect: Box<dyn Effect>, index: Option<usize>) -> EngineResult<()> {
        if self.position(effect.id()).is_some() {
            return Err(EngineError::new(
                ErrorCode::EffectNotFound,
                format!("Effect {} already exists in rack", effect.id()),
            )
            .with_effect(effect.id()));
        }
        effect.prepare(self.sample_rate, self.max_block);
        let index = index.unwrap_or(self.effects.len()).min(self.effects.len());
        log::debug!("Rack: insert {} ({}) at {}", effect.id(), effect.kind(), index);
        self.effects.insert(index, effect);
        self.materialize();
        Ok(())
    }

    /// Remove and drop a unit.
    pub fn remove_effect(&mut self, id: &str) -> EngineResult<()> {
        let index = self
            .position(id)
            .ok_or_else(|| EngineError::effect_not_found(id))?;
        self.effects.remove(index);
        self.materialize();
        Ok(())
    }

    pub fn reorder_effect(&mut self, from: usize, to: usize) -> EngineResult<()> {
        let len = self.effects.len();
        if from >= len || to >= len {
            return Err(EngineError::invalid_parameter(format!(
                "Invalid effect index: from={from}, to={to}, len={len}"
            )));
        }
        let effect = self.effects.remove(from);
        self.effects.insert(to, effect);
        self.materialize();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.effects.clear();
        self.materialize();
    }

    pub fn set_effect_enabled(&mut self, id: &str, enabled: bool) -> EngineResult<()> {
        self.effect_mut(id)?.set_enabled(enabled);
        self.materialize();
        Ok(())
    }

    /// Enable or disable every unit without changing the order.
    pub fn bypass_all(&mut self, bypass: bool) {
        for effect in &mut self.effects {
            effect.set_enabled(!bypass);
        }
        self.materialize();
    }

    /// Rebuild links and route from the logical order.
    fn materialize(&mut self) {
        self.links.clear();
        self.route.clear();

        let mut prev = ChainNode::Input;
        for (index, effect) in self.effects.iter().enumerate() {
            if !effect.is_enabled() {
                continue;
            }
            let node = ChainNode::Effect(effect.id().to_string());
            self.links.push(Link {
                from: prev,
                to: node.clone(),
            });
            self.route.push(index);
            prev = node;
        }
        self.links.push(Link {
            from: prev,
            to: ChainNode::Output,
        });
    }

    // ─────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────

    fn position(&self, id: &str) -> Option<usize> {
        self.effects.iter().position(|e| e.id() == id)
    }

    pub fn effect(&self, id: &str) -> Option<&dyn Effect> {
        self.effects.iter().find(|e| e.id() == id).map(|e| e.as_ref())
    }

    pub fn effect_mut(&mut self, id: &str) -> EngineResult<&mut Box<dyn Effect>> {
        self.effects
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or_else(|| EngineError::effect_not_found(id))
    }

    pub fn effect_ids(&self) -> Vec<EffectId> {
        self.effects.iter().map(|e| e.id().to_string()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Effect ids in the order audio flows through them.
    pub fn chain(&self) -> Vec<EffectId> {
        self.route
            .iter()
            .map(|&i| self.effects[i].id().to_string())
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.route.len()
    }

    pub fn cpu_usage(&self) -> f32 {
        (self.enabled_count() as f32 * 0.05).min(1.0)
    }

    pub fn snapshot(&self) -> RackSnapshot {
        RackSnapshot {
            effects: self
                .effects
                .iter()
                .map(|e| EffectSnapshot {
                    id: e.id().to_string(),
                    kind: e.kind(),
                    enabled: e.is_enabled(),
                    params: e.params(),
                })
                .collect(),
            links: self.links.clone(),
            cpu_usage: self.cpu_usage(),
        }
    }

    /// Independent rack of fresh effect instances for offline rendering.
    pub fn offline_copy(&self) -> EffectsRack {
        let mut rack = EffectsRack::new(self.sample_rate, self.max_block);
        rack.effects = self.effects.iter().map(|e| e.fresh_instance()).collect();
        for effect in &mut rack.effects {
            effect.prepare(rack.sample_rate, rack.max_block);
        }
        rack.materialize();
        rack
    }

    // ─────────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────────

    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.sample_rate = sample_rate;
        self.max_block = max_block;
        for effect in &mut self.effects {
            effect.prepare(sample_rate, max_block);
        }
    }

    pub fn reset(&mut self) {
        for effect in &mut self.effects {
            effect.reset();
        }
    }

    /// Run `buffer` through the materialized route.
    pub fn process(&mut self, buffer: &mut AudioBuffer) {
        for &index in &self.route {
            self.effects[index].process(buffer);
        }
    }
}
