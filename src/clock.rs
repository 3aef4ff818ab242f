// src/clock.rs
//
// Wall-clock sources for meter hold timers and MIDI timestamps.

use std::sync::Arc;

use parking_lot::Mutex;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Reads the system time through chrono (works on wasm32 as well).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp_millis() as f64 + f64::from(now.timestamp_subsec_micros() % 1000) / 1000.0
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }

    pub fn set(&self, ms: f64) {
        *self.now.lock() = ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}
