// src/event.rs
//
// Named engine notifications and a small publish/subscribe bus.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{EffectId, LaneId, TakeId, TrackId};
use crate::recording::TakeMetrics;

// ═══════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════

/// Notification published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    #[serde(rename = "track:created")]
    TrackCreated { track_id: TrackId, name: String },
    #[serde(rename = "track:deleted")]
    TrackDeleted { track_id: TrackId },

    #[serde(rename = "playback:play")]
    PlaybackPlay { time: f64 },
    #[serde(rename = "playback:stop")]
    PlaybackStop { time: f64 },
    #[serde(rename = "playback:pause")]
    PlaybackPause { time: f64 },
    #[serde(rename = "playback:record-start")]
    RecordStart { track_id: TrackId },
    #[serde(rename = "playback:record-stop")]
    RecordStop { track_id: TrackId, duration: f64 },

    #[serde(rename = "recording:started")]
    RecordingStarted { track_id: TrackId, bars: u32 },
    #[serde(rename = "recording:countIn")]
    RecordingCountIn {
        bar: u32,
        beat: u32,
        total: u32,
        remaining: u32,
    },
    #[serde(rename = "recording:loopComplete")]
    RecordingLoopComplete { pass_index: u32, total_takes: usize },
    #[serde(rename = "recording:takeCreated")]
    RecordingTakeCreated {
        take_id: TakeId,
        pass_index: u32,
        metrics: TakeMetrics,
    },
    #[serde(rename = "recording:stopped")]
    RecordingStopped { track_id: TrackId, take_count: usize },

    #[serde(rename = "automation:pointAdded")]
    AutomationPointAdded { lane_id: LaneId, time: f64, value: f64 },
    #[serde(rename = "automation:pointRemoved")]
    AutomationPointRemoved { lane_id: LaneId, time: f64 },
    #[serde(rename = "automation:recordingStarted")]
    AutomationRecordingStarted { lane_id: LaneId },
    #[serde(rename = "automation:recordingStopped")]
    AutomationRecordingStopped { lane_id: LaneId },

    #[serde(rename = "effect:added")]
    EffectAdded { track_id: TrackId, effect_id: EffectId },
}

impl EngineEvent {
    /// Wire name, e.g. `track:created`.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TrackCreated { .. } => "track:created",
            EngineEvent::TrackDeleted { .. } => "track:deleted",
            EngineEvent::PlaybackPlay { .. } => "playback:play",
            EngineEvent::PlaybackStop { .. } => "playback:stop",
            EngineEvent::PlaybackPause { .. } => "playback:pause",
            EngineEvent::RecordStart { .. } => "playback:record-start",
            EngineEvent::RecordStop { .. } => "playback:record-stop",
            EngineEvent::RecordingStarted { .. } => "recording:started",
            EngineEvent::RecordingCountIn { .. } => "recording:countIn",
            EngineEvent::RecordingLoopComplete { .. } => "recording:loopComplete",
            EngineEvent::RecordingTakeCreated { .. } => "recording:takeCreated",
            EngineEvent::RecordingStopped { .. } => "recording:stopped",
            EngineEvent::AutomationPointAdded { .. } => "automation:pointAdded",
            EngineEvent::AutomationPointRemoved { .. } => "automation:pointRemoved",
            EngineEvent::AutomationRecordingStarted { .. } => "automation:recordingStarted",
            EngineEvent::AutomationRecordingStopped { .. } => "automation:recordingStopped",
            EngineEvent::EffectAdded { .. } => "effect:added",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Bus
// ═══════════════════════════════════════════════════════════════════

pub type EventHandler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` receives every event.
    filter: Option<String>,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// One-to-many notification channel. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Receive only events whose [`EngineEvent::name`] equals `name`.
    pub fn subscribe_to<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(Some(name.to_string()), Arc::new(handler))
    }

    fn add(&self, filter: Option<String>, handler: EventHandler) -> Subscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            handler,
        });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let name = event.name();
        // Handlers run outside the lock so they may (un)subscribe
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .filter(|s| s.filter.as_deref().is_none_or(|f| f == name))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        log::trace!("emit {} to {} handler(s)", name, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the subscription alive; call [`Subscription::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().subscribers.retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_names_match_serialized_tag() {
        let event = EngineEvent::RecordStop {
            track_id: "track-1".into(),
            duration: 2.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
        assert_eq!(json["payload"]["trackId"], "track-1");
        assert_eq!(json["payload"]["duration"], 2.5);
    }

    #[test]
    fn test_filtered_and_wildcard_subscribers() {
        let bus = EventBus::new();
        let all = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&all);
        let _s1 = bus.subscribe(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&created);
        let _s2 = bus.subscribe_to("track:created", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EngineEvent::TrackCreated {
            track_id: "t".into(),
            name: "Vox".into(),
        });
        bus.emit(EngineEvent::PlaybackPlay { time: 0.0 });

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_detaches() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        bus.emit(EngineEvent::PlaybackStop { time: 1.0 });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let _sub = bus.subscribe(move |_| {
            let _ = inner_bus.subscribe(|_| {});
        });
        bus.emit(EngineEvent::PlaybackPlay { time: 0.0 });
        assert_eq!(bus.subscriber_count(), 2);
    }
}
