// src/scheduler.rs

use crate::ids::TrackId;
use crate::transport::Transport;

pub type ScheduleId = u64;

//
// ===============================
// MARK: Transport events
// ===============================
//

/// Callback payload fired when the transport reaches its time.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Trigger a MIDI note on a track's instrument.
    Note {
        track_id: TrackId,
        pitch: u8,
        velocity: u8,
        duration: f64,
    },

    /// One metronome beat of a loop-recording count-in.
    CountInBeat {
        bar: u32,
        beat: u32,
        total: u32,
        remaining: u32,
    },

    /// Pre-roll finished; the take starts here.
    CountInComplete,

    /// The transport wrapped from loop end back to loop start.
    LoopBoundary,
}

//
// ===============================
// MARK: Block plan
// ===============================
//

/// Sample-accurate execution plan for one audio block.
#[derive(Debug, Clone, Default)]
pub struct BlockPlan {
    pub frames: usize,
    pub slices: Vec<SlicePlan>,
}

/// A contiguous run of frames with no event inside it.
///
/// Events apply before the first frame of the slice. The transport
/// advances linearly across the slice starting at `position`.
#[derive(Debug, Clone)]
pub struct SlicePlan {
    /// Offset of the slice within the block.
    pub start_frame: usize,
    pub frame_count: usize,
    /// Transport position (samples) of the first frame.
    pub position: i64,
    pub events: Vec<TransportEvent>,
}

impl SlicePlan {
    fn new(start_frame: usize, position: i64) -> Self {
        Self {
            start_frame,
            frame_count: 0,
            position,
            events: Vec::new(),
        }
    }
}

//
// ===============================
// MARK: Scheduler
// ===============================
//

#[derive(Debug, Clone)]
struct Entry {
    id: ScheduleId,
    sample: i64,
    once: bool,
    event: TransportEvent,
}

/// Timeline of transport callbacks compiled into sample-accurate slices.
///
/// Entries are kept sorted by sample position; equal positions keep
/// their scheduling order. Repeating entries fire every time the
/// transport crosses them, which includes every pass of a loop.
#[derive(Debug)]
pub struct Scheduler {
    sample_rate: f64,
    entries: Vec<Entry>,
    next_id: ScheduleId,

    /// Ids of one-shot entries fired during the current block.
    fired_scratch: Vec<ScheduleId>,
}

impl Scheduler {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            entries: Vec::with_capacity(64),
            next_id: 1,
            fired_scratch: Vec::with_capacity(16),
        }
    }

    /// Schedule `event` at timeline `time` (seconds).
    pub fn schedule(&mut self, time: f64, event: TransportEvent) -> ScheduleId {
        self.insert(time, event, false)
    }

    /// Schedule `event` to fire once and then be forgotten.
    pub fn schedule_once(&mut self, time: f64, event: TransportEvent) -> ScheduleId {
        self.insert(time, event, true)
    }

    fn insert(&mut self, time: f64, event: TransportEvent, once: bool) -> ScheduleId {
        let id = self.next_id;
        self.next_id += 1;
        let sample = (time * self.sample_rate).round() as i64;
        let index = self.entries.partition_point(|e| e.sample <= sample);
        self.entries.insert(
            index,
            Entry {
                id,
                sample,
                once,
                event,
            },
        );
        id
    }

    pub fn cancel(&mut self, id: ScheduleId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn cancel_all(&mut self, ids: &[ScheduleId]) {
        if ids.is_empty() {
            return;
        }
        self.entries.retain(|e| !ids.contains(&e.id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compile the next audio block and advance the transport across it.
    pub fn compile_block(&mut self, transport: &mut Transport, frames: usize, plan: &mut BlockPlan) {
        plan.frames = frames;
        plan.slices.clear();

        if !transport.is_playing() {
            let mut slice = SlicePlan::new(0, transport.position());
            slice.frame_count = frames;
            plan.slices.push(slice);
            return;
        }

        self.fired_scratch.clear();
        let mut cursor = 0usize;

        while cursor < frames {
            let loop_bounds = transport.loop_samples();
            let mut wrapped = false;
            if let Some((loop_start, loop_end)) = loop_bounds {
                if transport.position() >= loop_end {
                    transport.set_position(loop_start);
                    wrapped = true;
                }
            }

            // Segment: linear run of transport time up to loop end or block end
            let seg_start = transport.position();
            let mut seg_end = seg_start + (frames - cursor) as i64;
            if let Some((_, loop_end)) = loop_bounds {
                if seg_start < loop_end {
                    seg_end = seg_end.min(loop_end);
                }
            }

            let mut slice = SlicePlan::new(cursor, seg_start);
            if wrapped {
                slice.events.push(TransportEvent::LoopBoundary);
            }

            let first = self.entries.partition_point(|e| e.sample < seg_start);
            let last = self.entries.partition_point(|e| e.sample < seg_end);

            for entry in &self.entries[first..last] {
                if entry.sample > slice.position {
                    // Close the running slice at this event boundary
                    slice.frame_count = (entry.sample - slice.position) as usize;
                    let next_start = slice.start_frame + slice.frame_count;
                    plan.slices.push(slice);
                    slice = SlicePlan::new(next_start, entry.sample);
                }
                slice.events.push(entry.event.clone());
                if entry.once {
                    self.fired_scratch.push(entry.id);
                }
            }

            slice.frame_count = (seg_end - slice.position) as usize;
            plan.slices.push(slice);

            let advanced = seg_end - seg_start;
            transport.advance(advanced);
            cursor += advanced as usize;
        }

        if !self.fired_scratch.is_empty() {
            let fired = &self.fired_scratch;
            self.entries.retain(|e| !fired.contains(&e.id));
        }

        debug_assert!(
            plan.slices.iter().map(|s| s.frame_count).sum::<usize>() == plan.frames,
            "Slice frames don't sum to block frames: {} != {}",
            plan.slices.iter().map(|s| s.frame_count).sum::<usize>(),
            plan.frames
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(n: u32) -> TransportEvent {
        TransportEvent::CountInBeat {
            bar: 1,
            beat: n,
            total: 4,
            remaining: 4 - n,
        }
    }

    fn playing(sample_rate: f64) -> Transport {
        let mut t = Transport::new(sample_rate);
        t.start();
        t
    }

    #[test]
    fn test_stopped_transport_yields_single_slice() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(0.0, beat(1));
        let mut t = Transport::new(1000.0);
        let mut plan = BlockPlan::default();
        s.compile_block(&mut t, 64, &mut plan);

        assert_eq!(plan.slices.len(), 1);
        assert!(plan.slices[0].events.is_empty());
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn test_slices_split_at_events() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(0.010, beat(1));
        s.schedule(0.030, beat(2));
        let mut t = playing(1000.0);
        let mut plan = BlockPlan::default();
        s.compile_block(&mut t, 64, &mut plan);

        let shape: Vec<(usize, usize, usize)> = plan
            .slices
            .iter()
            .map(|s| (s.start_frame, s.frame_count, s.events.len()))
            .collect();
        assert_eq!(shape, vec![(0, 10, 0), (10, 20, 1), (30, 34, 1)]);
        assert_eq!(t.position(), 64);
    }

    #[test]
    fn test_ties_keep_scheduling_order() {
        let mut s = Scheduler::new(1000.0);
        s.schedule(0.005, beat(1));
        s.schedule(0.005, beat(2));
        let mut t = playing(1000.0);
        let mut plan = BlockPlan::default();
        s.compile_block(&mut t, 16, &mut plan);

        assert_eq!(plan.slices[1].events, vec![beat(1), beat(2)]);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut s = Scheduler::new(1000.0);
        s.schedule_once(0.0, TransportEvent::CountInComplete);
        let repeat = s.schedule(0.0, beat(1));
        let mut t = playing(1000.0);
        t.set_loop(0.0, 0.016, true).unwrap();
        let mut plan = BlockPlan::default();

        s.compile_block(&mut t, 16, &mut plan);
        assert_eq!(plan.slices[0].events.len(), 2);
        assert_eq!(s.len(), 1);

        // Second pass: only the repeating entry, after the wrap marker
        s.compile_block(&mut t, 16, &mut plan);
        assert_eq!(
            plan.slices[0].events,
            vec![TransportEvent::LoopBoundary, beat(1)]
        );
        assert!(s.cancel(repeat));
        assert!(s.is_empty());
    }

    #[test]
    fn test_loop_wrap_inside_block() {
        let mut s = Scheduler::new(1000.0);
        let mut t = playing(1000.0);
        t.set_loop(0.0, 0.010, true).unwrap();
        t.set_position(6);
        let mut plan = BlockPlan::default();
        s.compile_block(&mut t, 8, &mut plan);

        assert_eq!(plan.slices.len(), 2);
        assert_eq!(plan.slices[0].frame_count, 4);
        assert_eq!(plan.slices[1].position, 0);
        assert_eq!(plan.slices[1].events, vec![TransportEvent::LoopBoundary]);
        assert_eq!(t.position(), 4);
    }

    #[test]
    fn test_negative_positions_reach_zero() {
        let mut s = Scheduler::new(1000.0);
        s.schedule_once(-0.004, beat(1));
        s.schedule_once(0.0, TransportEvent::CountInComplete);
        let mut t = playing(1000.0);
        t.set_position(-8);
        let mut plan = BlockPlan::default();
        s.compile_block(&mut t, 16, &mut plan);

        let positions: Vec<i64> = plan.slices.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![-8, -4, 0]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let mut s = Scheduler::new(1000.0);
        let a = s.schedule(1.0, beat(1));
        let b = s.schedule(2.0, beat(2));
        s.schedule(3.0, beat(3));
        s.cancel_all(&[a, b]);
        assert_eq!(s.len(), 1);
        s.clear();
        assert!(s.is_empty());
    }
}
