//! Per-task reordering of lifecycle events.
//!
//! Pub/sub can deliver a task's events out of order. Each event carries a
//! per-task sequence number; the buffer releases them in sequence and
//! holds an early arrival until the gap fills or the reorder window lapses,
//! after which the gap is skipped.

use crate::model::{EventRecord, TaskId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Streams with nothing pending are forgotten after this long without
/// traffic (a task whose terminal event never arrived).
const IDLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct TaskStream {
    next_seq: u64,
    pending: BTreeMap<u64, (Instant, EventRecord)>,
    last_seen: Instant,
}

impl TaskStream {
    fn new(now: Instant) -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            last_seen: now,
        }
    }

    /// Release consecutive events starting at `next_seq`.
    fn drain_ready(&mut self, out: &mut Vec<EventRecord>) {
        while let Some((_, event)) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            out.push(event);
        }
    }
}

#[derive(Debug)]
pub struct ReorderBuffer {
    window: Duration,
    streams: HashMap<TaskId, TaskStream>,
}

impl ReorderBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            streams: HashMap::new(),
        }
    }

    /// Accept one event; returns the events now ready, in order.
    ///
    /// Events without a sequence, and events behind the stream (a
    /// redelivered attempt re-announcing itself), pass straight through.
    pub fn push(&mut self, event: EventRecord, now: Instant) -> Vec<EventRecord> {
        let Some(seq) = event.seq else {
            return vec![event];
        };

        let task_id = event.task_id;
        let stream = self
            .streams
            .entry(task_id)
            .or_insert_with(|| TaskStream::new(now));
        stream.last_seen = now;

        if seq < stream.next_seq {
            return vec![event];
        }
        stream.pending.entry(seq).or_insert((now, event));

        let mut out = Vec::new();
        stream.drain_ready(&mut out);
        self.close_if_finished(task_id, &out);
        out
    }

    /// Release events whose gap has been open longer than the window.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<EventRecord> {
        let window = self.window;
        let mut out = Vec::new();
        let mut finished = Vec::new();

        for (task_id, stream) in self.streams.iter_mut() {
            let mut released = Vec::new();
            while stream
                .pending
                .values()
                .any(|(at, _)| now.saturating_duration_since(*at) >= window)
            {
                if let Some(&first) = stream.pending.keys().next() {
                    stream.next_seq = first;
                }
                stream.drain_ready(&mut released);
            }
            if released.iter().any(|e| e.event_type.is_terminal()) {
                finished.push(*task_id);
            }
            out.extend(released);
        }

        for task_id in finished {
            self.streams.remove(&task_id);
        }
        self.evict_idle(now);
        out
    }

    /// Forget streams with nothing held that have been quiet for an hour.
    /// Returns how many were dropped.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, stream| {
            !stream.pending.is_empty() || now.saturating_duration_since(stream.last_seen) < IDLE_TTL
        });
        before - self.streams.len()
    }

    /// Release everything held, in per-task order. Used on shutdown.
    pub fn flush_all(&mut self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        for (_, stream) in self.streams.drain() {
            out.extend(stream.pending.into_values().map(|(_, event)| event));
        }
        out
    }

    /// When the next held event expires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.streams
            .values()
            .flat_map(|s| s.pending.values().map(|(at, _)| *at + self.window))
            .min()
    }

    /// Tasks currently tracked.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn close_if_finished(&mut self, task_id: TaskId, released: &[EventRecord]) {
        if released.iter().any(|e| e.event_type.is_terminal())
            && let Some(stream) = self.streams.get(&task_id)
            && stream.pending.is_empty()
        {
            self.streams.remove(&task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use serde_json::Value;

    fn ev(id: TaskId, t: EventType, attempt: u32) -> EventRecord {
        EventRecord::for_attempt(id, "t", t, attempt, Value::Null)
    }

    fn types(events: &[EventRecord]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn holds_early_events_until_gap_fills() {
        let mut buf = ReorderBuffer::new(Duration::from_secs(1));
        let id = TaskId::new();
        let now = Instant::now();

        assert!(buf.push(ev(id, EventType::Succeeded, 0), now).is_empty());
        let out = buf.push(ev(id, EventType::Started, 0), now);
        assert_eq!(types(&out), vec![EventType::Started, EventType::Succeeded]);
        assert!(buf.is_empty());
    }

    #[test]
    fn window_expiry_skips_the_gap() {
        let window = Duration::from_millis(500);
        let mut buf = ReorderBuffer::new(window);
        let id = TaskId::new();
        let now = Instant::now();

        // started(0) lost; retried(0) and started(1) arrive
        assert!(buf.push(ev(id, EventType::Retried, 0), now).is_empty());
        assert!(buf.push(ev(id, EventType::Started, 1), now).is_empty());
        assert_eq!(buf.next_deadline(), Some(now + window));
        assert!(buf.flush_expired(now + window / 2).is_empty());

        let out = buf.flush_expired(now + window);
        assert_eq!(types(&out), vec![EventType::Retried, EventType::Started]);

        let out = buf.push(ev(id, EventType::Succeeded, 1), now + window);
        assert_eq!(types(&out), vec![EventType::Succeeded]);
    }

    #[test]
    fn redelivered_start_passes_through() {
        let mut buf = ReorderBuffer::new(Duration::from_secs(1));
        let id = TaskId::new();
        let now = Instant::now();

        assert_eq!(buf.push(ev(id, EventType::Started, 0), now).len(), 1);
        let dup = buf.push(ev(id, EventType::Started, 0), now);
        assert_eq!(types(&dup), vec![EventType::Started]);
        assert_eq!(buf.push(ev(id, EventType::Succeeded, 0), now).len(), 1);
    }

    #[test]
    fn idle_streams_are_evicted_without_held_events() {
        let mut buf = ReorderBuffer::new(Duration::from_secs(1));
        let (quiet, held) = (TaskId::new(), TaskId::new());
        let now = Instant::now();

        // started but never finished
        assert_eq!(buf.push(ev(quiet, EventType::Started, 0), now).len(), 1);
        assert_eq!(buf.evict_idle(now + Duration::from_secs(60)), 0);
        assert_eq!(buf.len(), 1);

        assert!(buf.push(ev(held, EventType::Failed, 0), now).is_empty());
        assert_eq!(buf.evict_idle(now + IDLE_TTL), 1);
        assert_eq!(buf.len(), 1, "a stream still holding events stays");
    }

    #[test]
    fn tasks_are_independent() {
        let mut buf = ReorderBuffer::new(Duration::from_secs(1));
        let (a, b) = (TaskId::new(), TaskId::new());
        let now = Instant::now();

        assert!(buf.push(ev(a, EventType::Failed, 0), now).is_empty());
        assert_eq!(buf.push(ev(b, EventType::Started, 0), now).len(), 1);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.flush_all().len(), 1);
    }
}
