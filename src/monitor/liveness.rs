//! Worker liveness from heartbeats.

use crate::model::Heartbeat;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Stale workers are forgotten after this long without a heartbeat.
const FORGET_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct WorkerStatus {
    last_seen: Instant,
    last: Heartbeat,
    stale: bool,
}

/// Tracks the last heartbeat per worker and reports each worker that goes
/// quiet exactly once, until it is heard from again.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout: Duration,
    workers: HashMap<String, WorkerStatus>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            workers: HashMap::new(),
        }
    }

    pub fn observe(&mut self, heartbeat: Heartbeat, now: Instant) {
        match self.workers.get_mut(&heartbeat.worker_id) {
            Some(status) => {
                if status.stale {
                    info!(worker_id = %heartbeat.worker_id, "worker heartbeat resumed");
                }
                status.last_seen = now;
                status.stale = false;
                status.last = heartbeat;
            }
            None => {
                info!(worker_id = %heartbeat.worker_id, queue = %heartbeat.queue, "worker discovered");
                self.workers.insert(
                    heartbeat.worker_id.clone(),
                    WorkerStatus {
                        last_seen: now,
                        last: heartbeat,
                        stale: false,
                    },
                );
            }
        }
    }

    /// Workers that just crossed the timeout, with their last heartbeat.
    pub fn newly_stale(&mut self, now: Instant) -> Vec<Heartbeat> {
        let timeout = self.timeout;
        self.workers
            .values_mut()
            .filter(|s| !s.stale && now.saturating_duration_since(s.last_seen) > timeout)
            .map(|s| {
                s.stale = true;
                s.last.clone()
            })
            .collect()
    }

    /// Drop stale workers not heard from in an hour, so ids of restarted
    /// processes do not pile up. Returns the ids forgotten.
    pub fn forget_departed(&mut self, now: Instant) -> Vec<String> {
        let departed: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, s)| s.stale && now.saturating_duration_since(s.last_seen) >= FORGET_AFTER)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &departed {
            self.workers.remove(id);
        }
        departed
    }

    /// Workers currently tracked, alive or stale.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers currently considered alive.
    pub fn alive(&self) -> usize {
        self.workers.values().filter(|s| !s.stale).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn beat(id: &str) -> Heartbeat {
        Heartbeat {
            worker_id: id.to_string(),
            queue: "default".into(),
            timestamp: Utc::now(),
            in_flight: 0,
            concurrency: 4,
        }
    }

    #[test]
    fn stale_workers_are_reported_once() {
        let mut tracker = LivenessTracker::new(Duration::from_secs(30));
        let t0 = Instant::now();
        tracker.observe(beat("a"), t0);
        tracker.observe(beat("b"), t0);
        tracker.observe(beat("b"), t0 + Duration::from_secs(25));

        let stale = tracker.newly_stale(t0 + Duration::from_secs(31));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id, "a");
        assert!(tracker.newly_stale(t0 + Duration::from_secs(40)).is_empty());
        assert_eq!(tracker.alive(), 1);

        tracker.observe(beat("a"), t0 + Duration::from_secs(41));
        assert_eq!(tracker.alive(), 2);
    }

    #[test]
    fn departed_workers_are_forgotten() {
        let mut tracker = LivenessTracker::new(Duration::from_secs(30));
        let t0 = Instant::now();
        tracker.observe(beat("old"), t0);
        tracker.observe(beat("live"), t0);

        let later = t0 + FORGET_AFTER;
        tracker.observe(beat("live"), later);
        // not yet reported stale, so not forgotten
        assert!(tracker.forget_departed(later).is_empty());

        assert_eq!(tracker.newly_stale(later).len(), 1);
        assert_eq!(tracker.forget_departed(later), vec!["old".to_string()]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.alive(), 1);
    }
}
