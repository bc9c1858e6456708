use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::JobId;

/// What a job asked to be woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobTimer {
    /// Begin thumbnail capture; runs once the loop is idle.
    StartCapture,
    NextCapture,
    Autosave,
    /// Look for a cached waveform before launching analysis.
    Discover,
    /// One cycle of the playback rate controller.
    RateCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Deadline-ordered one-shot timers. Cancellation is lazy: cancelled entries
/// stay in the heap and are skipped when they surface.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, (JobId, JobTimer)>,
    next: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, at: Instant, job: JobId, timer: JobTimer) -> TimerId {
        let seq = self.next;
        self.next += 1;
        self.heap.push(Reverse((at, seq)));
        self.pending.insert(seq, (job, timer));
        TimerId(seq)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool { self.pending.remove(&id.0).is_some() }

    pub fn cancel_job(&mut self, job: JobId) { self.pending.retain(|_, (owner, _)| *owner != job); }

    /// Pops the earliest timer due at `now`. Timers due at the same instant
    /// fire in scheduling order.
    pub fn pop_due(&mut self, now: Instant) -> Option<(JobId, JobTimer)> {
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if !self.pending.contains_key(&seq) {
                self.heap.pop();
                continue;
            }
            if at > now {
                return None;
            }
            self.heap.pop();
            return self.pending.remove(&seq);
        }
        None
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if self.pending.contains_key(&seq) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize { self.pending.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let job = JobId::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(20), job, JobTimer::Autosave);
        timers.schedule(now + Duration::from_millis(10), job, JobTimer::NextCapture);
        assert_eq!(timers.pop_due(now), None);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        let later = now + Duration::from_millis(30);
        assert_eq!(timers.pop_due(later), Some((job, JobTimer::NextCapture)));
        assert_eq!(timers.pop_due(later), Some((job, JobTimer::Autosave)));
        assert_eq!(timers.pop_due(later), None);
    }

    #[test]
    fn test_cancelled_timers_never_fire() {
        let mut timers = TimerQueue::default();
        let (a, b) = (JobId::new(), JobId::new());
        let now = Instant::now();
        let first = timers.schedule(now, a, JobTimer::RateCycle);
        timers.schedule(now, a, JobTimer::Autosave);
        timers.schedule(now, b, JobTimer::Discover);
        assert!(timers.cancel(first));
        assert!(!timers.cancel(first));
        timers.cancel_job(a);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_due(now), Some((b, JobTimer::Discover)));
        assert_eq!(timers.next_deadline(), None);
    }
}
