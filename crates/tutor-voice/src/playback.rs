//! Output audio scheduling.
//!
//! Every streamed fragment is placed on a single playback timeline:
//! `start = max(next_start, now)` and `next_start = start + duration`, so
//! fragments play back-to-back with no gap and no overlap however finely the
//! server splits them. The scheduler only does the bookkeeping; the engine
//! hands the samples to the output device and arms a timer for each source's end.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Duration of `samples` mono samples at `sample_rate`.
pub fn buffer_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / sample_rate as f64)
}

/// One scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSource {
    pub id: u64,
    pub start: Instant,
    pub duration: Duration,
}

impl PlaybackSource {
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    next_start: Option<Instant>,
    live: BTreeMap<u64, PlaybackSource>,
    next_id: u64,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            next_start: None,
            live: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Place a buffer of `duration` on the timeline.
    pub fn schedule(&mut self, duration: Duration, now: Instant) -> PlaybackSource {
        let start = match self.next_start {
            Some(next) if next > now => next,
            _ => now,
        };
        let source = PlaybackSource {
            id: self.next_id,
            start,
            duration,
        };
        self.next_id += 1;
        self.next_start = Some(source.end());
        self.live.insert(source.id, source);
        debug!(
            id = source.id,
            duration_ms = duration.as_millis() as u64,
            queued = self.live.len(),
            "scheduled playback source"
        );
        source
    }

    /// A source finished playing. Returns true when nothing is left.
    pub fn finish(&mut self, id: u64) -> bool {
        self.live.remove(&id);
        self.live.is_empty()
    }

    /// Drop every source and restart the timeline at `now`. Returns the dropped ids.
    pub fn stop_all(&mut self, now: Instant) -> Vec<u64> {
        let ids: Vec<u64> = self.live.keys().copied().collect();
        self.live.clear();
        self.next_start = Some(now);
        ids
    }

    /// No source is scheduled or playing.
    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    pub fn next_start(&self) -> Option<Instant> {
        self.next_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn sequential_deltas_are_gapless() {
        let mut sched = PlaybackScheduler::new();
        let t0 = Instant::now();
        let durations = [ms(120), ms(40), ms(300), ms(85)];

        let sources: Vec<_> = durations.iter().map(|d| sched.schedule(*d, t0)).collect();

        assert_eq!(sources[0].start, t0);
        for pair in sources.windows(2) {
            assert_eq!(pair[1].start, pair[0].start + pair[0].duration);
        }
        let total: Duration = durations.iter().sum();
        assert_eq!(sched.next_start(), Some(t0 + total));
    }

    #[test]
    fn late_delta_starts_now_not_in_the_past() {
        let mut sched = PlaybackScheduler::new();
        let t0 = Instant::now();
        sched.schedule(ms(100), t0);

        let later = t0 + ms(250);
        let source = sched.schedule(ms(50), later);
        assert_eq!(source.start, later);
    }

    #[test]
    fn next_start_never_moves_backwards() {
        let mut sched = PlaybackScheduler::new();
        let t0 = Instant::now();
        let mut last = t0;
        for (i, d) in [ms(10), ms(0), ms(30)].iter().enumerate() {
            let s = sched.schedule(*d, t0 + ms(i as u64 * 5));
            assert!(s.start >= last);
            last = s.end();
        }
    }

    #[test]
    fn drained_after_last_finish() {
        let mut sched = PlaybackScheduler::new();
        let t0 = Instant::now();
        let a = sched.schedule(ms(10), t0);
        let b = sched.schedule(ms(10), t0);
        assert!(!sched.finish(a.id));
        assert!(sched.finish(b.id));
        assert!(sched.is_idle());
    }

    #[test]
    fn stop_all_resets_timeline_to_now() {
        let mut sched = PlaybackScheduler::new();
        let t0 = Instant::now();
        sched.schedule(ms(500), t0);
        sched.schedule(ms(500), t0);

        let cut = t0 + ms(100);
        let dropped = sched.stop_all(cut);
        assert_eq!(dropped.len(), 2);
        assert!(sched.is_idle());

        let fresh = sched.schedule(ms(20), cut);
        assert_eq!(fresh.start, cut);
    }

    #[test]
    fn duration_from_sample_count() {
        assert_eq!(buffer_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(buffer_duration(2_400, 24_000), ms(100));
        assert_eq!(buffer_duration(10, 0), Duration::ZERO);
    }
}
