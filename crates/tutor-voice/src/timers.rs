//! Abortable one-shot timers that post back into the engine loop.
//!
//! Each timer is a spawned `tokio::time::sleep` that sends a [`TimerFiring`]
//! when it elapses. Re-arming or cancelling a kind aborts the old task, and
//! every firing carries a sequence number so a firing that was already queued
//! when its timer got cancelled is recognised and ignored.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// First-output deadline for the response with this generation.
    Watchdog { generation: u64 },
    /// Duplicate `response.cancel` after an interrupt.
    BackupCancel,
    /// Delay before flushing a turn that follows an interrupt.
    Stabilization,
    /// A playback source reached its end.
    SourceEnded(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFiring {
    pub kind: TimerKind,
    seq: u64,
}

pub struct TimerSet {
    tx: mpsc::UnboundedSender<TimerFiring>,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_seq: u64,
}

impl TimerSet {
    /// Create an empty set and the receiver its firings arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFiring>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_seq: 0,
            },
            rx,
        )
    }

    /// Arm `kind` to fire after `delay`, replacing any timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.arm_at(kind, Instant::now() + delay);
    }

    /// Arm `kind` to fire at `deadline`, replacing any timer of the same kind.
    pub fn arm_at(&mut self, kind: TimerKind, deadline: Instant) {
        self.cancel(kind);
        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(TimerFiring { kind, seq });
        });
        trace!(?kind, seq, "timer armed");
        self.armed.insert(kind, (seq, handle));
    }

    /// Abort the timer of this kind. False if none was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Accept a firing from the channel. Returns false for firings of timers
    /// that were cancelled or re-armed after they were queued.
    pub fn accept(&mut self, firing: TimerFiring) -> bool {
        match self.armed.get(&firing.kind) {
            Some((seq, _)) if *seq == firing.seq => {
                self.armed.remove(&firing.kind);
                true
            }
            _ => {
                trace!(kind = ?firing.kind, "ignoring stale timer firing");
                false
            }
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn abort_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (mut timers, mut rx) = TimerSet::new();
        timers.arm(TimerKind::BackupCancel, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(rx.try_recv().is_err());

        let firing = rx.recv().await.unwrap();
        assert_eq!(firing.kind, TimerKind::BackupCancel);
        assert!(timers.accept(firing));
        assert!(!timers.is_armed(TimerKind::BackupCancel));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut rx) = TimerSet::new();
        timers.arm(TimerKind::Stabilization, Duration::from_millis(500));
        assert!(timers.cancel(TimerKind::Stabilization));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_firing_is_stale_after_rearm() {
        let (mut timers, mut rx) = TimerSet::new();
        let kind = TimerKind::Watchdog { generation: 1 };
        timers.arm(kind, Duration::from_millis(10));
        let first = rx.recv().await.unwrap();

        // Re-armed before the first firing was handled.
        timers.arm(kind, Duration::from_millis(10));
        assert!(!timers.accept(first));
        assert!(timers.is_armed(kind));

        let second = rx.recv().await.unwrap();
        assert!(timers.accept(second));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdogs_are_per_generation() {
        let (mut timers, mut rx) = TimerSet::new();
        timers.arm(TimerKind::Watchdog { generation: 1 }, Duration::from_secs(15));
        timers.arm(TimerKind::Watchdog { generation: 2 }, Duration::from_secs(15));
        timers.arm(TimerKind::SourceEnded(7), Duration::from_millis(40));

        assert!(timers.cancel(TimerKind::Watchdog { generation: 1 }));
        assert!(!timers.is_armed(TimerKind::Watchdog { generation: 1 }));
        assert!(timers.is_armed(TimerKind::Watchdog { generation: 2 }));

        let firing = rx.recv().await.unwrap();
        assert_eq!(firing.kind, TimerKind::SourceEnded(7));
        assert!(timers.accept(firing));

        timers.abort_all();
        assert!(!timers.is_armed(TimerKind::Watchdog { generation: 2 }));
    }
}
