//! Audio capture accumulator.
//!
//! Turns microphone frames into an ordered list of PCM16 chunks while a turn
//! is being recorded. Frames are amplitude-gated: a frame is kept only when
//! some sample exceeds the silence threshold; quiet frames are dropped, never
//! padded. This is a crude stand-in for voice activity detection.

use crate::config::CaptureStrategy;
use crate::protocol::f32_to_pcm16;
use tracing::debug;

/// One accepted capture frame as PCM16.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
}

impl AudioChunk {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A raw frame from the input device (f32, normalized to -1.0..1.0, mono).
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
}

impl CaptureFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }
}

/// True if any sample's magnitude exceeds `threshold`.
pub fn is_audible(samples: &[f32], threshold: f32) -> bool {
    samples.iter().any(|s| s.abs() > threshold)
}

/// Collects gated chunks for the current turn.
#[derive(Debug)]
pub struct CaptureAccumulator {
    threshold: f32,
    strategy: CaptureStrategy,
    armed: bool,
    pending: Vec<AudioChunk>,
    /// Chunks already handed out by `take_ready` during this turn.
    flushed: usize,
    dropped_frames: usize,
}

impl CaptureAccumulator {
    pub fn new(threshold: f32, strategy: CaptureStrategy) -> Self {
        Self {
            threshold,
            strategy,
            armed: false,
            pending: Vec::new(),
            flushed: 0,
            dropped_frames: 0,
        }
    }

    /// Reset the chunk list and start accepting frames.
    pub fn arm(&mut self) {
        self.reset();
        self.armed = true;
    }

    /// Stop accepting frames. Pending chunks are kept for the flush.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Forget the current turn's chunks and counters.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.flushed = 0;
        self.dropped_frames = 0;
    }

    /// Offer one frame. Returns true if it was kept.
    pub fn push_frame(&mut self, samples: &[f32]) -> bool {
        if !self.armed {
            return false;
        }
        if !is_audible(samples, self.threshold) {
            self.dropped_frames += 1;
            return false;
        }
        self.pending.push(AudioChunk {
            samples: f32_to_pcm16(samples),
        });
        true
    }

    /// Chunks that should be appended now under the streaming strategy.
    /// Always empty in batch mode.
    pub fn take_ready(&mut self) -> Vec<AudioChunk> {
        match self.strategy {
            CaptureStrategy::Batch => Vec::new(),
            CaptureStrategy::Streaming { flush_every } => {
                if self.pending.len() >= flush_every.max(1) {
                    self.flushed += self.pending.len();
                    std::mem::take(&mut self.pending)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Everything not yet handed out, in capture order. Ends the turn's list.
    pub fn drain(&mut self) -> Vec<AudioChunk> {
        self.armed = false;
        debug!(
            kept = self.pending.len() + self.flushed,
            dropped = self.dropped_frames,
            "capture drained"
        );
        std::mem::take(&mut self.pending)
    }

    /// Chunks accepted during this turn, including ones already streamed.
    pub fn turn_chunk_count(&self) -> usize {
        self.pending.len() + self.flushed
    }

    pub fn dropped_frames(&self) -> usize {
        self.dropped_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud(n: usize) -> Vec<f32> {
        (0..n).map(|i| if i == n / 2 { 0.3 } else { 0.0 }).collect()
    }

    #[test]
    fn quiet_frames_are_dropped_not_padded() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Batch);
        acc.arm();
        assert!(!acc.push_frame(&vec![0.005; 128]));
        assert!(acc.push_frame(&loud(128)));
        assert!(!acc.push_frame(&vec![-0.01; 128]));

        let chunks = acc.drain();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 128);
        assert_eq!(acc.dropped_frames(), 2);
    }

    #[test]
    fn frames_ignored_until_armed() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Batch);
        assert!(!acc.push_frame(&loud(64)));
        acc.arm();
        assert!(acc.push_frame(&loud(64)));
        acc.disarm();
        assert!(!acc.push_frame(&loud(64)));
        assert_eq!(acc.turn_chunk_count(), 1);
    }

    #[test]
    fn arming_clears_previous_turn() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Batch);
        acc.arm();
        acc.push_frame(&loud(64));
        acc.arm();
        assert_eq!(acc.turn_chunk_count(), 0);
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn chunks_keep_capture_order() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Batch);
        acc.arm();
        acc.push_frame(&[0.5, 0.0]);
        acc.push_frame(&[-0.5, 0.0]);
        let chunks = acc.drain();
        assert!(chunks[0].samples[0] > 0);
        assert!(chunks[1].samples[0] < 0);
    }

    #[test]
    fn batch_never_streams() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Batch);
        acc.arm();
        for _ in 0..10 {
            acc.push_frame(&loud(32));
        }
        assert!(acc.take_ready().is_empty());
        assert_eq!(acc.drain().len(), 10);
    }

    #[test]
    fn streaming_hands_out_groups_and_counts_them() {
        let mut acc = CaptureAccumulator::new(0.01, CaptureStrategy::Streaming { flush_every: 2 });
        acc.arm();
        acc.push_frame(&loud(32));
        assert!(acc.take_ready().is_empty());
        acc.push_frame(&loud(32));
        assert_eq!(acc.take_ready().len(), 2);
        acc.push_frame(&loud(32));

        assert_eq!(acc.turn_chunk_count(), 3);
        assert_eq!(acc.drain().len(), 1);
    }
}
