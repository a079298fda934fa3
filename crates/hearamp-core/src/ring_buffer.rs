//! Lock-free frame queues between the platform callbacks and the processor
//!
//! A thin layer over `rtrb` that moves whole blocks of [`StereoSample`]s
//! with all-or-nothing semantics:
//!
//! ```text
//!  capture callback ──push(block)──► [ FrameQueue ] ──pop(frame)──► processor
//!                                        │
//!                 overrun: block dropped │ underrun: silence emitted
//!                                        ▼
//!                                   QueueStats (atomics)
//! ```
//!
//! Neither side ever blocks or allocates. A producer that finds too few free
//! slots drops the whole block and bumps `overruns`; a consumer that finds
//! too few queued samples writes silence and bumps `underruns`. Those two
//! counters are what the control thread sees of the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::StereoSample;

/// Cumulative queue counters, shared with the control thread
///
/// Kept in an `Arc` owned by the engine so totals survive stream rebuilds.
#[derive(Debug, Default)]
pub struct QueueStats {
    overruns: AtomicU64,
    underruns: AtomicU64,
    trimmed_samples: AtomicU64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks dropped because the queue was full
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Blocks replaced by silence because the queue was empty
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples discarded to keep the backlog inside the latency budget
    pub fn trimmed_samples(&self) -> u64 {
        self.trimmed_samples.load(Ordering::Relaxed)
    }
}

/// Create a frame queue holding at least `min_capacity` samples
///
/// The real capacity is rounded up to a power of two.
pub fn frame_queue(min_capacity: usize, stats: Arc<QueueStats>) -> (FrameProducer, FrameConsumer) {
    let capacity = min_capacity.max(1).next_power_of_two();
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        FrameProducer {
            inner: producer,
            stats: Arc::clone(&stats),
        },
        FrameConsumer {
            inner: consumer,
            stats,
        },
    )
}

/// Writing half of a frame queue (exactly one thread)
pub struct FrameProducer {
    inner: rtrb::Producer<StereoSample>,
    stats: Arc<QueueStats>,
}

impl FrameProducer {
    /// Push a whole block, or drop it and count an overrun
    ///
    /// Returns `false` when the block was dropped.
    pub fn push(&mut self, block: &[StereoSample]) -> bool {
        match self.inner.write_chunk(block.len()) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&block[..split]);
                second.copy_from_slice(&block[split..]);
                chunk.commit_all();
                true
            }
            Err(_) => {
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Free slots in samples
    pub fn free_len(&self) -> usize {
        self.inner.slots()
    }

    /// Total capacity in samples
    pub fn capacity(&self) -> usize {
        self.inner.buffer().capacity()
    }
}

/// Reading half of a frame queue (exactly one thread)
pub struct FrameConsumer {
    inner: rtrb::Consumer<StereoSample>,
    stats: Arc<QueueStats>,
}

impl FrameConsumer {
    /// Pop exactly `dest.len()` samples, or emit silence and count an underrun
    ///
    /// Returns `false` when `dest` was filled with silence.
    pub fn pop(&mut self, dest: &mut [StereoSample]) -> bool {
        match self.inner.read_chunk(dest.len()) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                let split = first.len();
                dest[..split].copy_from_slice(first);
                dest[split..].copy_from_slice(second);
                chunk.commit_all();
                true
            }
            Err(_) => {
                dest.fill(StereoSample::silence());
                self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Samples currently queued
    pub fn queued_len(&self) -> usize {
        self.inner.slots()
    }

    /// Drop the oldest samples until at most `max_backlog` remain
    ///
    /// Returns the number of samples discarded.
    pub fn discard_excess(&mut self, max_backlog: usize) -> usize {
        let excess = self.inner.slots().saturating_sub(max_backlog);
        if excess == 0 {
            return 0;
        }
        match self.inner.read_chunk(excess) {
            Ok(chunk) => {
                chunk.commit_all();
                self.stats
                    .trimmed_samples
                    .fetch_add(excess as u64, Ordering::Relaxed);
                excess
            }
            Err(_) => 0,
        }
    }

    /// Discard everything queued without counting it as trimming
    pub fn clear(&mut self) {
        let queued = self.inner.slots();
        if let Ok(chunk) = self.inner.read_chunk(queued) {
            chunk.commit_all();
        }
    }
}
