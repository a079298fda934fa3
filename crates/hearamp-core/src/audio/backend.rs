//! Backend abstraction
//!
//! The engine talks to the platform through [`AudioBackend`]: negotiate what
//! the devices can do, then open a duplex stream around a pair of callbacks.
//! Errors the platform raises later, on its own threads, land in a
//! [`DeviceStatus`] slot that the control thread polls.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::config::{StreamConfig, DEFAULT_BUFFER_SIZE, MIN_QUEUE_DEPTH};
use super::error::AudioResult;
use crate::engine::callback::StreamCallbacks;
use crate::types::MAX_FRAME_SIZE;

/// What the platform actually granted
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub input_channels: u16,
    pub output_channels: u16,
    /// Device period in frames, if the platform reports a fixed one
    pub input_buffer_frames: Option<u32>,
    pub output_buffer_frames: Option<u32>,
    /// Capture backlog bound in frames
    pub queue_depth: usize,
    pub input_device: String,
    pub output_device: String,
}

impl NegotiatedConfig {
    fn input_block(&self) -> usize {
        self.input_buffer_frames.unwrap_or(DEFAULT_BUFFER_SIZE) as usize
    }

    fn output_block(&self) -> usize {
        self.output_buffer_frames.unwrap_or(DEFAULT_BUFFER_SIZE) as usize
    }

    /// Samples the capture queue may hold before the oldest are dropped
    ///
    /// Never less than one device period plus a frame, or the queue would
    /// trim data the processor is about to use.
    pub fn capture_backlog(&self) -> usize {
        (self.queue_depth.max(MIN_QUEUE_DEPTH) * self.frame_size).max(self.input_block() + self.frame_size)
    }

    /// Capture queue size: the backlog plus one maximal input chunk
    ///
    /// The backlog is only trimmed when the output callback runs, so a
    /// stalled output thread lets input pile up past it. A full queue drops
    /// the newest audio while the trim drops the oldest; the headroom keeps
    /// a stall of up to `MAX_FRAME_SIZE` samples on the trim path. Latency
    /// stays bounded by the backlog either way.
    pub fn capture_capacity(&self) -> usize {
        self.capture_backlog() + MAX_FRAME_SIZE
    }

    /// Playback queue size: one maximal device request plus tick overshoot
    pub fn playback_capacity(&self) -> usize {
        MAX_FRAME_SIZE + 2 * self.frame_size
    }

    /// Worst-case input-to-output latency in milliseconds
    pub fn estimated_latency_ms(&self, lookahead_samples: usize) -> f32 {
        let samples = self.input_block()
            + self.queue_depth * self.frame_size
            + self.frame_size
            + lookahead_samples
            + self.output_block();
        samples as f32 * 1000.0 / self.sample_rate.max(1) as f32
    }
}

/// Classification of an asynchronous platform error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceFault {
    /// Device unplugged or rerouted; reacquiring may work
    Transient = 1,
    /// Backend or permission failure; retrying the same way will not help
    Fatal = 2,
}

/// Lock-free slot for faults raised on platform threads
#[derive(Debug, Default)]
pub struct DeviceStatus {
    fault: AtomicU8,
}

impl DeviceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault; a fatal fault is never downgraded to transient
    pub fn report(&self, fault: DeviceFault) {
        self.fault.fetch_max(fault as u8, Ordering::AcqRel);
    }

    /// Take the pending fault, clearing the slot
    pub fn take(&self) -> Option<DeviceFault> {
        match self.fault.swap(0, Ordering::AcqRel) {
            1 => Some(DeviceFault::Transient),
            2 => Some(DeviceFault::Fatal),
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.fault.store(0, Ordering::Release);
    }
}

/// Running duplex stream
///
/// Dropping the handle closes the streams.
pub trait StreamHandle {
    fn play(&self) -> AudioResult<()>;
    fn pause(&self) -> AudioResult<()>;
}

/// A platform audio layer
pub trait AudioBackend {
    type Stream: StreamHandle;

    /// Resolve devices and formats for `config`
    fn negotiate(&mut self, config: &StreamConfig) -> AudioResult<NegotiatedConfig>;

    /// Build the input and output streams around `callbacks` (not yet playing)
    fn open(
        &mut self,
        negotiated: &NegotiatedConfig,
        callbacks: StreamCallbacks,
        status: Arc<DeviceStatus>,
    ) -> AudioResult<Self::Stream>;
}
