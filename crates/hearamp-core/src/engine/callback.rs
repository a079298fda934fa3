//! Device callbacks
//!
//! The platform calls these on its own real-time threads:
//!
//! ```text
//!  input device ─► CaptureCallback ──push──► capture queue
//!                                               │
//!  output device ◄─ RenderCallback ◄── playback │◄── Processor::tick ◄─┘
//! ```
//!
//! The render callback drives processing: it runs as many ticks as needed to
//! cover the device buffer and copies the result out. Both callbacks watch
//! the engine state and go silent (and acknowledge) as soon as the control
//! thread leaves `Running`.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::NegotiatedConfig;
use crate::engine::processor::Processor;
use crate::engine::state::SharedState;
use crate::engine::telemetry::EngineTelemetry;
use crate::ring_buffer::{frame_queue, FrameConsumer, FrameProducer};
use crate::types::{StereoBuffer, StereoSample, MAX_FRAME_SIZE};

/// Both callbacks of one duplex stream, handed to the backend
pub struct StreamCallbacks {
    pub capture: CaptureCallback,
    pub render: RenderCallback,
}

impl StreamCallbacks {
    /// Wire a processor between fresh capture and playback queues
    pub fn new(
        negotiated: &NegotiatedConfig,
        processor: Processor,
        shared: Arc<SharedState>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        let (capture_tx, capture_rx) = frame_queue(negotiated.capture_capacity(), Arc::clone(&telemetry.capture));
        let (playback_tx, playback_rx) = frame_queue(negotiated.playback_capacity(), Arc::clone(&telemetry.playback));

        Self {
            capture: CaptureCallback {
                producer: capture_tx,
                scratch: StereoBuffer::silence(MAX_FRAME_SIZE),
                shared: Arc::clone(&shared),
                telemetry: Arc::clone(&telemetry),
            },
            render: RenderCallback {
                processor: Box::new(processor),
                capture: capture_rx,
                playback_in: playback_tx,
                playback_out: playback_rx,
                scratch: StereoBuffer::silence(MAX_FRAME_SIZE),
                capture_backlog: negotiated.capture_backlog(),
                sample_rate: negotiated.sample_rate.max(1),
                shared,
                telemetry,
            },
        }
    }
}

/// Input side: converts device samples and queues them
pub struct CaptureCallback {
    producer: FrameProducer,
    scratch: StereoBuffer,
    shared: Arc<SharedState>,
    telemetry: Arc<EngineTelemetry>,
}

impl CaptureCallback {
    /// `data` is interleaved with `channels` channels; mono is duplicated,
    /// channels beyond the first two are ignored.
    pub fn on_input(&mut self, data: &[f32], channels: usize, device_delay: Option<Duration>) {
        if let Some(delay) = device_delay {
            self.telemetry.set_input_delay_us(delay.as_micros() as u64);
        }
        if !self.shared.is_running() {
            return;
        }

        let channels = channels.max(1);
        for chunk in data.chunks(MAX_FRAME_SIZE * channels) {
            let frames = chunk.len() / channels;
            self.scratch.set_len_from_capacity(frames);
            for (dst, src) in self.scratch.iter_mut().zip(chunk.chunks_exact(channels)) {
                *dst = if channels == 1 {
                    StereoSample::mono(src[0])
                } else {
                    StereoSample::new(src[0], src[1])
                };
            }
            self.producer.push(self.scratch.as_slice());
        }
    }
}

/// Output side: runs the processor and fills the device buffer
pub struct RenderCallback {
    processor: Box<Processor>,
    capture: FrameConsumer,
    playback_in: FrameProducer,
    playback_out: FrameConsumer,
    scratch: StereoBuffer,
    capture_backlog: usize,
    sample_rate: u32,
    shared: Arc<SharedState>,
    telemetry: Arc<EngineTelemetry>,
}

impl RenderCallback {
    /// `data` is interleaved with `channels` channels
    pub fn on_output(&mut self, data: &mut [f32], channels: usize, device_delay: Option<Duration>) {
        let channels = channels.max(1);

        if !self.shared.is_running() {
            data.fill(0.0);
            self.capture.clear();
            self.playback_out.clear();
            self.shared.acknowledge_quiesced();
            return;
        }

        // Anything beyond the backlog bound is latency we do not want
        self.capture.discard_excess(self.capture_backlog);

        for chunk in data.chunks_mut(MAX_FRAME_SIZE * channels) {
            let frames = chunk.len() / channels;
            self.fill_playback(frames);
            self.scratch.set_len_from_capacity(frames);
            self.playback_out.pop(self.scratch.as_mut_slice());
            write_interleaved(self.scratch.as_slice(), chunk, channels);
        }

        if let Some(delay) = device_delay {
            self.measure_latency(delay);
        }
    }

    /// Tick until `frames` samples are ready (bounded by the playback capacity)
    fn fill_playback(&mut self, frames: usize) {
        let max_ticks = frames / self.processor.frame_size() + 2;
        for _ in 0..max_ticks {
            if self.playback_out.queued_len() >= frames {
                break;
            }
            self.processor.tick(&mut self.capture, &mut self.playback_in);
        }
    }

    fn measure_latency(&self, output_delay: Duration) {
        let queued = self.capture.queued_len()
            + self.playback_out.queued_len()
            + self.processor.latency_samples()
            + self.processor.frame_size();
        let queued_us = queued as u64 * 1_000_000 / self.sample_rate as u64;
        let total = self.telemetry.input_delay_us() + queued_us + output_delay.as_micros() as u64;
        self.telemetry.set_latency_us(total);
    }
}

/// Copy stereo samples into an interleaved device buffer
///
/// Mono outputs get the left/right mix, extra channels are zeroed.
pub(crate) fn write_interleaved(src: &[StereoSample], dst: &mut [f32], channels: usize) {
    for (frame, sample) in dst.chunks_mut(channels).zip(src) {
        match frame {
            [mono] => *mono = sample.mid(),
            [left, right, rest @ ..] => {
                *left = sample.left;
                *right = sample.right;
                rest.fill(0.0);
            }
            [] => {}
        }
    }
}
