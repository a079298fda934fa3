//! Counters and events leaving the audio thread
//!
//! Two channels, both lock-free:
//!
//! - [`EngineTelemetry`]: plain atomics the control thread can read at any
//!   time (queue xruns, frames processed, measured latency, event totals).
//! - [`TelemetryEvent`]: discrete happenings (limiter engaged, feedback
//!   found) pushed into an `rtrb` queue and drained by `AudioEngine::poll`.
//!   A full queue drops the event and counts it, it never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dsp::FeedbackReport;
use crate::ring_buffer::QueueStats;

/// Discrete event raised by the processor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryEvent {
    /// Limiter started reducing gain
    LimiterEngaged { peak_db: f32, gain_reduction_db: f32 },
    /// Howl detector engaged a notch
    FeedbackDetected { channel: usize, frequency_hz: f32 },
    /// Notch did not bring the tone down; band gain is being reduced
    FeedbackUnresolved {
        channel: usize,
        frequency_hz: f32,
        band: usize,
        reduction_db: f32,
    },
    /// Adaptive canceller diverged and was reset
    FeedbackModelReset { channel: usize },
    /// Compressor state went non-finite and was reset
    NumericalReset { count: u32 },
    /// A new parameter snapshot took effect
    ParametersApplied { generation: u64 },
}

impl From<FeedbackReport> for TelemetryEvent {
    fn from(report: FeedbackReport) -> Self {
        match report {
            FeedbackReport::Detected { channel, frequency_hz } => {
                TelemetryEvent::FeedbackDetected { channel, frequency_hz }
            }
            FeedbackReport::Unresolved {
                channel,
                frequency_hz,
                band,
                reduction_db,
            } => TelemetryEvent::FeedbackUnresolved {
                channel,
                frequency_hz,
                band,
                reduction_db,
            },
            FeedbackReport::ModelReset { channel } => TelemetryEvent::FeedbackModelReset { channel },
        }
    }
}

/// Shared engine counters
#[derive(Debug, Default)]
pub struct EngineTelemetry {
    pub capture: Arc<QueueStats>,
    pub playback: Arc<QueueStats>,
    frames_processed: AtomicU64,
    latency_us: AtomicU64,
    input_delay_us: AtomicU64,
    limiter_engagements: AtomicU64,
    feedback_detections: AtomicU64,
    feedback_unresolved: AtomicU64,
    model_resets: AtomicU64,
    numerical_resets: AtomicU64,
    dropped_events: AtomicU64,
}

impl EngineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_latency_us(&self, us: u64) {
        self.latency_us.store(us, Ordering::Relaxed);
    }

    pub(crate) fn set_input_delay_us(&self, us: u64) {
        self.input_delay_us.store(us, Ordering::Relaxed);
    }

    pub(crate) fn input_delay_us(&self) -> u64 {
        self.input_delay_us.load(Ordering::Relaxed)
    }

    /// Count an event in its matching total
    pub(crate) fn record(&self, event: &TelemetryEvent) {
        let counter = match event {
            TelemetryEvent::LimiterEngaged { .. } => &self.limiter_engagements,
            TelemetryEvent::FeedbackDetected { .. } => &self.feedback_detections,
            TelemetryEvent::FeedbackUnresolved { .. } => &self.feedback_unresolved,
            TelemetryEvent::FeedbackModelReset { .. } => &self.model_resets,
            TelemetryEvent::NumericalReset { count } => {
                self.numerical_resets.fetch_add(*count as u64, Ordering::Relaxed);
                return;
            }
            TelemetryEvent::ParametersApplied { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_dropped_events(&self, count: u64) {
        self.dropped_events.fetch_add(count, Ordering::Relaxed);
    }

    /// Copy every counter at once (each load is individually atomic)
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            capture_underruns: self.capture.underruns(),
            capture_overruns: self.capture.overruns(),
            playback_underruns: self.playback.underruns(),
            playback_overruns: self.playback.overruns(),
            trimmed_samples: self.capture.trimmed_samples(),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            latency_us: self.latency_us.load(Ordering::Relaxed),
            limiter_engagements: self.limiter_engagements.load(Ordering::Relaxed),
            feedback_detections: self.feedback_detections.load(Ordering::Relaxed),
            feedback_unresolved: self.feedback_unresolved.load(Ordering::Relaxed),
            model_resets: self.model_resets.load(Ordering::Relaxed),
            numerical_resets: self.numerical_resets.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineTelemetry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    pub capture_underruns: u64,
    pub capture_overruns: u64,
    pub playback_underruns: u64,
    pub playback_overruns: u64,
    pub trimmed_samples: u64,
    pub frames_processed: u64,
    /// Last measured round-trip latency in microseconds (0 = not measured yet)
    pub latency_us: u64,
    pub limiter_engagements: u64,
    pub feedback_detections: u64,
    pub feedback_unresolved: u64,
    pub model_resets: u64,
    pub numerical_resets: u64,
    /// Events lost to a full queue or to a frame with too many feedback reports
    pub dropped_events: u64,
}

impl TelemetrySnapshot {
    pub fn latency_ms(&self) -> f32 {
        self.latency_us as f32 / 1000.0
    }
}

/// Create the event queue between processor and control thread
pub fn telemetry_channel(capacity: usize, telemetry: Arc<EngineTelemetry>) -> (TelemetrySender, TelemetryReceiver) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    (
        TelemetrySender { producer, telemetry },
        TelemetryReceiver { consumer },
    )
}

/// Audio-thread half: counts and forwards events without blocking
pub struct TelemetrySender {
    producer: rtrb::Producer<TelemetryEvent>,
    telemetry: Arc<EngineTelemetry>,
}

impl TelemetrySender {
    #[inline]
    pub fn send(&mut self, event: TelemetryEvent) {
        self.telemetry.record(&event);
        if self.producer.push(event).is_err() {
            self.telemetry.count_dropped_events(1);
        }
    }

    pub fn telemetry(&self) -> &Arc<EngineTelemetry> {
        &self.telemetry
    }
}

/// Control-thread half
pub struct TelemetryReceiver {
    consumer: rtrb::Consumer<TelemetryEvent>,
}

impl TelemetryReceiver {
    /// Pop every queued event
    pub fn drain(&mut self) -> impl Iterator<Item = TelemetryEvent> + '_ {
        std::iter::from_fn(move || self.consumer.pop().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_counted_and_forwarded() {
        let telemetry = Arc::new(EngineTelemetry::new());
        let (mut tx, mut rx) = telemetry_channel(8, Arc::clone(&telemetry));

        tx.send(TelemetryEvent::LimiterEngaged {
            peak_db: 3.0,
            gain_reduction_db: -4.0,
        });
        tx.send(TelemetryEvent::NumericalReset { count: 3 });
        tx.send(FeedbackReport::Detected {
            channel: 1,
            frequency_hz: 2500.0,
        }
        .into());

        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            TelemetryEvent::FeedbackDetected {
                channel: 1,
                frequency_hz: 2500.0
            }
        );

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.limiter_engagements, 1);
        assert_eq!(snapshot.numerical_resets, 3);
        assert_eq!(snapshot.feedback_detections, 1);
        assert_eq!(snapshot.dropped_events, 0);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let telemetry = Arc::new(EngineTelemetry::new());
        let (mut tx, mut rx) = telemetry_channel(2, Arc::clone(&telemetry));
        for generation in 0..5 {
            tx.send(TelemetryEvent::ParametersApplied { generation });
        }
        assert_eq!(rx.drain().count(), 2);
        assert_eq!(telemetry.snapshot().dropped_events, 3);
    }
}
