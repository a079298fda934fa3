//! Stream configuration
//!
//! What the control side asks the platform for. Everything here is fixed at
//! stream-open time; changing it means tearing the streams down and opening
//! new ones.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MAX_FRAME_SIZE, SAMPLE_RATE};

/// Default processing block in samples (~1.3 ms at 48 kHz)
pub const DEFAULT_FRAME_SIZE: usize = 64;

/// Device buffer assumed when the platform does not report one (frames)
pub const DEFAULT_BUFFER_SIZE: u32 = 128;

/// Smallest capture backlog, in frames, the engine will run with
pub const MIN_QUEUE_DEPTH: usize = 2;

/// Default end-to-end latency budget
pub const DEFAULT_LATENCY_BUDGET_MS: f32 = 20.0;

/// Preferred device buffer size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BufferSize {
    /// Let the system choose the buffer size
    Default,
    /// Request a specific buffer size in frames (may be adjusted by the system)
    Fixed(u32),
    /// One processing frame per device period
    #[default]
    LowLatency,
}

impl BufferSize {
    /// Requested frames, or None for the system default
    pub fn as_frames(&self, frame_size: usize) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some((*frames).clamp(16, MAX_FRAME_SIZE as u32)),
            BufferSize::LowLatency => Some(frame_size as u32),
        }
    }

    /// Latency of one device buffer in milliseconds
    pub fn latency_ms(&self, frame_size: usize, sample_rate: u32) -> Option<f32> {
        self.as_frames(frame_size)
            .map(|frames| (frames as f32 / sample_rate as f32) * 1000.0)
    }
}

/// Audio device identifier
///
/// Includes both the device name and the host backend (JACK, ALSA, etc.)
/// so a device can be picked from a non-default host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device name as reported by the system
    pub name: String,
    /// Audio host identifier (e.g., "Jack", "Alsa", "CoreAudio")
    /// If None, uses the default host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }

    pub fn with_host(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: Some(host.to_string()),
        }
    }

    /// Display label including the host if set
    pub fn display_label(&self) -> String {
        match &self.host {
            Some(host) => format!("[{}] {}", host, self.name),
            None => self.name.clone(),
        }
    }
}

/// Exponential backoff used to reacquire a lost device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Give up and fail after this many attempts (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Requested stream parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Requested sample rate; the device may grant another
    pub sample_rate: u32,

    /// Processing block size in samples
    pub frame_size: usize,

    /// Preferred device buffer size
    pub buffer_size: BufferSize,

    /// Microphone device (None = system default)
    pub input_device: Option<DeviceId>,

    /// Earpiece device (None = system default)
    pub output_device: Option<DeviceId>,

    /// Upper bound on estimated end-to-end latency
    pub latency_budget_ms: f32,

    /// Capture backlog bound in frames
    pub queue_depth: usize,

    pub reconnect: ReconnectPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            buffer_size: BufferSize::default(),
            input_device: None,
            output_device: None,
            latency_budget_ms: DEFAULT_LATENCY_BUDGET_MS,
            queue_depth: 4,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl StreamConfig {
    /// Set the microphone device
    pub fn with_input_device(mut self, device: DeviceId) -> Self {
        self.input_device = Some(device);
        self
    }

    /// Set the earpiece device
    pub fn with_output_device(mut self, device: DeviceId) -> Self {
        self.output_device = Some(device);
        self
    }

    /// Set the preferred buffer size
    pub fn with_buffer_size(mut self, buffer_size: BufferSize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Frame size clamped to what the queues and scratch buffers support
    pub fn effective_frame_size(&self) -> usize {
        self.frame_size.clamp(16, MAX_FRAME_SIZE / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_frames() {
        assert_eq!(BufferSize::Default.as_frames(64), None);
        assert_eq!(BufferSize::Fixed(256).as_frames(64), Some(256));
        assert_eq!(BufferSize::Fixed(1).as_frames(64), Some(16));
        assert_eq!(BufferSize::LowLatency.as_frames(64), Some(64));
        let ms = BufferSize::Fixed(480).latency_ms(64, 48000).unwrap();
        assert!((ms - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(7), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(100), Duration::from_millis(5000));
        assert!(!policy.exhausted(1000));

        let bounded = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }

    #[test]
    fn test_device_id_label() {
        assert_eq!(DeviceId::new("Headset").display_label(), "Headset");
        assert_eq!(DeviceId::with_host("Headset", "Jack").display_label(), "[Jack] Headset");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: StreamConfig = serde_yaml::from_str("frame_size: 128\nqueue_depth: 2\n").unwrap();
        assert_eq!(config.frame_size, 128);
        assert_eq!(config.queue_depth, 2);
        assert_eq!(config.sample_rate, SAMPLE_RATE);
        assert_eq!(config.buffer_size, BufferSize::LowLatency);
        assert!(config.output_device.is_none());
    }
}
