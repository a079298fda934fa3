//! Audio backend error types

use thiserror::Error;

/// Errors that can occur while negotiating or running device streams
#[derive(Error, Debug)]
pub enum AudioError {
    /// No audio devices available
    #[error("No audio {0} devices found")]
    NoDevices(&'static str),

    /// Failed to get default device
    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    /// Device not found
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Device went away (unplugged, route change)
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Failed to get device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/pause stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Stream error raised by the platform while running
    #[error("Audio stream error: {0}")]
    StreamError(String),

    /// Unsupported sample format
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Input and output devices run at different rates
    #[error("Sample rate mismatch: input={input}Hz, output={output}Hz")]
    SampleRateMismatch { input: u32, output: u32 },

    /// Even the minimum queue depth does not fit the latency budget
    #[error("Estimated latency {estimated_ms:.1}ms exceeds budget of {budget_ms:.1}ms")]
    LatencyBudget { estimated_ms: f32, budget_ms: f32 },
}

impl AudioError {
    /// Whether retrying the same configuration later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AudioError::DeviceUnavailable(_)
                | AudioError::NoDefaultDevice(_)
                | AudioError::DeviceNotFound(_)
                | AudioError::NoDevices(_)
        )
    }
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AudioError::DeviceUnavailable("usb".into()).is_transient());
        assert!(AudioError::DeviceNotFound("Headset".into()).is_transient());
        assert!(!AudioError::UnsupportedFormat("I16".into()).is_transient());
        assert!(!AudioError::LatencyBudget {
            estimated_ms: 30.0,
            budget_ms: 20.0
        }
        .is_transient());
    }

    #[test]
    fn test_latency_budget_message() {
        let err = AudioError::LatencyBudget {
            estimated_ms: 31.3,
            budget_ms: 20.0,
        };
        assert_eq!(err.to_string(), "Estimated latency 31.3ms exceeds budget of 20.0ms");
    }
}
