//! CPAL audio backend
//!
//! Opens the microphone and the earpiece as two independent CPAL streams:
//!
//! ```text
//!  ┌──────────────────┐   push    ┌──────────────────┐
//!  │  Input stream    │──────────►│  Capture queue   │
//!  │  (CPAL thread)   │           │ (lock-free SPSC) │
//!  └──────────────────┘           └────────┬─────────┘
//!                                          │ tick()
//!  ┌──────────────────┐           ┌────────▼─────────┐
//!  │  Output stream   │◄──────────│    Processor     │
//!  │  (CPAL thread)   │  frames   │ (owned by output)│
//!  └──────────────────┘           └──────────────────┘
//! ```
//!
//! The output stream owns the processor, so processing is paced by the
//! earpiece clock. Stream errors are logged and classified into the shared
//! [`DeviceStatus`] for the control thread.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SupportedBufferSize, SupportedStreamConfig, SupportedStreamConfigRange};

use super::backend::{AudioBackend, DeviceFault, DeviceStatus, NegotiatedConfig, StreamHandle};
use super::config::StreamConfig;
use super::device::{resolve_device, Direction};
use super::error::{AudioError, AudioResult};
use crate::engine::callback::StreamCallbacks;

/// Devices and formats picked by the last `negotiate`
struct Negotiated {
    input: cpal::Device,
    output: cpal::Device,
    input_config: cpal::StreamConfig,
    output_config: cpal::StreamConfig,
}

/// Backend for the platform's native audio hosts
#[derive(Default)]
pub struct CpalBackend {
    pending: Option<Negotiated>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Running input + output streams; dropping this closes both
pub struct CpalStream {
    input: cpal::Stream,
    output: cpal::Stream,
}

impl StreamHandle for CpalStream {
    fn play(&self) -> AudioResult<()> {
        self.input
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        self.output
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }

    fn pause(&self) -> AudioResult<()> {
        self.output
            .pause()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        self.input
            .pause()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }
}

impl AudioBackend for CpalBackend {
    type Stream = CpalStream;

    fn negotiate(&mut self, config: &StreamConfig) -> AudioResult<NegotiatedConfig> {
        let input = resolve_device(config.input_device.as_ref(), Direction::Input)?;
        let output = resolve_device(config.output_device.as_ref(), Direction::Output)?;
        let input_name = input.name().unwrap_or_else(|_| "Unknown".to_string());
        let output_name = output.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using input device: {}, output device: {}", input_name, output_name);

        let output_ranges: Vec<_> = output
            .supported_output_configs()
            .map_err(|e| classify_config_error(&output_name, e))?
            .collect();
        let output_supported = choose_config(&output_ranges, config.sample_rate, "output")?;
        let sample_rate = output_supported.sample_rate().0;

        // The input must run at whatever rate the earpiece settled on
        let input_ranges: Vec<_> = input
            .supported_input_configs()
            .map_err(|e| classify_config_error(&input_name, e))?
            .collect();
        let input_supported = choose_config(&input_ranges, sample_rate, "input")?;
        if input_supported.sample_rate().0 != sample_rate {
            return Err(AudioError::SampleRateMismatch {
                input: input_supported.sample_rate().0,
                output: sample_rate,
            });
        }

        let frame_size = config.effective_frame_size();
        let requested = config.buffer_size.as_frames(frame_size);
        let input_buffer = fit_buffer_size(requested, input_supported.buffer_size());
        let output_buffer = fit_buffer_size(requested, output_supported.buffer_size());

        let input_config = cpal::StreamConfig {
            channels: input_supported.channels(),
            sample_rate: input_supported.sample_rate(),
            buffer_size: buffer_size_to_cpal(input_buffer),
        };
        let output_config = cpal::StreamConfig {
            channels: output_supported.channels(),
            sample_rate: output_supported.sample_rate(),
            buffer_size: buffer_size_to_cpal(output_buffer),
        };

        let negotiated = NegotiatedConfig {
            sample_rate,
            frame_size,
            input_channels: input_config.channels,
            output_channels: output_config.channels,
            input_buffer_frames: input_buffer,
            output_buffer_frames: output_buffer,
            queue_depth: config.queue_depth,
            input_device: input_name,
            output_device: output_name,
        };
        log::info!(
            "Negotiated {}Hz, {} in / {} out channels, buffers {:?}/{:?} frames",
            negotiated.sample_rate,
            negotiated.input_channels,
            negotiated.output_channels,
            negotiated.input_buffer_frames,
            negotiated.output_buffer_frames
        );

        self.pending = Some(Negotiated {
            input,
            output,
            input_config,
            output_config,
        });
        Ok(negotiated)
    }

    fn open(
        &mut self,
        negotiated: &NegotiatedConfig,
        callbacks: StreamCallbacks,
        status: Arc<DeviceStatus>,
    ) -> AudioResult<CpalStream> {
        let devices = self
            .pending
            .take()
            .ok_or_else(|| AudioError::ConfigError("stream opened before negotiation".to_string()))?;
        let StreamCallbacks { mut capture, mut render } = callbacks;

        let input_channels = negotiated.input_channels as usize;
        let input_status = Arc::clone(&status);
        let input = devices
            .input
            .build_input_stream(
                &devices.input_config,
                move |data: &[f32], info: &cpal::InputCallbackInfo| {
                    let ts = info.timestamp();
                    capture.on_input(data, input_channels, ts.callback.duration_since(&ts.capture));
                },
                move |err| report_stream_error(&input_status, "input", err),
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        let output_channels = negotiated.output_channels as usize;
        let output = devices
            .output
            .build_output_stream(
                &devices.output_config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let ts = info.timestamp();
                    render.on_output(data, output_channels, ts.playback.duration_since(&ts.callback));
                },
                move |err| report_stream_error(&status, "output", err),
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        log::info!(
            "Audio streams built ({} -> {})",
            negotiated.input_device,
            negotiated.output_device
        );
        Ok(CpalStream { input, output })
    }
}

/// Log a platform stream error and record its class
fn report_stream_error(status: &DeviceStatus, side: &str, err: cpal::StreamError) {
    log::error!("Audio {} stream error: {}", side, err);
    status.report(stream_fault(&err));
}

/// Running-stream errors are all worth a reconnect
///
/// Hosts surface recoverable conditions (ALSA xruns, route changes) as
/// backend-specific errors. Reopening with an unusable configuration fails
/// the engine, and `ReconnectPolicy::max_attempts` bounds the retries.
fn stream_fault(err: &cpal::StreamError) -> DeviceFault {
    match err {
        cpal::StreamError::DeviceNotAvailable => DeviceFault::Transient,
        cpal::StreamError::BackendSpecific { .. } => DeviceFault::Transient,
    }
}

fn classify_config_error(device: &str, err: cpal::SupportedStreamConfigsError) -> AudioError {
    match err {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => AudioError::DeviceUnavailable(device.to_string()),
        other => AudioError::ConfigError(other.to_string()),
    }
}

/// Best f32 configuration for a target rate
///
/// Preference: stereo at the target rate, any channel count at the target
/// rate, then the highest rate the device offers (with a warning).
fn choose_config(
    ranges: &[SupportedStreamConfigRange],
    target_sample_rate: u32,
    side: &str,
) -> AudioResult<SupportedStreamConfig> {
    if ranges.is_empty() {
        return Err(AudioError::ConfigError(format!("No supported {} configurations", side)));
    }

    let float: Vec<&SupportedStreamConfigRange> = ranges
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();
    if float.is_empty() {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} device offers no f32 format ({:?})",
            side,
            ranges[0].sample_format()
        )));
    }

    let in_range = |c: &&SupportedStreamConfigRange| {
        target_sample_rate >= c.min_sample_rate().0 && target_sample_rate <= c.max_sample_rate().0
    };

    if let Some(best) = float
        .iter()
        .copied()
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| float.iter().copied().find(in_range))
    {
        return Ok(best.clone().with_sample_rate(cpal::SampleRate(target_sample_rate)));
    }

    // Device doesn't support the requested rate - use its max supported rate
    let best = float
        .iter()
        .copied()
        .max_by_key(|c| (c.channels().min(2), c.max_sample_rate().0))
        .ok_or_else(|| AudioError::ConfigError(format!("No suitable {} configuration found", side)))?;
    let fallback = best.max_sample_rate();
    log::warn!(
        "Audio {} device doesn't support {}Hz, falling back to {}Hz",
        side,
        target_sample_rate,
        fallback.0
    );
    Ok(best.clone().with_sample_rate(fallback))
}

/// Clamp a requested period into the device's supported range
fn fit_buffer_size(requested: Option<u32>, supported: &SupportedBufferSize) -> Option<u32> {
    let frames = requested?;
    Some(match supported {
        SupportedBufferSize::Range { min, max } => frames.clamp(*min, (*max).max(*min)),
        SupportedBufferSize::Unknown => frames,
    })
}

fn buffer_size_to_cpal(frames: Option<u32>) -> cpal::BufferSize {
    match frames {
        Some(frames) => cpal::BufferSize::Fixed(frames),
        None => cpal::BufferSize::Default,
    }
}
