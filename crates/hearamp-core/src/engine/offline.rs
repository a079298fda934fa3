//! Offline rendering
//!
//! Runs the real-time [`Processor`] over recorded audio, frame by frame,
//! without any device. Useful for auditioning a fitting on a recording and
//! for regression tests on the whole chain.
//!
//! The limiter lookahead is compensated by padding the tail and trimming
//! the head, so the rendered buffer lines up sample for sample with the
//! input.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use basedrop::Collector;

use crate::config::HearampConfig;
use crate::engine::parameter_bus::parameter_bus;
use crate::engine::processor::Processor;
use crate::engine::state::EngineError;
use crate::engine::telemetry::{telemetry_channel, EngineTelemetry, TelemetryEvent, TelemetrySnapshot};
use crate::types::StereoSample;

/// Per-frame event headroom; the queue is drained after every frame
const EVENT_CAPACITY: usize = 256;

/// Result of an offline render
#[derive(Debug, Clone)]
pub struct OfflineRender {
    /// Processed audio, aligned with the input and of the same length
    pub samples: Vec<StereoSample>,
    pub telemetry: TelemetrySnapshot,
    /// Every telemetry event in the order it was raised
    pub events: Vec<TelemetryEvent>,
}

/// Process `input` at `sample_rate` with the fitting in `config`
pub fn render(config: &HearampConfig, sample_rate: u32, input: &[StereoSample]) -> Result<OfflineRender, EngineError> {
    config.profile.validate()?;
    config.profile.validate_for_rate(sample_rate)?;

    let mut collector = Collector::new();
    let frame_size = config.audio.effective_frame_size();
    let settings = config.processor_settings(sample_rate, frame_size);
    let (publisher, reader) = parameter_bus(&collector.handle(), config.initial_parameters());
    let telemetry = Arc::new(EngineTelemetry::new());
    let (sender, mut receiver) = telemetry_channel(EVENT_CAPACITY, Arc::clone(&telemetry));
    let mut processor = Processor::new(&settings, reader, sender);

    let latency = processor.latency_samples();
    let total = input.len() + latency;
    let mut rendered = Vec::with_capacity(total);
    let mut events = Vec::new();
    let mut in_frame = vec![StereoSample::silence(); frame_size];
    let mut out_frame = vec![StereoSample::silence(); frame_size];

    let mut position = 0;
    while position < total {
        let len = (total - position).min(frame_size);
        for (offset, slot) in in_frame[..len].iter_mut().enumerate() {
            *slot = input.get(position + offset).copied().unwrap_or_default();
        }
        processor.process_block(&in_frame[..len], &mut out_frame[..len]);
        rendered.extend_from_slice(&out_frame[..len]);
        events.extend(receiver.drain());
        position += len;
    }
    rendered.drain(..latency.min(rendered.len()));

    drop(processor);
    drop(publisher);
    collector.collect();

    log::debug!(
        "Rendered {} samples at {}Hz ({} events)",
        rendered.len(),
        sample_rate,
        events.len()
    );
    Ok(OfflineRender {
        samples: rendered,
        telemetry: telemetry.snapshot(),
        events,
    })
}

/// Render a WAV file into another WAV file
///
/// Accepts 16/24/32-bit integer or 32-bit float input with any channel
/// count (mono is duplicated, channels beyond two are ignored). The output
/// is stereo in the input's sample format.
pub fn render_wav(config: &HearampConfig, input_path: &Path, output_path: &Path) -> Result<OfflineRender> {
    let mut reader =
        hound::WavReader::open(input_path).with_context(|| format!("Failed to open WAV file: {:?}", input_path))?;
    let spec = reader.spec();
    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16 | 24 | 32) | (hound::SampleFormat::Float, 32) => {}
        (format, bits) => bail!("Unsupported WAV format: {:?} {}-bit", format, bits),
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>(),
        hound::SampleFormat::Int => {
            let scale = 1.0 / int_full_scale(spec.bits_per_sample);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
        }
    }
    .with_context(|| format!("Failed to decode WAV file: {:?}", input_path))?;

    let channels = spec.channels.max(1) as usize;
    let input: Vec<StereoSample> = interleaved
        .chunks_exact(channels)
        .map(|frame| match frame {
            [mono] => StereoSample::mono(*mono),
            [left, right, ..] => StereoSample::new(*left, *right),
            [] => StereoSample::silence(),
        })
        .collect();
    log::info!(
        "Rendering {:?}: {} frames, {} channel(s), {}Hz",
        input_path,
        input.len(),
        channels,
        spec.sample_rate
    );

    let rendered = render(config, spec.sample_rate, &input)?;

    let out_spec = hound::WavSpec {
        channels: 2,
        ..spec
    };
    let mut writer = hound::WavWriter::create(output_path, out_spec)
        .with_context(|| format!("Failed to create WAV file: {:?}", output_path))?;
    let full_scale = int_full_scale(spec.bits_per_sample);
    for sample in &rendered.samples {
        for value in [sample.left, sample.right] {
            match spec.sample_format {
                hound::SampleFormat::Float => writer.write_sample(value)?,
                hound::SampleFormat::Int => {
                    let quantized = (value * full_scale).round().clamp(-full_scale, full_scale - 1.0);
                    writer.write_sample(quantized as i32)?
                }
            }
        }
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize WAV file: {:?}", output_path))?;

    log::info!("Wrote {:?}", output_path);
    Ok(rendered)
}

fn int_full_scale(bits: u16) -> f32 {
    (1u64 << (bits.clamp(2, 32) - 1)) as f32
}
