//! Processing engine
//!
//! - [`AudioEngine`]: control-side lifecycle, device recovery, telemetry
//! - [`Processor`]: the per-frame DSP step run inside the output callback
//! - [`parameter_bus`]: lock-free profile hand-off to the audio thread
//! - [`offline`]: the same processor over recorded audio

pub(crate) mod callback;
#[allow(clippy::module_inception)]
mod engine;
mod gc;
pub mod offline;
mod parameter_bus;
mod processor;
mod state;
mod telemetry;

pub use callback::{CaptureCallback, RenderCallback, StreamCallbacks};
pub use engine::{AudioEngine, EngineEvent, EventBus};
pub use gc::gc_handle;
pub use offline::{render, render_wav, OfflineRender};
pub use parameter_bus::{
    parameter_bus, ParameterPublisher, ParameterReader, ParameterSnapshot, MASTER_GAIN_RANGE_DB,
};
pub use processor::{Processor, ProcessorSettings, TickOutcome};
pub use state::{EngineError, EngineState, SharedState};
pub use telemetry::{
    telemetry_channel, EngineTelemetry, TelemetryEvent, TelemetryReceiver, TelemetrySender, TelemetrySnapshot,
};
