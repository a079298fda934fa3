//! Audio device layer
//!
//! Device enumeration, stream negotiation and the CPAL backend. The engine
//! only sees the [`AudioBackend`] trait, so tests can drive it without
//! hardware.

mod backend;
mod config;
mod cpal_backend;
mod device;
mod error;

pub use backend::{AudioBackend, DeviceFault, DeviceStatus, NegotiatedConfig, StreamHandle};
pub use config::{
    BufferSize, DeviceId, ReconnectPolicy, StreamConfig, DEFAULT_BUFFER_SIZE, DEFAULT_FRAME_SIZE,
    DEFAULT_LATENCY_BUDGET_MS, MIN_QUEUE_DEPTH,
};
pub use cpal_backend::{CpalBackend, CpalStream};
pub use device::{default_device, find_device_by_id, get_devices, resolve_device, AudioDevice, Direction};
pub use error::{AudioError, AudioResult};
