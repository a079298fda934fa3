//! Hearamp Core - real-time hearing amplification engine

pub mod audio;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod profile;
pub mod ring_buffer;
pub mod types;

pub use types::*;
