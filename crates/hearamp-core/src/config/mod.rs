//! Engine configuration file
//!
//! Everything the engine needs to start lives in one YAML document:
//!
//! ```yaml
//! audio:
//!   sample_rate: 48000
//!   frame_size: 64
//!   latency_budget_ms: 20.0
//! profile:
//!   name: default
//!   crossovers_hz: [300.0, 1000.0, 3000.0]
//!   ...
//! limiter:
//!   ceiling_db: -1.0
//! master_gain_db: 0.0
//! ```
//!
//! Missing keys take their defaults.

mod io;
mod paths;

pub use io::{load_config, read_config, save_config};
pub use paths::{config_dir, default_config_path};

use serde::{Deserialize, Serialize};

use crate::audio::StreamConfig;
use crate::dsp::{FeedbackConfig, LimiterConfig, SplitTopology};
use crate::engine::{ParameterSnapshot, ProcessorSettings};
use crate::profile::AudiogramProfile;

/// Default config file name inside [`config_dir`]
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearampConfig {
    pub audio: StreamConfig,
    pub profile: AudiogramProfile,
    pub limiter: LimiterConfig,
    pub feedback: FeedbackConfig,
    pub split_topology: SplitTopology,
    /// Master volume in dB applied after the compressor
    pub master_gain_db: f32,
}

impl Default for HearampConfig {
    fn default() -> Self {
        Self {
            audio: StreamConfig::default(),
            profile: AudiogramProfile::default(),
            limiter: LimiterConfig::default(),
            feedback: FeedbackConfig::default(),
            split_topology: SplitTopology::default(),
            master_gain_db: 0.0,
        }
    }
}

impl HearampConfig {
    /// Processor settings for a stream running at `sample_rate`
    pub fn processor_settings(&self, sample_rate: u32, frame_size: usize) -> ProcessorSettings {
        ProcessorSettings {
            sample_rate,
            frame_size,
            split_topology: self.split_topology,
            limiter: self.limiter,
            feedback: self.feedback.clone(),
        }
    }

    /// Parameter snapshot the engine starts from (unmuted)
    pub fn initial_parameters(&self) -> ParameterSnapshot {
        ParameterSnapshot::new(&self.profile, self.master_gain_db, false, self.feedback.enabled)
    }
}

/// `<config_dir>/hearamp/config.yaml`
pub fn default_path() -> std::path::PathBuf {
    default_config_path(CONFIG_FILENAME)
}
