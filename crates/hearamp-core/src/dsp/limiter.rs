//! Output safety limiter
//!
//! Last stage before the earpiece:
//!   master gain → **limiter** → clamp → output
//!
//! A stereo-linked feed-forward lookahead limiter brings peaks down to the
//! ceiling with a smooth gain envelope, then a hard clamp catches whatever
//! the envelope leaves (the attack only reaches 99 % within the lookahead,
//! and a zero lookahead has no time at all). The clamp also turns NaN and
//! infinities into silence, so `|out| <= ceiling` holds for every input.
//!
//! # Algorithm
//!
//! 1. The input goes into a delay line of `lookahead` samples.
//! 2. Its stereo peak gives a target gain (`ceiling / peak`, or 1) that is
//!    stored in a parallel ring.
//! 3. The minimum target over the lookahead window is the gain the output
//!    must have reached when that peak leaves the delay line.
//! 4. The envelope attacks toward it (99 % within the lookahead) and
//!    releases with a configurable time constant.
//! 5. The delayed sample is scaled and clamped.

use serde::{Deserialize, Serialize};

use crate::types::{db_to_linear, linear_to_db, StereoSample};

/// Ring size; bounds the lookahead (~21 ms at 48 kHz)
pub const MAX_LOOKAHEAD: usize = 1024;

/// Gain reduction beyond this counts as the limiter engaging
const ENGAGE_THRESHOLD_DB: f32 = -0.1;

/// Limiter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Output ceiling in dBFS
    pub ceiling_db: f32,
    /// Lookahead in milliseconds (fixed for the lifetime of a stream)
    pub lookahead_ms: f32,
    /// Release time constant in milliseconds
    pub release_ms: f32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            ceiling_db: -1.0,
            lookahead_ms: 1.5,
            release_ms: 100.0,
        }
    }
}

impl LimiterConfig {
    /// Lookahead in samples at a given rate, clamped to the ring size
    pub fn lookahead_samples(&self, sample_rate: u32) -> usize {
        let samples = self.lookahead_ms.max(0.0) * 0.001 * sample_rate as f32;
        if samples.is_finite() {
            (samples.round() as usize).min(MAX_LOOKAHEAD - 1)
        } else {
            0
        }
    }
}

/// Limiter activity over one frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimiterActivity {
    /// Deepest gain reduction in dB (≤ 0)
    pub min_gain_db: f32,
    /// Highest input peak in dBFS
    pub peak_db: f32,
    /// True on the frame the limiter started engaging
    pub engaged_edge: bool,
}

/// Lookahead brick-wall limiter with a hard ceiling
pub struct Limiter {
    /// Ceiling in linear amplitude
    ceiling: f32,
    lookahead: usize,

    /// `delay[channel][position]`
    delay: [[f32; MAX_LOOKAHEAD]; 2],
    target_gains: [f32; MAX_LOOKAHEAD],
    write_pos: usize,

    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,

    // Per-frame metering
    frame_min_gain: f32,
    frame_peak: f32,
    engaged: bool,
}

impl Limiter {
    pub fn new(config: &LimiterConfig, sample_rate: u32) -> Self {
        let ceiling_db = if config.ceiling_db.is_finite() {
            config.ceiling_db.min(0.0)
        } else {
            LimiterConfig::default().ceiling_db
        };
        let lookahead = config.lookahead_samples(sample_rate);

        // coeff^N = 0.01 → 99 % of the way within the lookahead
        let attack_coeff = if lookahead == 0 {
            0.0
        } else {
            (-4.605_17 / lookahead as f32).exp()
        };
        let release_samples = config.release_ms.max(1.0) * 0.001 * sample_rate as f32;
        let release_coeff = (-1.0 / release_samples).exp();

        Self {
            ceiling: db_to_linear(ceiling_db),
            lookahead,
            delay: [[0.0; MAX_LOOKAHEAD]; 2],
            target_gains: [1.0; MAX_LOOKAHEAD],
            write_pos: 0,
            gain: 1.0,
            attack_coeff,
            release_coeff,
            frame_min_gain: 1.0,
            frame_peak: 0.0,
            engaged: false,
        }
    }

    /// Ceiling in linear amplitude
    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }

    /// Delay added by the lookahead
    pub fn latency_samples(&self) -> usize {
        self.lookahead
    }

    /// Limit one sample; the result is `lookahead` samples late
    #[inline]
    pub fn process(&mut self, input: StereoSample) -> StereoSample {
        let input = if input.is_finite() { input } else { StereoSample::silence() };
        let peak = input.peak();
        self.frame_peak = self.frame_peak.max(peak);

        self.target_gains[self.write_pos] = if peak > self.ceiling { self.ceiling / peak } else { 1.0 };
        self.delay[0][self.write_pos] = input.left;
        self.delay[1][self.write_pos] = input.right;

        let target = self.window_min_gain();
        let coeff = if target < self.gain {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.gain = target + coeff * (self.gain - target);
        self.frame_min_gain = self.frame_min_gain.min(self.gain);

        let read_pos = (self.write_pos + MAX_LOOKAHEAD - self.lookahead) % MAX_LOOKAHEAD;
        let out = StereoSample::new(self.delay[0][read_pos], self.delay[1][read_pos]);
        self.write_pos = (self.write_pos + 1) % MAX_LOOKAHEAD;

        let out = if self.gain < 1.0 { out * self.gain } else { out };
        StereoSample::new(self.clamp(out.left), self.clamp(out.right))
    }

    #[inline]
    fn clamp(&self, x: f32) -> f32 {
        if x.is_finite() {
            x.clamp(-self.ceiling, self.ceiling)
        } else {
            0.0
        }
    }

    /// Minimum target gain over the lookahead window, current sample included
    #[inline]
    fn window_min_gain(&self) -> f32 {
        let mut min = 1.0_f32;
        for i in 0..=self.lookahead {
            let pos = (self.write_pos + MAX_LOOKAHEAD - i) % MAX_LOOKAHEAD;
            min = min.min(self.target_gains[pos]);
        }
        min
    }

    /// Close the metering frame
    pub fn end_frame(&mut self) -> LimiterActivity {
        let min_gain_db = linear_to_db(self.frame_min_gain.max(1e-6)).min(0.0);
        let engaged = min_gain_db < ENGAGE_THRESHOLD_DB;
        let activity = LimiterActivity {
            min_gain_db,
            peak_db: linear_to_db(self.frame_peak.max(1e-6)),
            engaged_edge: engaged && !self.engaged,
        };
        self.engaged = engaged;
        self.frame_min_gain = self.gain;
        self.frame_peak = 0.0;
        activity
    }

    pub fn reset(&mut self) {
        self.delay = [[0.0; MAX_LOOKAHEAD]; 2];
        self.target_gains = [1.0; MAX_LOOKAHEAD];
        self.write_pos = 0;
        self.gain = 1.0;
        self.frame_min_gain = 1.0;
        self.frame_peak = 0.0;
        self.engaged = false;
    }
}
