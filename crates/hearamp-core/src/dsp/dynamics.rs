//! Wide-dynamic-range compression
//!
//! One compressor per band and per ear. Each one runs the usual
//! feed-forward chain, sample by sample:
//!
//! ```text
//!  band ─► |x| ─► peak envelope ─► dB (floored) ─► static curve ─► clamp ─► smooth ─► × band
//!              (attack/release)                   (threshold,     (min/max   (dB domain)
//!                                                  ratio, knee)    gain)
//! ```
//!
//! The static curve is the textbook soft-knee compressor with make-up gain:
//! below the knee the band gets its fitting gain, above it every extra dB of
//! input yields `1/ratio` dB of output. With `ratio >= 1` the output level is
//! a non-decreasing function of input level, including inside the knee and
//! at the clamp edges.
//!
//! The wide-band [`NoiseGate`] (ahead of the split) and the [`MasterGain`]
//! volume/mute ramp live here as well.

use crate::profile::{BandParams, ProfileSnapshot};
use crate::types::{db_to_linear, linear_to_db, StereoSample, MAX_BANDS};

/// Envelope floor (-120 dBFS); keeps the dB conversion away from log(0)
pub const LEVEL_FLOOR: f32 = 1e-6;

/// Time constant of the gain smoother in milliseconds
const GAIN_SMOOTH_MS: f32 = 2.0;

/// ln(9): converts a 10 % → 90 % rise time into a one-pole coefficient
const LN_9: f32 = 2.197_224_6;

/// One-pole coefficient for a 10-90 % rise time
///
/// Zero or negative times give an instantaneous follower.
pub fn rise_time_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    let samples = time_ms * 0.001 * sample_rate;
    if samples <= 0.0 || !samples.is_finite() {
        return 0.0;
    }
    (-LN_9 / samples).exp()
}

/// One-pole coefficient for a time constant τ
fn time_constant_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    let samples = time_ms * 0.001 * sample_rate;
    if samples <= 0.0 || !samples.is_finite() {
        return 0.0;
    }
    (-1.0 / samples).exp()
}

/// Gain window and knee shared by every band of a profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveLimits {
    pub knee_db: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
}

impl CurveLimits {
    fn from_snapshot(snapshot: &ProfileSnapshot) -> Self {
        Self {
            knee_db: snapshot.knee_db.max(0.0),
            min_gain_db: snapshot.min_gain_db,
            max_gain_db: snapshot.max_gain_db,
        }
    }
}

/// Static compressor curve: gain in dB for an input level in dB
///
/// Includes the band's make-up gain and the clamp to the profile's gain window.
pub fn static_gain_db(params: &BandParams, limits: &CurveLimits, level_db: f32) -> f32 {
    let slope = 1.0 - 1.0 / params.ratio.max(1.0);
    let over = level_db - params.threshold_db;
    let knee = limits.knee_db;

    let reduction = if knee > 0.0 && over.abs() <= knee * 0.5 {
        let x = over + knee * 0.5;
        slope * x * x / (2.0 * knee)
    } else if over > 0.0 {
        slope * over
    } else {
        0.0
    };

    (params.gain_db - reduction).clamp(limits.min_gain_db, limits.max_gain_db)
}

/// Envelope and gain state of one band of one ear
#[derive(Debug, Clone)]
struct BandCompressor {
    params: BandParams,
    attack_coeff: f32,
    release_coeff: f32,
    /// Peak envelope, linear
    envelope: f32,
    /// Smoothed applied gain in dB
    gain_db: f32,
    /// `db_to_linear(gain_db)`, cached
    gain: f32,
}

impl BandCompressor {
    fn new() -> Self {
        Self {
            params: BandParams::transparent(),
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelope: 0.0,
            gain_db: 0.0,
            gain: 1.0,
        }
    }

    fn configure(&mut self, params: BandParams, sample_rate: f32) {
        self.params = params;
        self.attack_coeff = rise_time_coeff(params.attack_ms, sample_rate);
        self.release_coeff = rise_time_coeff(params.release_ms, sample_rate);
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
        self.gain_db = 0.0;
        self.gain = 1.0;
    }

    /// Returns `None` when the state went non-finite and was reset
    #[inline]
    fn process(&mut self, input: f32, limits: &CurveLimits, smooth_coeff: f32) -> Option<f32> {
        if !input.is_finite() {
            self.reset();
            return None;
        }

        let level = input.abs();
        let coeff = if level > self.envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.envelope = level + coeff * (self.envelope - level);

        let level_db = linear_to_db(self.envelope.max(LEVEL_FLOOR));
        let target_db = static_gain_db(&self.params, limits, level_db);

        let step = (target_db - self.gain_db) * (1.0 - smooth_coeff);
        if step != 0.0 {
            self.gain_db += step;
            self.gain = db_to_linear(self.gain_db);
        }

        let output = input * self.gain;
        if output.is_finite() && self.envelope.is_finite() {
            Some(output)
        } else {
            self.reset();
            None
        }
    }
}

/// Per-band, per-ear WDRC
///
/// Parameters come from a [`ProfileSnapshot`]; swapping snapshots keeps the
/// envelopes and lets the gain smoother glide to the new targets.
pub struct DynamicsProcessor {
    sample_rate: f32,
    band_count: usize,
    limits: CurveLimits,
    smooth_coeff: f32,
    /// `bands[channel][band]`
    bands: [[BandCompressor; MAX_BANDS]; 2],
    /// Non-finite resets since the last [`take_numerical_resets`](Self::take_numerical_resets)
    numerical_resets: u32,
}

impl DynamicsProcessor {
    pub fn new(sample_rate: u32, snapshot: &ProfileSnapshot) -> Self {
        let sample_rate = sample_rate as f32;
        let mut processor = Self {
            sample_rate,
            band_count: snapshot.band_count,
            limits: CurveLimits::from_snapshot(snapshot),
            smooth_coeff: time_constant_coeff(GAIN_SMOOTH_MS, sample_rate),
            bands: std::array::from_fn(|_| std::array::from_fn(|_| BandCompressor::new())),
            numerical_resets: 0,
        };
        processor.apply_snapshot(snapshot);
        processor
    }

    /// Take new band settings (allocation-free)
    pub fn apply_snapshot(&mut self, snapshot: &ProfileSnapshot) {
        self.band_count = snapshot.band_count.min(MAX_BANDS);
        self.limits = CurveLimits::from_snapshot(snapshot);
        for (channel, compressors) in self.bands.iter_mut().enumerate() {
            for (compressor, params) in compressors.iter_mut().zip(snapshot.channel_bands(channel)) {
                compressor.configure(*params, self.sample_rate);
            }
        }
    }

    /// Compress every active band in place
    #[inline]
    pub fn process(&mut self, bands: &mut [StereoSample; MAX_BANDS]) {
        for (band_index, band) in bands[..self.band_count].iter_mut().enumerate() {
            for channel in 0..2 {
                let value = band.channel_mut(channel);
                match self.bands[channel][band_index].process(*value, &self.limits, self.smooth_coeff) {
                    Some(out) => *value = out,
                    None => {
                        *value = 0.0;
                        self.numerical_resets += 1;
                    }
                }
            }
        }
    }

    /// Current smoothed gain in dB
    pub fn gain_db(&self, channel: usize, band: usize) -> f32 {
        self.bands[channel.min(1)][band.min(MAX_BANDS - 1)].gain_db
    }

    /// Number of band/ear resets since the last call
    pub fn take_numerical_resets(&mut self) -> u32 {
        std::mem::take(&mut self.numerical_resets)
    }

    pub fn reset(&mut self) {
        for compressor in self.bands.iter_mut().flatten() {
            compressor.reset();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Noise gate
// ────────────────────────────────────────────────────────────────────────────

/// Close threshold sits this far below the open threshold
const GATE_HYSTERESIS_DB: f32 = 6.0;
const GATE_ATTACK_MS: f32 = 1.0;
const GATE_RELEASE_MS: f32 = 80.0;
/// Peak detector decay for the gate's level estimate
const GATE_DETECTOR_MS: f32 = 10.0;

/// Wide-band downward gate with hysteresis, one state per ear
///
/// Quiets the microphone hiss that the band gains would otherwise lift.
pub struct NoiseGate {
    open_threshold: f32,
    close_threshold: f32,
    enabled: bool,
    open: [bool; 2],
    level: [f32; 2],
    gain: [f32; 2],
    attack_coeff: f32,
    release_coeff: f32,
    detector_coeff: f32,
}

impl NoiseGate {
    pub fn new(sample_rate: u32, threshold_db: Option<f32>) -> Self {
        let sample_rate = sample_rate as f32;
        let mut gate = Self {
            open_threshold: 0.0,
            close_threshold: 0.0,
            enabled: false,
            open: [true; 2],
            level: [0.0; 2],
            gain: [1.0; 2],
            attack_coeff: time_constant_coeff(GATE_ATTACK_MS, sample_rate),
            release_coeff: time_constant_coeff(GATE_RELEASE_MS, sample_rate),
            detector_coeff: time_constant_coeff(GATE_DETECTOR_MS, sample_rate),
        };
        gate.set_threshold(threshold_db);
        gate
    }

    /// `None` disables the gate (it then ramps open and becomes a pass-through)
    pub fn set_threshold(&mut self, threshold_db: Option<f32>) {
        match threshold_db {
            Some(db) => {
                self.enabled = true;
                self.open_threshold = db_to_linear(db);
                self.close_threshold = db_to_linear(db - GATE_HYSTERESIS_DB);
            }
            None => self.enabled = false,
        }
    }

    pub fn is_open(&self, channel: usize) -> bool {
        self.open[channel.min(1)]
    }

    #[inline]
    pub fn process(&mut self, sample: StereoSample) -> StereoSample {
        let mut out = sample;
        for channel in 0..2 {
            let x = sample.channel(channel);
            let target = if self.enabled {
                let level = x.abs();
                self.level[channel] = if level > self.level[channel] {
                    level
                } else {
                    level + self.detector_coeff * (self.level[channel] - level)
                };
                if self.open[channel] && self.level[channel] < self.close_threshold {
                    self.open[channel] = false;
                } else if !self.open[channel] && self.level[channel] >= self.open_threshold {
                    self.open[channel] = true;
                }
                if self.open[channel] {
                    1.0
                } else {
                    0.0
                }
            } else {
                self.open[channel] = true;
                1.0
            };

            let gain = &mut self.gain[channel];
            if *gain != target {
                let coeff = if target > *gain {
                    self.attack_coeff
                } else {
                    self.release_coeff
                };
                *gain = target + coeff * (*gain - target);
                if (*gain - target).abs() < 1e-6 {
                    *gain = target;
                }
            }
            *out.channel_mut(channel) = x * *gain;
        }
        out
    }

    pub fn reset(&mut self) {
        self.open = [true; 2];
        self.level = [0.0; 2];
        self.gain = [1.0; 2];
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Master gain
// ────────────────────────────────────────────────────────────────────────────

/// Ramp time constant for volume and mute changes
const MASTER_RAMP_MS: f32 = 10.0;

/// Master volume and mute with a click-free ramp
pub struct MasterGain {
    current: f32,
    target: f32,
    coeff: f32,
}

impl MasterGain {
    pub fn new(sample_rate: u32, gain_db: f32, muted: bool) -> Self {
        let target = Self::target_for(gain_db, muted);
        Self {
            current: target,
            target,
            coeff: time_constant_coeff(MASTER_RAMP_MS, sample_rate as f32),
        }
    }

    fn target_for(gain_db: f32, muted: bool) -> f32 {
        if muted || !gain_db.is_finite() {
            0.0
        } else {
            db_to_linear(gain_db)
        }
    }

    pub fn set(&mut self, gain_db: f32, muted: bool) {
        self.target = Self::target_for(gain_db, muted);
    }

    /// Linear gain currently applied
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn process(&mut self, sample: StereoSample) -> StereoSample {
        if self.current != self.target {
            self.current = self.target + self.coeff * (self.current - self.target);
            if (self.current - self.target).abs() < 1e-6 {
                self.current = self.target;
            }
        }
        sample * self.current
    }
}
