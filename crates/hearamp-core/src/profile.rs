//! Hearing-loss profiles
//!
//! An [`AudiogramProfile`] is the control-side description of a fitting:
//! crossover frequencies plus, for every band and each ear, the compressor
//! settings (threshold, ratio, gain, attack, release). It is what gets
//! edited, saved as YAML and validated.
//!
//! The audio thread never sees this type. Publishing converts a validated
//! profile into a [`ProfileSnapshot`], a fixed-size `Copy` value with no
//! heap storage, so the processor can read it without touching the
//! allocator.
//!
//! ```text
//!  Audiogram (dB HL per test frequency)
//!        │ prescribe()
//!        ▼
//!  AudiogramProfile ──validate()──► ProfileSnapshot ──► ParameterBus
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MAX_BANDS;

/// Fewest bands a profile may have
pub const MIN_BANDS: usize = 2;

/// Lowest allowed crossover frequency in Hz
pub const MIN_CROSSOVER_HZ: f32 = 20.0;

/// Crossovers must stay below this fraction of the sample rate
pub const MAX_CROSSOVER_FRACTION: f32 = 0.45;

/// Standard pure-tone audiometry frequencies in Hz
pub const AUDIOGRAM_FREQUENCIES: [f32; 10] = [
    250.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0, 3000.0, 4000.0, 6000.0, 8000.0,
];

/// Which ear a set of parameters applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ear {
    Left,
    Right,
}

impl Ear {
    pub const BOTH: [Ear; 2] = [Ear::Left, Ear::Right];

    /// Channel index in a [`crate::types::StereoSample`]
    pub fn channel(self) -> usize {
        match self {
            Ear::Left => 0,
            Ear::Right => 1,
        }
    }
}

impl std::fmt::Display for Ear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ear::Left => write!(f, "left"),
            Ear::Right => write!(f, "right"),
        }
    }
}

/// Reasons a profile is refused before publication
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    #[error("Profile has {count} bands, supported range is {}..={}", MIN_BANDS, MAX_BANDS)]
    BandCount { count: usize },

    #[error("Profile has {actual} bands but the running stream was opened with {expected}")]
    BandCountMismatch { expected: usize, actual: usize },

    #[error("{ear} ear has {actual} bands, expected {expected}")]
    EarBandCount { ear: Ear, expected: usize, actual: usize },

    #[error("Crossover {index} ({hz} Hz) must be finite and above the previous crossover")]
    CrossoverOrder { index: usize, hz: f32 },

    #[error("Crossover {index} ({hz} Hz) is outside {}..{max} Hz", MIN_CROSSOVER_HZ)]
    CrossoverRange { index: usize, hz: f32, max: f32 },

    #[error("{ear} ear band {band}: {field} = {value} is out of range")]
    BandValue {
        ear: Ear,
        band: usize,
        field: &'static str,
        value: f32,
    },

    #[error("Profile {field} = {value} is out of range")]
    ProfileValue { field: &'static str, value: f32 },
}

/// Compressor settings for one band of one ear
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandParams {
    /// Compression threshold in dBFS
    pub threshold_db: f32,
    /// Compression ratio above threshold (1.0 = linear)
    pub ratio: f32,
    /// Make-up gain in dB applied below threshold
    pub gain_db: f32,
    /// Attack time in milliseconds (10 % → 90 %)
    pub attack_ms: f32,
    /// Release time in milliseconds (90 % → 10 %)
    pub release_ms: f32,
}

impl BandParams {
    pub const fn new(threshold_db: f32, ratio: f32, gain_db: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            threshold_db,
            ratio,
            gain_db,
            attack_ms,
            release_ms,
        }
    }

    /// Unity gain, no compression
    pub const fn transparent() -> Self {
        Self::new(0.0, 1.0, 0.0, 5.0, 50.0)
    }
}

impl Default for BandParams {
    fn default() -> Self {
        Self::transparent()
    }
}

/// A complete fitting: band layout plus per-ear compressor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudiogramProfile {
    /// Display name
    pub name: String,
    /// Crossover frequencies in Hz, ascending. Band count = len + 1.
    pub crossovers_hz: Vec<f32>,
    /// Left-ear band settings, one per band
    pub left: Vec<BandParams>,
    /// Right-ear band settings, one per band
    pub right: Vec<BandParams>,
    /// Soft-knee width in dB (0 = hard knee)
    pub knee_db: f32,
    /// Lowest gain the compressor may apply, in dB
    pub min_gain_db: f32,
    /// Highest gain the compressor may apply, in dB
    pub max_gain_db: f32,
    /// Noise gate threshold in dBFS, `None` disables the gate
    pub gate_threshold_db: Option<f32>,
}

impl Default for AudiogramProfile {
    /// The 4-band fitting shipped with the device
    fn default() -> Self {
        let bands = vec![
            BandParams::new(-50.0, 2.0, 5.0, 5.0, 50.0),
            BandParams::new(-45.0, 2.5, 5.0, 5.0, 50.0),
            BandParams::new(-40.0, 3.0, 5.0, 5.0, 50.0),
            BandParams::new(-35.0, 3.5, 5.0, 5.0, 50.0),
        ];
        Self {
            name: "Default".to_string(),
            crossovers_hz: vec![300.0, 1000.0, 3000.0],
            left: bands.clone(),
            right: bands,
            knee_db: 6.0,
            min_gain_db: -24.0,
            max_gain_db: 40.0,
            gate_threshold_db: None,
        }
    }
}

impl AudiogramProfile {
    /// Same band settings for both ears
    pub fn symmetric(name: impl Into<String>, crossovers_hz: Vec<f32>, bands: Vec<BandParams>) -> Self {
        Self {
            name: name.into(),
            crossovers_hz,
            left: bands.clone(),
            right: bands,
            ..Default::default()
        }
    }

    /// A profile that leaves the signal untouched (0 dB, 1:1, no gate)
    pub fn transparent(crossovers_hz: Vec<f32>) -> Self {
        let bands = vec![BandParams::transparent(); crossovers_hz.len() + 1];
        Self {
            knee_db: 0.0,
            ..Self::symmetric("Transparent", crossovers_hz, bands)
        }
    }

    /// Number of bands described by the crossover list
    pub fn band_count(&self) -> usize {
        self.crossovers_hz.len() + 1
    }

    /// Band settings for one ear
    pub fn ear(&self, ear: Ear) -> &[BandParams] {
        match ear {
            Ear::Left => &self.left,
            Ear::Right => &self.right,
        }
    }

    /// Mutable band settings for one ear
    pub fn ear_mut(&mut self, ear: Ear) -> &mut Vec<BandParams> {
        match ear {
            Ear::Left => &mut self.left,
            Ear::Right => &mut self.right,
        }
    }

    /// Structural and range checks that do not depend on the stream
    pub fn validate(&self) -> Result<(), ProfileError> {
        let count = self.band_count();
        if !(MIN_BANDS..=MAX_BANDS).contains(&count) {
            return Err(ProfileError::BandCount { count });
        }

        let mut previous = 0.0_f32;
        for (index, &hz) in self.crossovers_hz.iter().enumerate() {
            if !hz.is_finite() || hz <= previous {
                return Err(ProfileError::CrossoverOrder { index, hz });
            }
            if hz < MIN_CROSSOVER_HZ {
                return Err(ProfileError::CrossoverRange {
                    index,
                    hz,
                    max: f32::INFINITY,
                });
            }
            previous = hz;
        }

        check_profile_value("knee_db", self.knee_db, 0.0, 24.0)?;
        check_profile_value("min_gain_db", self.min_gain_db, -60.0, 0.0)?;
        check_profile_value("max_gain_db", self.max_gain_db, 0.0, 60.0)?;
        if let Some(gate) = self.gate_threshold_db {
            check_profile_value("gate_threshold_db", gate, -120.0, 0.0)?;
        }

        for ear in Ear::BOTH {
            let bands = self.ear(ear);
            if bands.len() != count {
                return Err(ProfileError::EarBandCount {
                    ear,
                    expected: count,
                    actual: bands.len(),
                });
            }
            for (band, params) in bands.iter().enumerate() {
                let check = |field: &'static str, value: f32, min: f32, max: f32| {
                    if value.is_finite() && value >= min && value <= max {
                        Ok(())
                    } else {
                        Err(ProfileError::BandValue {
                            ear,
                            band,
                            field,
                            value,
                        })
                    }
                };
                check("threshold_db", params.threshold_db, -120.0, 0.0)?;
                check("ratio", params.ratio, 1.0, 100.0)?;
                check("gain_db", params.gain_db, self.min_gain_db, self.max_gain_db)?;
                check("attack_ms", params.attack_ms, 0.1, 5000.0)?;
                check("release_ms", params.release_ms, 0.1, 5000.0)?;
            }
        }

        Ok(())
    }

    /// [`validate`](Self::validate) plus the crossover ceiling for a sample rate
    pub fn validate_for_rate(&self, sample_rate: u32) -> Result<(), ProfileError> {
        self.validate()?;
        let max = sample_rate as f32 * MAX_CROSSOVER_FRACTION;
        for (index, &hz) in self.crossovers_hz.iter().enumerate() {
            if hz >= max {
                return Err(ProfileError::CrossoverRange { index, hz, max });
            }
        }
        Ok(())
    }

    /// Derive a fitting from an audiogram
    ///
    /// Each band is evaluated at its geometric centre frequency. Gain follows
    /// a half-gain style rule (`0.46 × HL + 5` dB from 20 dB HL up); ratio and
    /// threshold scale with the loss so louder input is compressed harder in
    /// bands with more recruitment.
    pub fn prescribe(audiogram: &Audiogram, crossovers_hz: Vec<f32>) -> Self {
        let mut profile = Self {
            name: format!("Prescribed from {}", audiogram.name),
            crossovers_hz,
            ..Default::default()
        };

        let mut edges = Vec::with_capacity(profile.band_count() + 1);
        edges.push(AUDIOGRAM_FREQUENCIES[0] / 2.0);
        edges.extend(profile.crossovers_hz.iter().copied());
        edges.push(AUDIOGRAM_FREQUENCIES[AUDIOGRAM_FREQUENCIES.len() - 1]);

        for ear in Ear::BOTH {
            let bands: Vec<BandParams> = edges
                .windows(2)
                .map(|edge| {
                    let centre = (edge[0] * edge[1].max(edge[0])).sqrt();
                    let hl = audiogram.threshold_at(ear, centre).max(0.0);
                    let gain_db = if hl >= 20.0 { 0.46 * hl + 5.0 } else { 0.0 };
                    BandParams {
                        threshold_db: (-30.0 - 0.25 * hl).clamp(-70.0, -30.0),
                        ratio: (1.0 + hl / 40.0).clamp(1.0, 4.0),
                        gain_db: gain_db.min(profile.max_gain_db),
                        attack_ms: 5.0,
                        release_ms: 50.0,
                    }
                })
                .collect();
            *profile.ear_mut(ear) = bands;
        }
        profile
    }
}

fn check_profile_value(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ProfileError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ProfileError::ProfileValue { field, value })
    }
}

/// Pure-tone hearing thresholds for both ears
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audiogram {
    /// Display name (usually the test date or the person)
    pub name: String,
    /// Test frequencies in Hz, ascending
    pub frequencies_hz: Vec<f32>,
    /// Left-ear hearing level in dB HL per test frequency
    pub left_db_hl: Vec<f32>,
    /// Right-ear hearing level in dB HL per test frequency
    pub right_db_hl: Vec<f32>,
}

impl Audiogram {
    /// An audiogram over [`AUDIOGRAM_FREQUENCIES`]
    pub fn standard(name: impl Into<String>, left_db_hl: [f32; 10], right_db_hl: [f32; 10]) -> Self {
        Self {
            name: name.into(),
            frequencies_hz: AUDIOGRAM_FREQUENCIES.to_vec(),
            left_db_hl: left_db_hl.to_vec(),
            right_db_hl: right_db_hl.to_vec(),
        }
    }

    /// Hearing level at an arbitrary frequency
    ///
    /// Interpolates linearly on a log-frequency axis (the audiogram's own
    /// scale) and holds the end values outside the tested range. An empty
    /// audiogram reads as normal hearing.
    pub fn threshold_at(&self, ear: Ear, freq_hz: f32) -> f32 {
        let levels = match ear {
            Ear::Left => &self.left_db_hl,
            Ear::Right => &self.right_db_hl,
        };
        let n = self.frequencies_hz.len().min(levels.len());
        if n == 0 {
            return 0.0;
        }
        if freq_hz <= self.frequencies_hz[0] {
            return levels[0];
        }
        if freq_hz >= self.frequencies_hz[n - 1] {
            return levels[n - 1];
        }
        for i in 0..n - 1 {
            let (f0, f1) = (self.frequencies_hz[i], self.frequencies_hz[i + 1]);
            if freq_hz >= f0 && freq_hz <= f1 {
                let t = (freq_hz / f0).log2() / (f1 / f0).log2();
                return levels[i] + t * (levels[i + 1] - levels[i]);
            }
        }
        levels[n - 1]
    }
}

/// Allocation-free copy of a validated profile, read by the audio thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileSnapshot {
    pub band_count: usize,
    /// Only the first `band_count - 1` entries are meaningful
    pub crossovers_hz: [f32; MAX_BANDS - 1],
    /// `bands[channel][band]`, only the first `band_count` per channel are meaningful
    pub bands: [[BandParams; MAX_BANDS]; 2],
    pub knee_db: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
    pub gate_threshold_db: Option<f32>,
}

impl ProfileSnapshot {
    /// Copy a profile into fixed storage. Call after validation.
    pub fn from_profile(profile: &AudiogramProfile) -> Self {
        let band_count = profile.band_count().clamp(MIN_BANDS, MAX_BANDS);
        let mut crossovers_hz = [0.0; MAX_BANDS - 1];
        for (dst, src) in crossovers_hz.iter_mut().zip(&profile.crossovers_hz) {
            *dst = *src;
        }
        let mut bands = [[BandParams::transparent(); MAX_BANDS]; 2];
        for ear in Ear::BOTH {
            for (dst, src) in bands[ear.channel()].iter_mut().zip(profile.ear(ear)) {
                *dst = *src;
            }
        }
        Self {
            band_count,
            crossovers_hz,
            bands,
            knee_db: profile.knee_db,
            min_gain_db: profile.min_gain_db,
            max_gain_db: profile.max_gain_db,
            gate_threshold_db: profile.gate_threshold_db,
        }
    }

    /// Active crossover frequencies
    pub fn crossovers(&self) -> &[f32] {
        &self.crossovers_hz[..self.band_count - 1]
    }

    /// Active band settings for one channel
    pub fn channel_bands(&self, channel: usize) -> &[BandParams] {
        &self.bands[channel.min(1)][..self.band_count]
    }
}
