//! Linkwitz-Riley band splitter
//!
//! Splits a wide-band stereo signal into K bands (2..=8) and sums them back.
//! All filters are LR24 crossovers built from cascaded 12 dB/oct Butterworth
//! state-variable filters (Q = 1/√2). Two topologies are available:
//!
//! ## Complementary (default)
//!
//! Each crossover low-passes the running residual and the band is subtracted
//! from it; the last band is what remains:
//!
//! ```text
//!  input ─► residual ─┬─► LP24(f0) ──────────────► band 0
//!                     └─(−)─► residual ─┬─► LP24(f1) ─► band 1
//!                                       └─(−)─► ...  ─► band K-1
//! ```
//!
//! The bands telescope, so `band 0 + … + band K-1 == input` sample for
//! sample, whatever the crossover positions or filter state. Upper bands
//! roll off at only 6 dB/oct below their crossover.
//!
//! ## Linkwitz-Riley tree
//!
//! Classic LP24/HP24 cascade with allpass phase compensation on the lower
//! bands. Every band has full 24 dB/oct skirts and the sum is an allpass:
//! flat magnitude, but phase-shifted relative to the input.
//!
//! Both topologies are causal, sample-by-sample and add no latency.

use serde::{Deserialize, Serialize};

use crate::types::{StereoSample, MAX_BANDS};

/// Lowest crossover frequency the filters accept
const MIN_FREQUENCY: f32 = 20.0;

/// Crossovers are kept below this fraction of the sample rate
const MAX_FREQUENCY_FRACTION: f32 = 0.45;

/// How band signals are derived from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SplitTopology {
    /// Residual subtraction: exact reconstruction, gentler upper-band skirts
    #[default]
    Complementary,
    /// LP/HP tree with allpass compensation: sharp bands, allpass sum
    LinkwitzRiley,
}

/// SVF outputs for one channel
#[derive(Clone, Copy)]
struct SvfOut {
    low: f32,
    band: f32,
    high: f32,
}

/// Two-pole (12dB/octave) state-variable filter, stereo
///
/// SVF topology is numerically stable under coefficient changes, so the
/// crossover can be retuned while audio runs without clearing state.
#[derive(Debug, Clone)]
struct SvfFilter {
    ic1eq: [f32; 2],
    ic2eq: [f32; 2],
    k: f32,
    a1: f32,
    a2: f32,
    a3: f32,
}

impl SvfFilter {
    fn new(cutoff: f32, sample_rate: f32) -> Self {
        let mut filter = Self {
            ic1eq: [0.0; 2],
            ic2eq: [0.0; 2],
            k: 0.0,
            a1: 0.0,
            a2: 0.0,
            a3: 0.0,
        };
        filter.set_frequency(cutoff, sample_rate);
        filter
    }

    /// Set cutoff with Butterworth Q, which cascades to LR24
    fn set_frequency(&mut self, cutoff: f32, sample_rate: f32) {
        let q = std::f32::consts::FRAC_1_SQRT_2;
        let g = (std::f32::consts::PI * cutoff / sample_rate).tan();
        self.k = 1.0 / q;
        self.a1 = 1.0 / (1.0 + g * (g + self.k));
        self.a2 = g * self.a1;
        self.a3 = g * self.a2;
    }

    #[inline]
    fn tick(&mut self, ch: usize, input: f32) -> SvfOut {
        let v3 = input - self.ic2eq[ch];
        let v1 = self.a1 * self.ic1eq[ch] + self.a2 * v3;
        let v2 = self.ic2eq[ch] + self.a2 * self.ic1eq[ch] + self.a3 * v3;
        self.ic1eq[ch] = 2.0 * v1 - self.ic1eq[ch];
        self.ic2eq[ch] = 2.0 * v2 - self.ic2eq[ch];
        SvfOut {
            low: v2,
            band: v1,
            high: input - self.k * v1 - v2,
        }
    }

    #[inline]
    fn lowpass(&mut self, input: StereoSample) -> StereoSample {
        StereoSample::new(self.tick(0, input.left).low, self.tick(1, input.right).low)
    }

    #[inline]
    fn highpass(&mut self, input: StereoSample) -> StereoSample {
        StereoSample::new(self.tick(0, input.left).high, self.tick(1, input.right).high)
    }

    /// Second-order allpass with the same corner; equals LP24 + HP24
    #[inline]
    fn allpass(&mut self, input: StereoSample) -> StereoSample {
        let l = self.tick(0, input.left);
        let r = self.tick(1, input.right);
        StereoSample::new(
            input.left - 2.0 * self.k * l.band,
            input.right - 2.0 * self.k * r.band,
        )
    }

    fn reset(&mut self) {
        self.ic1eq = [0.0; 2];
        self.ic2eq = [0.0; 2];
    }
}

/// One LR24 crossover point
///
/// `compensation[j]` is the allpass copy of this crossover applied to band
/// `j` (only used by the tree topology, for bands below this point).
#[derive(Debug, Clone)]
struct CrossoverPoint {
    lp1: SvfFilter,
    lp2: SvfFilter,
    hp1: SvfFilter,
    hp2: SvfFilter,
    compensation: [SvfFilter; MAX_BANDS - 1],
    frequency: f32,
}

impl CrossoverPoint {
    fn new(frequency: f32, sample_rate: f32) -> Self {
        Self {
            lp1: SvfFilter::new(frequency, sample_rate),
            lp2: SvfFilter::new(frequency, sample_rate),
            hp1: SvfFilter::new(frequency, sample_rate),
            hp2: SvfFilter::new(frequency, sample_rate),
            compensation: std::array::from_fn(|_| SvfFilter::new(frequency, sample_rate)),
            frequency,
        }
    }

    fn set_frequency(&mut self, frequency: f32, sample_rate: f32) {
        self.frequency = frequency;
        self.lp1.set_frequency(frequency, sample_rate);
        self.lp2.set_frequency(frequency, sample_rate);
        self.hp1.set_frequency(frequency, sample_rate);
        self.hp2.set_frequency(frequency, sample_rate);
        for ap in &mut self.compensation {
            ap.set_frequency(frequency, sample_rate);
        }
    }

    #[inline]
    fn lowpass(&mut self, input: StereoSample) -> StereoSample {
        let stage1 = self.lp1.lowpass(input);
        self.lp2.lowpass(stage1)
    }

    #[inline]
    fn highpass(&mut self, input: StereoSample) -> StereoSample {
        let stage1 = self.hp1.highpass(input);
        self.hp2.highpass(stage1)
    }

    fn reset(&mut self) {
        self.lp1.reset();
        self.lp2.reset();
        self.hp1.reset();
        self.hp2.reset();
        for ap in &mut self.compensation {
            ap.reset();
        }
    }
}

/// K-band crossover
///
/// The band count is fixed at construction; only the crossover frequencies
/// can move afterwards.
///
/// ```ignore
/// let mut splitter = BandSplitter::new(48000, &[300.0, 1000.0, 3000.0], SplitTopology::default());
/// let bands = splitter.split(sample);
/// let out = splitter.recombine(&bands);
/// ```
#[derive(Debug, Clone)]
pub struct BandSplitter {
    points: [CrossoverPoint; MAX_BANDS - 1],
    band_count: usize,
    sample_rate: f32,
    topology: SplitTopology,
}

impl BandSplitter {
    /// Create a splitter with `crossovers.len() + 1` bands
    ///
    /// The crossover list is truncated to `MAX_BANDS - 1` entries.
    pub fn new(sample_rate: u32, crossovers: &[f32], topology: SplitTopology) -> Self {
        let sample_rate = sample_rate as f32;
        let crossover_count = crossovers.len().min(MAX_BANDS - 1);
        let points = std::array::from_fn(|i| {
            let freq = crossovers.get(i).copied().unwrap_or(1000.0);
            CrossoverPoint::new(clamp_frequency(freq, sample_rate), sample_rate)
        });
        Self {
            points,
            band_count: crossover_count + 1,
            sample_rate,
            topology,
        }
    }

    /// Number of bands produced by [`split`](Self::split)
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn topology(&self) -> SplitTopology {
        self.topology
    }

    /// Crossover frequency between band `index` and `index + 1`
    pub fn frequency(&self, index: usize) -> Option<f32> {
        (index + 1 < self.band_count).then(|| self.points[index].frequency)
    }

    /// Band index whose range contains `freq_hz`
    pub fn band_for_frequency(&self, freq_hz: f32) -> usize {
        self.points[..self.band_count - 1]
            .iter()
            .position(|point| freq_hz < point.frequency)
            .unwrap_or(self.band_count - 1)
    }

    /// Move the crossovers without touching filter state
    ///
    /// Returns `false` (and changes nothing) if the number of frequencies
    /// does not match the band layout.
    pub fn set_crossovers(&mut self, crossovers: &[f32]) -> bool {
        if crossovers.len() + 1 != self.band_count {
            return false;
        }
        for (point, &freq) in self.points.iter_mut().zip(crossovers) {
            let freq = clamp_frequency(freq, self.sample_rate);
            if point.frequency != freq {
                point.set_frequency(freq, self.sample_rate);
            }
        }
        true
    }

    /// Split one sample into bands
    ///
    /// Only the first `band_count` entries are meaningful; the rest are silent.
    #[inline]
    pub fn split(&mut self, input: StereoSample) -> [StereoSample; MAX_BANDS] {
        match self.topology {
            SplitTopology::Complementary => self.split_complementary(input),
            SplitTopology::LinkwitzRiley => self.split_tree(input),
        }
    }

    #[inline]
    fn split_complementary(&mut self, input: StereoSample) -> [StereoSample; MAX_BANDS] {
        let mut bands = [StereoSample::silence(); MAX_BANDS];
        let last = self.band_count - 1;
        let mut residual = input;
        for (band, point) in bands[..last].iter_mut().zip(self.points.iter_mut()) {
            let low = point.lowpass(residual);
            *band = low;
            residual = residual - low;
        }
        bands[last] = residual;
        bands
    }

    #[inline]
    fn split_tree(&mut self, input: StereoSample) -> [StereoSample; MAX_BANDS] {
        let mut bands = [StereoSample::silence(); MAX_BANDS];
        let last = self.band_count - 1;
        let mut current = input;
        for i in 0..last {
            let point = &mut self.points[i];
            bands[i] = point.lowpass(current);
            current = point.highpass(current);
        }
        bands[last] = current;

        // Band i went through crossovers 0..=i only; give it the allpass
        // response of every later crossover so all bands share one phase.
        for i in 0..last {
            for j in (i + 1)..last {
                bands[i] = self.points[j].compensation[i].allpass(bands[i]);
            }
        }
        bands
    }

    /// Sum the active bands back into a wide-band sample
    #[inline]
    pub fn recombine(&self, bands: &[StereoSample; MAX_BANDS]) -> StereoSample {
        bands[..self.band_count]
            .iter()
            .fold(StereoSample::silence(), |acc, band| acc + *band)
    }

    /// Processing latency (causal, no look-ahead)
    pub fn latency_samples(&self) -> usize {
        0
    }

    /// Clear all filter state
    pub fn reset(&mut self) {
        for point in &mut self.points {
            point.reset();
        }
    }
}

fn clamp_frequency(freq: f32, sample_rate: f32) -> f32 {
    let max = sample_rate * MAX_FREQUENCY_FRACTION;
    if freq.is_finite() {
        freq.clamp(MIN_FREQUENCY, max)
    } else {
        1000.0_f32.min(max)
    }
}
