//! Acoustic feedback suppression
//!
//! The earpiece leaks back into the microphone; with enough gain the loop
//! starts to whistle. Two mechanisms work together:
//!
//! ```text
//!  mic ─► NLMS canceller ─► gate ─► split ─► dynamics ─► band trim ─► sum ─► notches ─► … ─► out
//!           ▲   (subtract ŷ)                               ▲                   │
//!           │                                              │         howl detector (LPC)
//!           └──────── delayed output reference ◄───────────┼───────────────────┘
//!                                                          └── unresolved howl → band reduction
//! ```
//!
//! 1. **Canceller**: an NLMS FIR filter per ear models the leakage path from
//!    the output back to the input and subtracts its estimate from the
//!    microphone signal. A coefficient-norm guard resets a diverging model.
//! 2. **Howl control**: a second-order linear predictor runs over each frame
//!    of the post-notch signal. A loud, highly predictable signal whose pole
//!    frequency stays put for `detect_frames` frames is a howl and gets a
//!    notch. A howl that persists through its notch is unresolved; the band
//!    containing it is turned down step by step, and recovers once quiet.
//!
//! When disabled the suppressor passes audio through untouched.

use serde::{Deserialize, Serialize};

use crate::dsp::band_splitter::BandSplitter;
use crate::types::{db_to_linear, StereoSample, MAX_BANDS};

/// Longest adaptive filter supported
pub const MAX_TAPS: usize = 512;

/// Longest bulk delay supported, in samples
pub const MAX_BULK_DELAY: usize = 8192;

/// Concurrent notches per ear
pub const MAX_NOTCHES: usize = 4;

/// Pending reports per frame; extras are counted as dropped
const MAX_REPORTS: usize = 8;

/// Two frequency estimates within this relative distance are the same tone
const SAME_TONE_TOLERANCE: f32 = 0.05;

/// Notch engage/release crossfade time constant
const NOTCH_FADE_MS: f32 = 5.0;

/// Band gain ramp time constant
const BAND_RAMP_MS: f32 = 20.0;

/// Feedback suppression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub enabled: bool,
    /// Adaptive filter length
    pub taps: usize,
    /// NLMS step size, clamped to (0, 1]
    pub mu: f32,
    /// Per-update coefficient leakage
    pub leakage: f32,
    /// Regularisation added to the reference power
    pub delta: f32,
    /// Output-to-input delay skipped by the filter. `None` estimates it from the stream.
    pub bulk_delay_samples: Option<usize>,
    /// Squared coefficient norm above which the model is reset
    pub max_coeff_norm: f32,
    /// Minimum frame level for a tone to count as a howl (dBFS)
    pub howl_level_db: f32,
    /// Prediction gain threshold, 0..1 (1 = pure tone)
    pub tonality: f32,
    /// Consecutive tonal frames before a notch engages
    pub detect_frames: u32,
    /// Notch quality factor
    pub notch_q: f32,
    /// A howl still above this level (dBFS) through its notch is unresolved
    pub safety_level_db: f32,
    /// Frames a notched howl may persist before the band is turned down
    pub max_suppress_frames: u32,
    /// Gain taken off a band per unresolved report
    pub band_reduction_db: f32,
    /// Largest total reduction of a band
    pub max_band_reduction_db: f32,
    /// Quiet frames before a notch is released
    pub notch_hold_frames: u32,
    /// Recovery rate of a reduced band once the howl is gone
    pub band_recovery_db_per_frame: f32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            taps: 64,
            mu: 0.01,
            leakage: 1e-5,
            delta: 1e-6,
            bulk_delay_samples: None,
            max_coeff_norm: 4.0,
            howl_level_db: -30.0,
            tonality: 0.97,
            detect_frames: 8,
            notch_q: 8.0,
            safety_level_db: -35.0,
            max_suppress_frames: 32,
            band_reduction_db: 3.0,
            max_band_reduction_db: 18.0,
            notch_hold_frames: 1800,
            band_recovery_db_per_frame: 0.02,
        }
    }
}

/// Something the suppressor did during the last frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedbackReport {
    /// A howl was found and a notch engaged
    Detected { channel: usize, frequency_hz: f32 },
    /// A notched howl stayed loud; the band was turned down
    Unresolved {
        channel: usize,
        frequency_hz: f32,
        band: usize,
        reduction_db: f32,
    },
    /// The adaptive model diverged and was cleared
    ModelReset { channel: usize },
}

// ────────────────────────────────────────────────────────────────────────────
// NLMS canceller
// ────────────────────────────────────────────────────────────────────────────

/// Adaptive estimate of the output → input leakage path for one ear
#[derive(Debug, Clone)]
struct NlmsCanceller {
    weights: Vec<f32>,
    /// Past output samples, circular
    history: Vec<f32>,
    write_pos: usize,
    bulk_delay: usize,
    mu: f32,
    leakage: f32,
    delta: f32,
    max_norm: f32,
}

impl NlmsCanceller {
    fn new(config: &FeedbackConfig, bulk_delay: usize) -> Self {
        let taps = config.taps.clamp(1, MAX_TAPS);
        let bulk_delay = bulk_delay.min(MAX_BULK_DELAY);
        let mu = if config.mu.is_finite() && config.mu > 0.0 {
            config.mu.min(1.0)
        } else {
            FeedbackConfig::default().mu
        };
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; taps + bulk_delay + 1],
            write_pos: 0,
            bulk_delay,
            mu,
            leakage: config.leakage.clamp(0.0, 0.1),
            delta: config.delta.max(1e-12),
            max_norm: config.max_coeff_norm,
        }
    }

    /// Subtract the leakage estimate and adapt
    ///
    /// Returns the cleaned sample and whether the model had to be reset.
    #[inline]
    fn cancel(&mut self, mic: f32) -> (f32, bool) {
        let len = self.history.len();
        // Index of the newest reference sample the filter may see
        let base = self.write_pos + 2 * len - 1 - self.bulk_delay;

        let mut estimate = 0.0;
        let mut power = 0.0;
        for (k, w) in self.weights.iter().enumerate() {
            let u = self.history[(base - k) % len];
            estimate += w * u;
            power += u * u;
        }

        let error = mic - estimate;
        if !error.is_finite() {
            self.reset();
            return (0.0, true);
        }

        let scale = self.mu * error / (power + self.delta);
        let decay = 1.0 - self.leakage;
        let mut norm = 0.0;
        for (k, w) in self.weights.iter_mut().enumerate() {
            let u = self.history[(base - k) % len];
            *w = *w * decay + scale * u;
            norm += *w * *w;
        }

        if !norm.is_finite() || norm > self.max_norm {
            self.reset();
            return (mic, true);
        }
        (error, false)
    }

    #[inline]
    fn push_reference(&mut self, output: f32) {
        self.history[self.write_pos] = if output.is_finite() { output } else { 0.0 };
        self.write_pos = (self.write_pos + 1) % self.history.len();
    }

    fn coeff_norm(&self) -> f32 {
        self.weights.iter().map(|w| w * w).sum()
    }

    /// Forget the path model (the reference history stays)
    fn reset(&mut self) {
        self.weights.fill(0.0);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Howl detection
// ────────────────────────────────────────────────────────────────────────────

/// Tonal estimate of one frame
#[derive(Debug, Clone, Copy)]
struct ToneEstimate {
    frequency_hz: f32,
    level_db: f32,
    tonality: f32,
}

/// Second-order linear predictor over one frame (covariance method)
///
/// A sinusoid obeys `x[n] = 2cos(ω)·x[n-1] - x[n-2]` exactly, so a frame
/// that a two-pole predictor explains almost perfectly is a single tone
/// and the pole angle is its frequency.
#[derive(Debug, Clone, Default)]
struct ToneAnalyzer {
    x1: f32,
    x2: f32,
    c00: f32,
    c01: f32,
    c02: f32,
    c11: f32,
    c12: f32,
    c22: f32,
    samples: usize,
}

impl ToneAnalyzer {
    #[inline]
    fn push(&mut self, x: f32) {
        self.c00 += x * x;
        self.c01 += x * self.x1;
        self.c02 += x * self.x2;
        self.c11 += self.x1 * self.x1;
        self.c12 += self.x1 * self.x2;
        self.c22 += self.x2 * self.x2;
        self.samples += 1;
        self.x2 = self.x1;
        self.x1 = x;
    }

    /// Close the frame and start the next one
    fn finish(&mut self, sample_rate: f32) -> Option<ToneEstimate> {
        let estimate = self.estimate(sample_rate);
        *self = Self {
            x1: self.x1,
            x2: self.x2,
            ..Self::default()
        };
        estimate
    }

    fn estimate(&self, sample_rate: f32) -> Option<ToneEstimate> {
        if self.samples == 0 || self.c00 <= 1e-12 {
            return None;
        }
        let det = self.c11 * self.c22 - self.c12 * self.c12;
        if det.abs() <= 1e-12 * (self.c11 * self.c22).max(1e-20) {
            return None;
        }
        let a1 = (self.c01 * self.c22 - self.c02 * self.c12) / det;
        let a2 = (self.c11 * self.c02 - self.c12 * self.c01) / det;
        let residual = (self.c00 - a1 * self.c01 - a2 * self.c02).max(0.0);
        let tonality = (1.0 - residual / self.c00).clamp(0.0, 1.0);

        // Poles at r·e^{±jω}: a1 = 2r·cos ω, a2 = -r²
        let cos_w = if a2 < 0.0 { a1 / (2.0 * (-a2).sqrt()) } else { a1 * 0.5 };
        let frequency_hz = cos_w.clamp(-1.0, 1.0).acos() * sample_rate / std::f32::consts::TAU;

        let level_db = 10.0 * (self.c00 / self.samples as f32).max(1e-12).log10();
        // Mean square of a sine is half its peak squared; report peak dBFS
        let level_db = level_db + 3.010_3;

        Some(ToneEstimate {
            frequency_hz,
            level_db,
            tonality,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Notch
// ────────────────────────────────────────────────────────────────────────────

/// RBJ notch biquad (transposed direct form II) with a crossfaded engage
#[derive(Debug, Clone)]
struct Notch {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
    frequency_hz: f32,
    /// 0 = bypassed, 1 = fully notched
    mix: f32,
    engaged: bool,
    idle_frames: u32,
    unresolved_frames: u32,
}

impl Notch {
    fn new() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
            frequency_hz: 0.0,
            mix: 0.0,
            engaged: false,
            idle_frames: 0,
            unresolved_frames: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.engaged || self.mix > 0.0
    }

    fn engage(&mut self, frequency_hz: f32, q: f32, sample_rate: f32) {
        let w0 = std::f32::consts::TAU * frequency_hz / sample_rate;
        let alpha = w0.sin() / (2.0 * q.max(0.1));
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        self.b0 = 1.0 / a0;
        self.b1 = -2.0 * cos_w0 / a0;
        self.b2 = 1.0 / a0;
        self.a1 = -2.0 * cos_w0 / a0;
        self.a2 = (1.0 - alpha) / a0;
        if !self.is_active() {
            self.z1 = 0.0;
            self.z2 = 0.0;
        }
        self.frequency_hz = frequency_hz;
        self.engaged = true;
        self.idle_frames = 0;
        self.unresolved_frames = 0;
    }

    #[inline]
    fn process(&mut self, x: f32, fade_coeff: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;

        let target = if self.engaged { 1.0 } else { 0.0 };
        self.mix = target + fade_coeff * (self.mix - target);
        if (self.mix - target).abs() < 1e-4 {
            self.mix = target;
        }
        x + self.mix * (y - x)
    }

    fn matches(&self, frequency_hz: f32) -> bool {
        self.engaged && (frequency_hz - self.frequency_hz).abs() <= self.frequency_hz * SAME_TONE_TOLERANCE
    }
}

/// Howl tracking state for one ear
#[derive(Debug, Clone)]
struct HowlTracker {
    analyzer: ToneAnalyzer,
    notches: [Notch; MAX_NOTCHES],
    candidate_hz: f32,
    candidate_frames: u32,
}

impl HowlTracker {
    fn new() -> Self {
        Self {
            analyzer: ToneAnalyzer::default(),
            notches: std::array::from_fn(|_| Notch::new()),
            candidate_hz: 0.0,
            candidate_frames: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Suppressor
// ────────────────────────────────────────────────────────────────────────────

/// Feedback canceller plus howl control for both ears
pub struct FeedbackSuppressor {
    config: FeedbackConfig,
    sample_rate: f32,
    enabled: bool,
    cancellers: [NlmsCanceller; 2],
    trackers: [HowlTracker; 2],
    /// Target band gain in dB (≤ 0), per ear
    band_reduction_db: [[f32; MAX_BANDS]; 2],
    /// Linear band gain currently applied, per ear
    band_gain: [[f32; MAX_BANDS]; 2],
    /// Frames since the last unresolved report, per ear
    quiet_frames: [u32; 2],
    model_reset: [bool; 2],
    fade_coeff: f32,
    band_ramp_coeff: f32,
    reports: [Option<FeedbackReport>; MAX_REPORTS],
    dropped_reports: u64,
}

impl FeedbackSuppressor {
    /// `bulk_delay` is used when the config leaves it to the stream
    pub fn new(config: &FeedbackConfig, sample_rate: u32, bulk_delay: usize) -> Self {
        let sample_rate = sample_rate as f32;
        let bulk_delay = config.bulk_delay_samples.unwrap_or(bulk_delay);
        let canceller = NlmsCanceller::new(config, bulk_delay);
        Self {
            config: config.clone(),
            sample_rate,
            enabled: config.enabled,
            cancellers: [canceller.clone(), canceller],
            trackers: [HowlTracker::new(), HowlTracker::new()],
            band_reduction_db: [[0.0; MAX_BANDS]; 2],
            band_gain: [[1.0; MAX_BANDS]; 2],
            quiet_frames: [0; 2],
            model_reset: [false; 2],
            fade_coeff: (-1.0 / (NOTCH_FADE_MS * 0.001 * sample_rate)).exp(),
            band_ramp_coeff: (-1.0 / (BAND_RAMP_MS * 0.001 * sample_rate)).exp(),
            reports: [None; MAX_REPORTS],
            dropped_reports: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turning the suppressor on or off starts it from a clean state
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.enabled = enabled;
            self.reset();
        }
    }

    /// Samples of output history the canceller skips
    pub fn bulk_delay(&self) -> usize {
        self.cancellers[0].bulk_delay
    }

    /// Squared norm of one ear's path model
    pub fn coeff_norm(&self, channel: usize) -> f32 {
        self.cancellers[channel.min(1)].coeff_norm()
    }

    /// Engaged notch frequencies for one ear
    pub fn notch_frequencies(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        self.trackers[channel.min(1)]
            .notches
            .iter()
            .filter(|n| n.engaged)
            .map(|n| n.frequency_hz)
    }

    /// Current reduction of one band in dB (≤ 0)
    pub fn band_reduction_db(&self, channel: usize, band: usize) -> f32 {
        self.band_reduction_db[channel.min(1)][band.min(MAX_BANDS - 1)]
    }

    /// Remove the leakage estimate from a captured sample
    #[inline]
    pub fn cancel(&mut self, input: StereoSample) -> StereoSample {
        if !self.enabled {
            return input;
        }
        let mut out = input;
        for channel in 0..2 {
            let (cleaned, reset) = self.cancellers[channel].cancel(input.channel(channel));
            *out.channel_mut(channel) = cleaned;
            self.model_reset[channel] |= reset;
        }
        out
    }

    /// Apply per-band reductions (no-op while nothing is reduced)
    #[inline]
    pub fn apply_band_gains(&mut self, bands: &mut [StereoSample; MAX_BANDS], band_count: usize) {
        if !self.enabled {
            return;
        }
        for channel in 0..2 {
            for band in 0..band_count.min(MAX_BANDS) {
                let gain = &mut self.band_gain[channel][band];
                let reduction = self.band_reduction_db[channel][band];
                if reduction == 0.0 && *gain == 1.0 {
                    continue;
                }
                let target = db_to_linear(reduction);
                *gain = target + self.band_ramp_coeff * (*gain - target);
                if (*gain - target).abs() < 1e-6 {
                    *gain = target;
                }
                *bands[band].channel_mut(channel) *= *gain;
            }
        }
    }

    /// Run the notches and feed the howl detector
    #[inline]
    pub fn notch(&mut self, input: StereoSample) -> StereoSample {
        if !self.enabled {
            return input;
        }
        let mut out = input;
        for channel in 0..2 {
            let tracker = &mut self.trackers[channel];
            let mut x = input.channel(channel);
            for notch in tracker.notches.iter_mut().filter(|n| n.is_active()) {
                x = notch.process(x, self.fade_coeff);
            }
            tracker.analyzer.push(x);
            *out.channel_mut(channel) = x;
        }
        out
    }

    /// Record what was actually played, for the canceller
    #[inline]
    pub fn push_reference(&mut self, output: StereoSample) {
        if !self.enabled {
            return;
        }
        self.cancellers[0].push_reference(output.left);
        self.cancellers[1].push_reference(output.right);
    }

    /// Frame boundary: run detection, engage notches, adjust band gains
    pub fn end_frame(&mut self, splitter: &BandSplitter) {
        if !self.enabled {
            return;
        }
        for channel in 0..2 {
            if std::mem::take(&mut self.model_reset[channel]) {
                self.report(FeedbackReport::ModelReset { channel });
            }
            self.track_howl(channel, splitter);
            self.recover_bands(channel, splitter.band_count());
        }
    }

    fn track_howl(&mut self, channel: usize, splitter: &BandSplitter) {
        let config = &self.config;
        let tracker = &mut self.trackers[channel];
        let tonal = tracker
            .analyzer
            .finish(self.sample_rate)
            .filter(|e| e.tonality >= config.tonality);

        // A tone already under a notch is judged against the safety level,
        // not the detection level
        let notched = tonal.and_then(|tone| {
            tracker
                .notches
                .iter()
                .position(|n| n.matches(tone.frequency_hz))
                .map(|index| (index, tone))
        });

        let mut hit = None;
        let mut new_report = None;
        if let Some((index, tone)) = notched {
            tracker.candidate_frames = 0;
            let notch = &mut tracker.notches[index];
            if tone.level_db >= config.safety_level_db {
                hit = Some(index);
                notch.unresolved_frames += 1;
            }
            if notch.unresolved_frames >= config.max_suppress_frames {
                notch.unresolved_frames = 0;
                let band = splitter.band_for_frequency(notch.frequency_hz);
                let reduction = &mut self.band_reduction_db[channel][band];
                *reduction = (*reduction - config.band_reduction_db).max(-config.max_band_reduction_db);
                self.quiet_frames[channel] = 0;
                new_report = Some(FeedbackReport::Unresolved {
                    channel,
                    frequency_hz: notch.frequency_hz,
                    band,
                    reduction_db: *reduction,
                });
            }
        } else {
            let confirmed = match tonal.filter(|e| e.level_db >= config.howl_level_db) {
                Some(tone) => {
                    let same = tracker.candidate_frames > 0
                        && (tone.frequency_hz - tracker.candidate_hz).abs()
                            <= tracker.candidate_hz * SAME_TONE_TOLERANCE;
                    if same {
                        tracker.candidate_frames += 1;
                    } else {
                        tracker.candidate_hz = tone.frequency_hz;
                        tracker.candidate_frames = 1;
                    }
                    (tracker.candidate_frames >= config.detect_frames).then_some(tone)
                }
                None => {
                    tracker.candidate_frames = 0;
                    None
                }
            };

            if let Some(tone) = confirmed {
                // Free slot, else the notch idle the longest
                let index = tracker
                    .notches
                    .iter()
                    .position(|n| !n.engaged)
                    .or_else(|| {
                        tracker
                            .notches
                            .iter()
                            .enumerate()
                            .max_by_key(|(_, n)| n.idle_frames)
                            .map(|(i, _)| i)
                    })
                    .unwrap_or(0);
                tracker.notches[index].engage(tone.frequency_hz, config.notch_q, self.sample_rate);
                tracker.candidate_frames = 0;
                hit = Some(index);
                new_report = Some(FeedbackReport::Detected {
                    channel,
                    frequency_hz: tone.frequency_hz,
                });
            }
        }

        for (index, notch) in tracker.notches.iter_mut().enumerate() {
            if !notch.engaged || hit == Some(index) {
                continue;
            }
            notch.idle_frames += 1;
            if notch.idle_frames >= config.notch_hold_frames {
                notch.engaged = false;
                notch.unresolved_frames = 0;
            }
        }

        if let Some(report) = new_report {
            self.report(report);
        }
    }

    fn recover_bands(&mut self, channel: usize, band_count: usize) {
        self.quiet_frames[channel] = self.quiet_frames[channel].saturating_add(1);
        if self.quiet_frames[channel] < self.config.notch_hold_frames {
            return;
        }
        for reduction in &mut self.band_reduction_db[channel][..band_count.min(MAX_BANDS)] {
            if *reduction < 0.0 {
                *reduction = (*reduction + self.config.band_recovery_db_per_frame).min(0.0);
            }
        }
    }

    fn report(&mut self, report: FeedbackReport) {
        match self.reports.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(report),
            None => self.dropped_reports += 1,
        }
    }

    /// Reports raised since the last drain
    pub fn drain_reports(&mut self) -> impl Iterator<Item = FeedbackReport> + '_ {
        self.reports.iter_mut().filter_map(Option::take)
    }

    /// Reports lost because too many were raised before a drain; resets the count
    pub fn take_dropped_reports(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_reports)
    }

    /// Clear models, notches and band reductions
    pub fn reset(&mut self) {
        for canceller in &mut self.cancellers {
            canceller.reset();
            canceller.history.fill(0.0);
        }
        for tracker in &mut self.trackers {
            tracker.reset();
        }
        self.band_reduction_db = [[0.0; MAX_BANDS]; 2];
        self.band_gain = [[1.0; MAX_BANDS]; 2];
        self.quiet_frames = [0; 2];
        self.model_reset = [false; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::band_splitter::SplitTopology;
    use crate::types::SAMPLE_RATE;

    fn noise(seed: &mut u32) -> f32 {
        *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (*seed >> 8) as f32 / (1u32 << 23) as f32 - 1.0
    }

    fn splitter() -> BandSplitter {
        BandSplitter::new(SAMPLE_RATE, &[300.0, 1000.0, 3000.0], SplitTopology::Complementary)
    }

    fn sine(freq: f32, amplitude: f32, n: usize) -> f32 {
        amplitude * (std::f32::consts::TAU * freq * n as f32 / SAMPLE_RATE as f32).sin()
    }

    #[test]
    fn test_nlms_converges_in_closed_loop() {
        let config = FeedbackConfig {
            taps: 32,
            mu: 0.02,
            leakage: 0.0,
            ..Default::default()
        };
        let delay = 10;
        let mut canceller = NlmsCanceller::new(&config, delay);

        // Leakage path: y[n-1-delay-k] weighted by path[k]
        let mut path = [0.0_f32; 32];
        path[3] = 0.3;
        path[7] = -0.15;
        let forward_gain = 2.0;

        let mut outputs = vec![0.0_f32; 64];
        let mut seed = 3;
        let mut residual = 0.0;
        let mut source_power = 0.0;
        for n in 0..48000 {
            let source = noise(&mut seed) * 0.1;
            let leak: f32 = path
                .iter()
                .enumerate()
                .map(|(k, h)| h * outputs[(outputs.len() + n - 1 - delay - k) % outputs.len()])
                .sum();
            let (cleaned, reset) = canceller.cancel(source + leak);
            assert!(!reset);

            let out = (cleaned * forward_gain).clamp(-1.0, 1.0);
            canceller.push_reference(out);
            let len = outputs.len();
            outputs[n % len] = out;

            if n >= 43200 {
                residual += (cleaned - source).powi(2);
                source_power += source * source;
            }
        }

        let misalignment: f32 = canceller
            .weights
            .iter()
            .zip(path.iter())
            .map(|(w, h)| (w - h).powi(2))
            .sum::<f32>()
            / path.iter().map(|h| h * h).sum::<f32>();
        assert!(misalignment < 0.1, "misalignment {}", misalignment);
        assert!(residual < source_power * 0.05, "residual {} vs {}", residual, source_power);
        assert!(canceller.coeff_norm() < config.max_coeff_norm);
    }

    #[test]
    fn test_nan_input_resets_model() {
        let mut canceller = NlmsCanceller::new(&FeedbackConfig::default(), 0);
        canceller.weights[0] = 0.5;
        canceller.push_reference(0.2);
        let (out, reset) = canceller.cancel(f32::NAN);
        assert!(reset);
        assert_eq!(out, 0.0);
        assert_eq!(canceller.coeff_norm(), 0.0);
    }

    #[test]
    fn test_norm_guard_resets_diverging_model() {
        let config = FeedbackConfig {
            taps: 4,
            mu: 1.0,
            max_coeff_norm: 0.01,
            ..Default::default()
        };
        let mut canceller = NlmsCanceller::new(&config, 0);
        canceller.push_reference(1.0);
        // Error of 1 with unit reference pushes |w|² to ~1, above the guard
        let (_, reset) = canceller.cancel(1.0);
        assert!(reset);
        assert_eq!(canceller.coeff_norm(), 0.0);
    }

    #[test]
    fn test_mu_is_clamped() {
        let config = FeedbackConfig {
            mu: 5.0,
            ..Default::default()
        };
        assert_eq!(NlmsCanceller::new(&config, 0).mu, 1.0);
        let config = FeedbackConfig {
            mu: -1.0,
            ..Default::default()
        };
        assert!(NlmsCanceller::new(&config, 0).mu > 0.0);
    }

    #[test]
    fn test_tone_analyzer_finds_frequency() {
        let mut analyzer = ToneAnalyzer::default();
        for n in 0..256 {
            analyzer.push(sine(2500.0, 0.5, n));
        }
        let estimate = analyzer.finish(SAMPLE_RATE as f32).unwrap();
        assert!((estimate.frequency_hz - 2500.0).abs() < 5.0, "{:?}", estimate);
        assert!(estimate.tonality > 0.99);
        assert!((estimate.level_db - (-6.02)).abs() < 0.5);
    }

    #[test]
    fn test_tone_analyzer_rejects_noise() {
        let mut analyzer = ToneAnalyzer::default();
        let mut seed = 9;
        for _ in 0..256 {
            analyzer.push(noise(&mut seed) * 0.5);
        }
        let estimate = analyzer.finish(SAMPLE_RATE as f32).unwrap();
        assert!(estimate.tonality < 0.5);
    }

    #[test]
    fn test_sustained_howl_engages_notch() {
        let config = FeedbackConfig::default();
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&config, SAMPLE_RATE, 0);

        let mut detected = None;
        let mut n = 0;
        for _frame in 0..20 {
            for _ in 0..128 {
                suppressor.notch(StereoSample::mono(sine(2000.0, 0.5, n)));
                n += 1;
            }
            suppressor.end_frame(&splitter);
            for report in suppressor.drain_reports() {
                if let FeedbackReport::Detected { channel: 0, frequency_hz } = report {
                    detected = Some(frequency_hz);
                }
            }
        }

        let frequency = detected.expect("howl not detected");
        assert!((frequency - 2000.0).abs() < 20.0);
        assert_eq!(suppressor.notch_frequencies(0).count(), 1);

        // Once faded in, the notch removes the tone
        let mut peak = 0.0_f32;
        for i in 0..4800 {
            let out = suppressor.notch(StereoSample::mono(sine(2000.0, 0.5, n)));
            n += 1;
            if i > 2400 {
                peak = peak.max(out.left.abs());
            }
        }
        assert!(peak < 0.05, "notched peak {}", peak);
    }

    #[test]
    fn test_unresolved_howl_reduces_band() {
        let config = FeedbackConfig {
            detect_frames: 2,
            max_suppress_frames: 4,
            ..Default::default()
        };
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&config, SAMPLE_RATE, 0);

        // A 5 kHz tone detected at a notch that no longer removes it: retune
        // the notch far away so the tone keeps coming through
        let mut unresolved = None;
        let mut n = 0;
        for frame in 0..40 {
            for _ in 0..128 {
                suppressor.notch(StereoSample::mono(sine(5000.0, 0.5, n)));
                n += 1;
            }
            if frame == 3 {
                let notch = &mut suppressor.trackers[0].notches[0];
                let keep = notch.frequency_hz;
                notch.engage(200.0, config.notch_q, SAMPLE_RATE as f32);
                notch.frequency_hz = keep;
            }
            suppressor.end_frame(&splitter);
            for report in suppressor.drain_reports() {
                if let FeedbackReport::Unresolved { channel: 0, band, reduction_db, .. } = report {
                    unresolved.get_or_insert((band, reduction_db));
                }
            }
        }

        let (band, reduction) = unresolved.expect("no unresolved report");
        assert_eq!(band, 3);
        assert_eq!(reduction, -config.band_reduction_db);
        assert!(suppressor.band_reduction_db(0, 3) < 0.0);
        assert!(suppressor.band_reduction_db(0, 3) >= -config.max_band_reduction_db);
    }

    /// Detect a 5 kHz howl, detune its notch, then keep the tone going at
    /// `level_db`. Returns the first unresolved report, if any.
    fn run_leaking_notch(level_db: f32) -> Option<(usize, f32)> {
        let config = FeedbackConfig {
            detect_frames: 2,
            max_suppress_frames: 4,
            ..Default::default()
        };
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&config, SAMPLE_RATE, 0);

        let mut amplitude = 0.5;
        let mut unresolved = None;
        let mut n = 0;
        for _frame in 0..40 {
            for _ in 0..128 {
                suppressor.notch(StereoSample::mono(sine(5000.0, amplitude, n)));
                n += 1;
            }
            suppressor.end_frame(&splitter);
            let reports: Vec<_> = suppressor.drain_reports().collect();
            for report in reports {
                match report {
                    FeedbackReport::Detected { channel: 0, .. } => {
                        let notch = &mut suppressor.trackers[0].notches[0];
                        let keep = notch.frequency_hz;
                        notch.engage(200.0, config.notch_q, SAMPLE_RATE as f32);
                        notch.frequency_hz = keep;
                        amplitude = db_to_linear(level_db);
                    }
                    FeedbackReport::Unresolved {
                        channel: 0,
                        band,
                        reduction_db,
                        ..
                    } => {
                        unresolved.get_or_insert((band, reduction_db));
                    }
                    _ => {}
                }
            }
        }
        unresolved
    }

    #[test]
    fn test_notched_tone_between_safety_and_detection_level_is_unresolved() {
        let config = FeedbackConfig::default();
        let level_db = -32.0;
        assert!(level_db < config.howl_level_db && level_db > config.safety_level_db);

        let (band, reduction) = run_leaking_notch(level_db).expect("leaking notch never reported");
        assert_eq!(band, 3);
        assert_eq!(reduction, -config.band_reduction_db);
    }

    #[test]
    fn test_notched_tone_below_safety_level_is_resolved() {
        assert_eq!(run_leaking_notch(-45.0), None);
        assert!(run_leaking_notch(-26.0).is_some());
    }

    #[test]
    fn test_report_overflow_is_counted() {
        let mut suppressor = FeedbackSuppressor::new(&FeedbackConfig::default(), SAMPLE_RATE, 0);
        for channel in 0..MAX_REPORTS + 3 {
            suppressor.report(FeedbackReport::ModelReset { channel: channel % 2 });
        }
        assert_eq!(suppressor.drain_reports().count(), MAX_REPORTS);
        assert_eq!(suppressor.take_dropped_reports(), 3);
        assert_eq!(suppressor.take_dropped_reports(), 0);

        // Slots are free again after a drain
        suppressor.report(FeedbackReport::ModelReset { channel: 0 });
        assert_eq!(suppressor.drain_reports().count(), 1);
        assert_eq!(suppressor.take_dropped_reports(), 0);
    }

    #[test]
    fn test_band_reduction_is_floored_and_recovers() {
        let config = FeedbackConfig {
            notch_hold_frames: 10,
            band_recovery_db_per_frame: 1.0,
            ..Default::default()
        };
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&config, SAMPLE_RATE, 0);
        suppressor.band_reduction_db[0][2] = -config.max_band_reduction_db;

        for _ in 0..9 {
            suppressor.end_frame(&splitter);
        }
        assert_eq!(suppressor.band_reduction_db(0, 2), -config.max_band_reduction_db);
        for _ in 0..40 {
            suppressor.end_frame(&splitter);
        }
        assert_eq!(suppressor.band_reduction_db(0, 2), 0.0);
    }

    #[test]
    fn test_disabled_suppressor_is_identity() {
        let config = FeedbackConfig {
            enabled: false,
            ..Default::default()
        };
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&config, SAMPLE_RATE, 16);
        let mut seed = 5;
        for _ in 0..10 {
            for _ in 0..128 {
                let x = StereoSample::new(noise(&mut seed), noise(&mut seed));
                assert_eq!(suppressor.cancel(x), x);
                assert_eq!(suppressor.notch(x), x);
                let mut bands = [x; MAX_BANDS];
                suppressor.apply_band_gains(&mut bands, 4);
                assert_eq!(bands, [x; MAX_BANDS]);
                suppressor.push_reference(x);
            }
            suppressor.end_frame(&splitter);
        }
        assert_eq!(suppressor.drain_reports().count(), 0);
    }

    #[test]
    fn test_enabled_without_feedback_is_transparent() {
        let splitter = splitter();
        let mut suppressor = FeedbackSuppressor::new(&FeedbackConfig::default(), SAMPLE_RATE, 16);
        let mut bands = [StereoSample::mono(0.25); MAX_BANDS];
        suppressor.apply_band_gains(&mut bands, 4);
        assert_eq!(bands, [StereoSample::mono(0.25); MAX_BANDS]);
        // Silent reference: nothing to subtract
        let x = StereoSample::new(0.3, -0.2);
        assert_eq!(suppressor.cancel(x), x);
        suppressor.end_frame(&splitter);
    }

    #[test]
    fn test_explicit_bulk_delay_wins() {
        let config = FeedbackConfig {
            bulk_delay_samples: Some(100),
            ..Default::default()
        };
        assert_eq!(FeedbackSuppressor::new(&config, SAMPLE_RATE, 16).bulk_delay(), 100);
        assert_eq!(FeedbackSuppressor::new(&FeedbackConfig::default(), SAMPLE_RATE, 16).bulk_delay(), 16);
    }
}
