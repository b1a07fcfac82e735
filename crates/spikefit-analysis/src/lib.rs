//! # SpikeFit Analysis
//!
//! Statistical characterization of simulated and recorded neural activity:
//! inter-spike-interval distributions, Welch power spectra, canonical band
//! powers, two-sample Kolmogorov-Smirnov comparison, magnitude-squared
//! coherence, and a simple cognitive-state classifier.
//!
//! Operations that need more data than they were given return `None` after a
//! `tracing::warn!`; they never abort a pipeline.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// ISI EXTRACTION
// ============================================================================

/// Intervals at or above this are treated as silence, not ISIs (seconds)
pub const ISI_MAX: f64 = 1.0;

/// Pool consecutive-spike intervals across all trains.
///
/// Per-neuron differences are taken in spike order; intervals of `ISI_MAX`
/// or longer are dropped so silent stretches do not contaminate the
/// distribution. Neurons with fewer than two spikes contribute nothing.
pub fn isi_intervals(trains: &BTreeMap<u64, Vec<f64>>) -> Vec<f64> {
    let mut intervals = Vec::new();
    for train in trains.values() {
        for pair in train.windows(2) {
            let isi = pair[1] - pair[0];
            if isi < ISI_MAX {
                intervals.push(isi);
            }
        }
    }
    intervals
}

/// Mean rate across a set of trains over an observation window (Hz)
pub fn mean_firing_rate(trains: &BTreeMap<u64, Vec<f64>>, duration: f64) -> f64 {
    if duration <= 0.0 || trains.is_empty() {
        return 0.0;
    }
    let total: usize = trains.values().map(|t| t.len()).sum();
    total as f64 / (trains.len() as f64 * duration)
}

// ============================================================================
// WELCH SPECTRAL ESTIMATION
// ============================================================================

/// One-sided power spectral density (units^2 / Hz)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Psd {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

impl Psd {
    pub fn df(&self) -> f64 {
        if self.freqs.len() > 1 {
            self.freqs[1] - self.freqs[0]
        } else {
            0.0
        }
    }

    pub fn peak_frequency(&self) -> Option<f64> {
        self.power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.freqs[i])
    }
}

/// Periodic Hann window of length `n`
fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|k| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * k as f64 / n as f64).cos()))
        .collect()
}

/// Segment-averaged one-sided cross spectral density.
///
/// Hann window, 50% overlap, per-segment mean removal, density scaling
/// `1 / (fs * sum(w^2))`, non-DC non-Nyquist bins doubled. `csd(x, x)` is
/// the Welch PSD.
fn csd(x: &[f64], y: &[f64], fs: f64, nperseg: usize) -> Option<(Vec<f64>, Vec<Complex<f64>>)> {
    let len = x.len().min(y.len());
    if len < 2 || fs <= 0.0 {
        tracing::warn!(len, fs, "signal too short for spectral estimation");
        return None;
    }
    let nperseg = nperseg.max(2).min(len);
    let step = nperseg - nperseg / 2;
    let window = hann(nperseg);
    let win_norm: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (fs * win_norm);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(nperseg);

    let n_bins = nperseg / 2 + 1;
    let mut acc = vec![Complex::new(0.0, 0.0); n_bins];
    let mut n_segments = 0usize;
    let mut buf_x = vec![Complex::new(0.0, 0.0); nperseg];
    let mut buf_y = vec![Complex::new(0.0, 0.0); nperseg];

    let mut start = 0;
    while start + nperseg <= len {
        let seg_x = &x[start..start + nperseg];
        let seg_y = &y[start..start + nperseg];
        let mean_x = seg_x.iter().sum::<f64>() / nperseg as f64;
        let mean_y = seg_y.iter().sum::<f64>() / nperseg as f64;
        for k in 0..nperseg {
            buf_x[k] = Complex::new((seg_x[k] - mean_x) * window[k], 0.0);
            buf_y[k] = Complex::new((seg_y[k] - mean_y) * window[k], 0.0);
        }
        fft.process(&mut buf_x);
        fft.process(&mut buf_y);
        for k in 0..n_bins {
            acc[k] += buf_x[k].conj() * buf_y[k];
        }
        n_segments += 1;
        start += step;
    }

    if n_segments == 0 {
        tracing::warn!(len, nperseg, "signal shorter than one spectral segment");
        return None;
    }

    let nyquist_bin = if nperseg % 2 == 0 { Some(n_bins - 1) } else { None };
    let mut spectrum = Vec::with_capacity(n_bins);
    for (k, value) in acc.into_iter().enumerate() {
        let mut s = value * scale / n_segments as f64;
        if k != 0 && Some(k) != nyquist_bin {
            s *= 2.0;
        }
        spectrum.push(s);
    }
    let freqs = (0..n_bins).map(|k| k as f64 * fs / nperseg as f64).collect();
    Some((freqs, spectrum))
}

/// Welch power spectral density estimate.
///
/// Returns `None` (with a warning) for signals too short to fill one
/// segment after `nperseg` is capped at the signal length.
pub fn welch_psd(signal: &[f64], fs: f64, nperseg: usize) -> Option<Psd> {
    let (freqs, spectrum) = csd(signal, signal, fs, nperseg)?;
    Some(Psd {
        freqs,
        power: spectrum.into_iter().map(|c| c.re).collect(),
    })
}

/// Magnitude-squared coherence on Welch cross/auto spectra.
///
/// Segment length is `min(1024, len)`; frequencies where either auto
/// spectrum vanishes get coherence zero.
pub fn coherence(x: &[f64], y: &[f64], fs: f64) -> Option<(Vec<f64>, Vec<f64>)> {
    let nperseg = 1024.min(x.len().min(y.len()));
    let (freqs, pxy) = csd(x, y, fs, nperseg)?;
    let (_, pxx) = csd(x, x, fs, nperseg)?;
    let (_, pyy) = csd(y, y, fs, nperseg)?;
    let cxy = pxy
        .iter()
        .zip(pxx.iter().zip(pyy.iter()))
        .map(|(xy, (xx, yy))| {
            let denom = xx.re * yy.re;
            if denom > 0.0 {
                xy.norm_sqr() / denom
            } else {
                0.0
            }
        })
        .collect();
    Some((freqs, cxy))
}

// ============================================================================
// BAND POWER
// ============================================================================

/// Floor for integrated band power, so log-scale comparisons stay finite
pub const BAND_POWER_FLOOR: f64 = 1e-10;

/// Canonical EEG-style bands (name, low Hz, high Hz)
pub const BANDS: [(&str, f64, f64); 5] = [
    ("delta", 1.0, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 100.0),
];

/// Rectangle-rule integral of the PSD over `[lo, hi]`, floored.
///
/// Band edges are inclusive on both sides, so a bin sitting exactly on a
/// boundary (4, 8, 13, 30, 100 Hz) counts toward both adjacent bands.
pub fn band_power(psd: &Psd, lo: f64, hi: f64) -> f64 {
    let df = psd.df();
    let total: f64 = psd
        .freqs
        .iter()
        .zip(psd.power.iter())
        .filter(|(&f, _)| f >= lo && f <= hi)
        .map(|(_, &p)| p * df)
        .sum();
    total.max(BAND_POWER_FLOOR)
}

/// All canonical band powers keyed by band name
pub fn band_powers(psd: &Psd) -> BTreeMap<String, f64> {
    BANDS
        .iter()
        .map(|&(name, lo, hi)| (name.to_string(), band_power(psd, lo, hi)))
        .collect()
}

/// Analysis window for band decomposition (seconds)
pub const ANALYSIS_WINDOW: f64 = 2.0;

/// Band decomposition over the fixed analysis window.
///
/// A signal shorter than one window yields `None` after a warning; the
/// caller treats it as a gap, not a failure.
pub fn band_power_decomposition(signal: &[f64], fs: f64) -> Option<BTreeMap<String, f64>> {
    let nperseg = (ANALYSIS_WINDOW * fs) as usize;
    if signal.len() < nperseg {
        tracing::warn!(
            len = signal.len(),
            needed = nperseg,
            "signal shorter than the analysis window, skipping band decomposition"
        );
        return None;
    }
    let psd = welch_psd(signal, fs, nperseg)?;
    Some(band_powers(&psd))
}

// ============================================================================
// KOLMOGOROV-SMIRNOV TEST
// ============================================================================

/// Two-sample KS outcome
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KsResult {
    pub statistic: f64,
    pub p_value: f64,
}

/// Asymptotic KS survival function Q_KS(lambda) = 2 sum (-1)^(j-1) exp(-2 j^2 lambda^2)
fn ks_survival(lambda: f64) -> f64 {
    if lambda < 1e-8 {
        return 1.0;
    }
    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut term_prev = 0.0f64;
    for j in 1..=100 {
        let term = fac * (a2 * (j * j) as f64).exp();
        sum += term;
        if term.abs() <= 0.001 * term_prev || term.abs() <= 1e-8 * sum.abs() {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        term_prev = term.abs();
    }
    1.0
}

/// Two-sample Kolmogorov-Smirnov test with the asymptotic p-value.
///
/// `None` (with a warning) when either sample is empty. The p-value uses the
/// effective size `n1 n2 / (n1 + n2)` and the standard small-sample
/// correction of the asymptotic distribution.
pub fn ks_two_sample(sample1: &[f64], sample2: &[f64]) -> Option<KsResult> {
    if sample1.is_empty() || sample2.is_empty() {
        tracing::warn!(
            n1 = sample1.len(),
            n2 = sample2.len(),
            "KS test needs both samples non-empty"
        );
        return None;
    }

    let mut a = sample1.to_vec();
    let mut b = sample2.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n1, n2) = (a.len(), b.len());

    // Merge walk over both empirical CDFs
    let mut d: f64 = 0.0;
    let (mut i, mut j) = (0usize, 0usize);
    while i < n1 && j < n2 {
        let (x1, x2) = (a[i], b[j]);
        if x1 <= x2 {
            i += 1;
        }
        if x2 <= x1 {
            j += 1;
        }
        let diff = (i as f64 / n1 as f64 - j as f64 / n2 as f64).abs();
        d = d.max(diff);
    }

    let en = (n1 as f64 * n2 as f64) / (n1 + n2) as f64;
    let sqrt_en = en.sqrt();
    let lambda = (sqrt_en + 0.12 + 0.11 / sqrt_en) * d;
    Some(KsResult {
        statistic: d,
        p_value: ks_survival(lambda),
    })
}

// ============================================================================
// FIELD POTENTIAL PROXIES
// ============================================================================

/// LFP proxy from synaptic input accumulators: per-step mean over neurons,
/// scaled by the 1 mV reference so the trace is order-one
pub fn lfp_from_currents(series: &[Vec<f64>]) -> Vec<f64> {
    population_mean(series).into_iter().map(|v| v / 1e-3).collect()
}

/// LFP proxy from membrane potentials: per-step mean voltage in millivolts
pub fn lfp_from_voltages(series: &[Vec<f64>]) -> Vec<f64> {
    population_mean(series).into_iter().map(|v| v * 1e3).collect()
}

fn population_mean(series: &[Vec<f64>]) -> Vec<f64> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    let len = series.iter().map(|s| s.len()).min().unwrap_or(0);
    let mut mean = vec![0.0; len];
    for row in series {
        for (k, &v) in row[..len].iter().enumerate() {
            mean[k] += v;
        }
    }
    for v in mean.iter_mut() {
        *v /= n as f64;
    }
    mean
}

// ============================================================================
// COGNITIVE STATE CLASSIFIER
// ============================================================================

/// Coarse activity regime derived from band powers and the mean rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CognitiveState {
    Focused,
    Resting,
    Distracted,
    Unknown,
}

impl std::fmt::Display for CognitiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CognitiveState::Focused => "focused",
            CognitiveState::Resting => "resting",
            CognitiveState::Distracted => "distracted",
            CognitiveState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Classify from theta/gamma power and the population mean rate (Hz).
///
/// Either power missing yields `Unknown`. Theta dominance with an active
/// population reads as focused; a near-silent population as resting;
/// anything else as distracted.
pub fn classify_state(theta: Option<f64>, gamma: Option<f64>, mean_rate: f64) -> CognitiveState {
    let (theta, gamma) = match (theta, gamma) {
        (Some(t), Some(g)) => (t, g),
        _ => return CognitiveState::Unknown,
    };
    if theta > gamma && mean_rate > 10.0 {
        CognitiveState::Focused
    } else if mean_rate < 2.0 {
        CognitiveState::Resting
    } else {
        CognitiveState::Distracted
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, duration: f64) -> Vec<f64> {
        let n = (duration * fs) as usize;
        (0..n)
            .map(|k| (2.0 * std::f64::consts::PI * freq * k as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn isi_drops_silence_and_single_spikes() {
        let mut trains = BTreeMap::new();
        trains.insert(0u64, vec![0.1, 0.2, 0.4, 2.0]);
        trains.insert(1u64, vec![0.5]);
        trains.insert(2u64, vec![]);
        let isis = isi_intervals(&trains);
        assert_eq!(isis.len(), 2);
        assert!((isis[0] - 0.1).abs() < 1e-12);
        assert!((isis[1] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn mean_rate_counts_all_trains() {
        let mut trains = BTreeMap::new();
        trains.insert(0u64, vec![0.1, 0.2, 0.3, 0.4]);
        trains.insert(1u64, vec![]);
        // 4 spikes over 2 neurons and 2 seconds
        assert!((mean_firing_rate(&trains, 2.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn welch_peak_lands_on_the_driving_frequency() {
        let signal = sine(10.0, 1000.0, 4.0);
        let psd = welch_psd(&signal, 1000.0, 1024).unwrap();
        let peak = psd.peak_frequency().unwrap();
        assert!((peak - 10.0).abs() < 1.0, "peak at {peak} Hz");

        // Everything away from the drive sits orders of magnitude below it
        let peak_power = psd.power.iter().cloned().fold(0.0, f64::max);
        for (&f, &p) in psd.freqs.iter().zip(psd.power.iter()) {
            if (f - 10.0).abs() > 2.0 {
                assert!(p < peak_power / 100.0, "sidelobe at {f} Hz: {p}");
            }
        }
    }

    #[test]
    fn band_edge_bin_counts_toward_the_band() {
        // 100 Hz lands exactly on a bin (df = 0.5 Hz with the 2 s window)
        // and sits on the gamma upper edge; the inclusive mask keeps the
        // center bin, so gamma recovers most of the sine's 0.5 variance
        let signal = sine(100.0, 1000.0, 4.0);
        let bands = band_power_decomposition(&signal, 1000.0).unwrap();
        assert!(bands["gamma"] > 0.4, "gamma captured only {}", bands["gamma"]);
        assert!(bands["theta"] < 1e-3);
    }

    #[test]
    fn band_decomposition_requires_a_full_window() {
        let short = sine(10.0, 1000.0, 1.0);
        assert!(band_power_decomposition(&short, 1000.0).is_none());
        let long = sine(10.0, 1000.0, 4.0);
        assert!(band_power_decomposition(&long, 1000.0).is_some());
    }

    #[test]
    fn welch_integral_recovers_signal_variance() {
        // Unit sine has variance 1/2; a density-scaled PSD integrates to it
        let signal = sine(25.0, 1000.0, 4.0);
        let psd = welch_psd(&signal, 1000.0, 1024).unwrap();
        let total: f64 = psd.power.iter().map(|p| p * psd.df()).sum();
        assert!((total - 0.5).abs() < 0.05, "integrated power {total}");
    }

    #[test]
    fn too_short_signal_yields_none() {
        assert!(welch_psd(&[1.0], 1000.0, 1024).is_none());
        assert!(welch_psd(&[], 1000.0, 1024).is_none());
    }

    #[test]
    fn band_power_separates_theta_from_gamma() {
        let signal = sine(6.0, 1000.0, 8.0);
        let psd = welch_psd(&signal, 1000.0, 1024).unwrap();
        let powers = band_powers(&psd);
        assert!(powers["theta"] > 100.0 * powers["gamma"]);
        // An empty band floors instead of reading zero
        assert!(powers["gamma"] >= BAND_POWER_FLOOR);
    }

    #[test]
    fn ks_detects_disjoint_samples() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![10.0, 20.0, 30.0];
        let result = ks_two_sample(&a, &b).unwrap();
        assert!((result.statistic - 1.0).abs() < 1e-12);
        assert!(result.p_value < 0.05);
    }

    #[test]
    fn ks_accepts_identical_samples() {
        let a: Vec<f64> = (0..200).map(|k| k as f64 * 0.01).collect();
        let result = ks_two_sample(&a, &a).unwrap();
        assert!(result.statistic < 1e-12);
        assert!((result.p_value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ks_empty_sample_yields_none() {
        assert!(ks_two_sample(&[], &[1.0]).is_none());
        assert!(ks_two_sample(&[1.0], &[]).is_none());
    }

    #[test]
    fn self_coherence_is_unity() {
        let signal = sine(12.0, 1000.0, 4.0);
        let (_, cxy) = coherence(&signal, &signal, 1000.0).unwrap();
        for &c in cxy.iter().skip(1).take(cxy.len() - 2) {
            assert!((c - 1.0).abs() < 1e-6, "coherence {c}");
        }
    }

    #[test]
    fn lfp_proxies_average_over_neurons() {
        let v = vec![vec![-0.070, -0.060], vec![-0.050, -0.040]];
        let lfp = lfp_from_voltages(&v);
        assert!((lfp[0] - (-60.0)).abs() < 1e-9);
        assert!((lfp[1] - (-50.0)).abs() < 1e-9);

        let i = vec![vec![0.001, 0.002], vec![0.003, 0.0]];
        let lfp = lfp_from_currents(&i);
        assert!((lfp[0] - 2.0).abs() < 1e-9);
        assert!((lfp[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn state_classification_covers_all_regimes() {
        assert_eq!(classify_state(None, Some(1.0), 20.0), CognitiveState::Unknown);
        assert_eq!(classify_state(Some(1.0), None, 20.0), CognitiveState::Unknown);
        assert_eq!(
            classify_state(Some(2.0), Some(1.0), 15.0),
            CognitiveState::Focused
        );
        assert_eq!(
            classify_state(Some(1.0), Some(2.0), 1.0),
            CognitiveState::Resting
        );
        assert_eq!(
            classify_state(Some(1.0), Some(2.0), 5.0),
            CognitiveState::Distracted
        );
        // Theta dominance without enough activity is not focus
        assert_eq!(
            classify_state(Some(2.0), Some(1.0), 5.0),
            CognitiveState::Distracted
        );
    }
}
