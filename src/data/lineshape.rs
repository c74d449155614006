//! Peak lineshapes and spectrum rendering
//!
//! Peaks are pseudo-Voigt profiles: a Gaussian/Lorentzian mixture with a
//! complex (absorptive + dispersive) component so that zero-order phase
//! errors can be represented.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A single spectral line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Position in Hz
    pub freq: f64,
    /// Full width at half maximum in Hz
    pub lw: f64,
    /// Relative weight of the line
    pub intensity: f64,
    /// Gaussian fraction of the profile, in [0, 1]
    pub gauss: f64,
    /// Zero-order phase in radians
    pub phase: f64,
}

/// Ordered set of peaks making up a spectrum
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakSet {
    pub peaks: Vec<Peak>,
}

impl PeakSet {
    pub fn new(mut peaks: Vec<Peak>) -> Self {
        peaks.sort_by(|a, b| a.freq.total_cmp(&b.freq));
        PeakSet { peaks }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Peak> {
        self.peaks.iter()
    }

    /// Smallest distance between two peak frequencies, if there are two peaks
    pub fn min_separation(&self) -> Option<f64> {
        self.peaks
            .windows(2)
            .map(|w| (w[1].freq - w[0].freq).abs())
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Real and imaginary parts of a rendered spectrum
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSpectrum {
    pub real: Vec<f32>,
    pub imag: Vec<f32>,
}

impl ComplexSpectrum {
    pub fn zeros(td: usize) -> Self {
        ComplexSpectrum {
            real: vec![0.0; td],
            imag: vec![0.0; td],
        }
    }

    pub fn len(&self) -> usize {
        self.real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }

    /// Maximum absolute value of the real part
    pub fn max_abs_real(&self) -> f32 {
        self.real.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    pub fn scale(&mut self, factor: f32) {
        self.real.iter_mut().for_each(|v| *v *= factor);
        self.imag.iter_mut().for_each(|v| *v *= factor);
    }
}

/// Dawson's integral F(x) = exp(-x²) ∫₀ˣ exp(t²) dt (Rybicki's method)
pub fn dawson(x: f64) -> f64 {
    const H: f64 = 0.4;
    const A1: f64 = 2.0 / 3.0;
    const A2: f64 = 0.4;
    const A3: f64 = 2.0 / 7.0;
    const NMAX: usize = 6;

    if x.abs() < 0.2 {
        let x2 = x * x;
        return x * (1.0 - A1 * x2 * (1.0 - A2 * x2 * (1.0 - A3 * x2)));
    }

    let xx = x.abs();
    let n0 = 2.0 * (0.5 * xx / H + 0.5).floor();
    let xp = xx - n0 * H;
    let mut e1 = (2.0 * xp * H).exp();
    let e2 = e1 * e1;
    let mut d1 = n0 + 1.0;
    let mut d2 = d1 - 2.0;
    let mut sum = 0.0;
    for i in 0..NMAX {
        let c = (-((2.0 * i as f64 + 1.0) * H).powi(2)).exp();
        sum += c * (e1 / d1 + 1.0 / (d2 * e1));
        d1 += 2.0;
        d2 -= 2.0;
        e1 *= e2;
    }
    (1.0 / PI.sqrt()) * (-xp * xp).exp() * sum * x.signum()
}

/// Absorptive and dispersive profile values at offset `delta` (Hz), unit absorption height
fn profile(delta: f64, lw: f64, gauss: f64) -> (f64, f64) {
    let gamma = 0.5 * lw;
    let sigma = lw / (2.0 * (2.0 * 2f64.ln()).sqrt());

    let lor_den = gamma * gamma + delta * delta;
    let lor_abs = gamma * gamma / lor_den;
    let lor_disp = gamma * delta / lor_den;

    let x = delta / (2f64.sqrt() * sigma);
    let gau_abs = (-x * x).exp();
    let gau_disp = 2.0 / PI.sqrt() * dawson(x);

    (
        gauss * gau_abs + (1.0 - gauss) * lor_abs,
        gauss * gau_disp + (1.0 - gauss) * lor_disp,
    )
}

/// Area under a unit-height profile
fn profile_area(lw: f64, gauss: f64) -> f64 {
    let gamma = 0.5 * lw;
    let sigma = lw / (2.0 * (2.0 * 2f64.ln()).sqrt());
    gauss * sigma * (2.0 * PI).sqrt() + (1.0 - gauss) * PI * gamma
}

/// Add a single peak onto `spec`, sampled at `f_k = k * fs / td`
///
/// With `norm_height` the line has absorption height `intensity`; otherwise
/// it has area `intensity`. A non-positive linewidth collapses the line onto
/// its nearest grid point.
pub fn render_peak(spec: &mut ComplexSpectrum, peak: &Peak, fs: f64, norm_height: bool) {
    let td = spec.len();
    if td == 0 {
        return;
    }
    let df = fs / td as f64;
    let (cos_p, sin_p) = (peak.phase.cos(), peak.phase.sin());

    if peak.lw <= 0.0 {
        let k = (peak.freq / df).round();
        if k >= 0.0 && (k as usize) < td {
            let k = k as usize;
            let height = if norm_height { peak.intensity } else { peak.intensity / df };
            spec.real[k] += (height * cos_p) as f32;
            spec.imag[k] += (height * sin_p) as f32;
        }
        return;
    }

    let scale = if norm_height {
        peak.intensity
    } else {
        peak.intensity / profile_area(peak.lw, peak.gauss)
    };

    for k in 0..td {
        let delta = k as f64 * df - peak.freq;
        let (a, d) = profile(delta, peak.lw, peak.gauss);
        spec.real[k] += (scale * (a * cos_p - d * sin_p)) as f32;
        spec.imag[k] += (scale * (a * sin_p + d * cos_p)) as f32;
    }
}

/// Superpose all peaks on a `td`-point axis spanning `fs` Hz
pub fn render_peaks<'a, I>(peaks: I, td: usize, fs: f64, norm_height: bool) -> ComplexSpectrum
where
    I: IntoIterator<Item = &'a Peak>,
{
    let mut spec = ComplexSpectrum::zeros(td);
    for peak in peaks {
        render_peak(&mut spec, peak, fs, norm_height);
    }
    spec
}

/// Taper both ends of a spectrum with a half-cosine ramp of `len` points
pub fn smooth_ends(values: &mut [f32], len: usize) {
    let n = values.len();
    let len = len.min(n / 2);
    for i in 0..len {
        let w = (0.5 * (1.0 - (PI * i as f64 / len as f64).cos())) as f32;
        values[i] *= w;
        values[n - 1 - i] *= w;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn peak(freq: f64, lw: f64, gauss: f64) -> Peak {
        Peak {
            freq,
            lw,
            intensity: 1.0,
            gauss,
            phase: 0.0,
        }
    }

    #[test]
    fn test_dawson_reference_values() {
        assert_abs_diff_eq!(dawson(0.0), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dawson(0.1), 0.099_335, epsilon = 1e-5);
        assert_abs_diff_eq!(dawson(0.5), 0.424_436, epsilon = 1e-5);
        assert_abs_diff_eq!(dawson(0.924_14), 0.541_044, epsilon = 1e-5);
        assert_abs_diff_eq!(dawson(2.0), 0.301_340, epsilon = 1e-5);
        assert_abs_diff_eq!(dawson(-2.0), -0.301_340, epsilon = 1e-5);
    }

    #[test]
    fn test_unit_height_peak_on_grid() {
        for gauss in [0.0, 0.5, 1.0] {
            let spec = render_peaks(&[peak(1_000.0, 100.0, gauss)], 128, 3_200.0, true);
            // 1000 Hz is grid point 40 at 25 Hz spacing
            assert_abs_diff_eq!(spec.real[40], 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(spec.imag[40], 0.0, epsilon = 1e-6);
            assert!(spec.real.iter().all(|v| *v <= 1.0 + 1e-6));
        }
    }

    #[test]
    fn test_half_width_at_half_maximum() {
        let spec = render_peaks(&[peak(1_000.0, 50.0, 0.0)], 128, 3_200.0, true);
        assert_abs_diff_eq!(spec.real[41], 0.5, epsilon = 1e-6);
        let spec = render_peaks(&[peak(1_000.0, 50.0, 1.0)], 128, 3_200.0, true);
        assert_abs_diff_eq!(spec.real[39], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_area_normalization() {
        let fs = 3_200.0;
        let td = 1_024;
        let spec = render_peaks(&[peak(1_600.0, 60.0, 1.0)], td, fs, false);
        let area: f64 = spec.real.iter().map(|v| *v as f64).sum::<f64>() * fs / td as f64;
        assert_abs_diff_eq!(area, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_phase_rotates_absorption_into_imaginary() {
        let mut p = peak(1_000.0, 100.0, 0.3);
        p.phase = std::f64::consts::FRAC_PI_2;
        let spec = render_peaks(&[p], 128, 3_200.0, true);
        assert_abs_diff_eq!(spec.real[40], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(spec.imag[40], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_linewidth_collapses_to_grid_point() {
        let spec = render_peaks(&[peak(1_010.0, 0.0, 1.0)], 128, 3_200.0, true);
        assert_eq!(spec.real[40], 1.0);
        assert_eq!(spec.real.iter().filter(|v| **v != 0.0).count(), 1);
        assert!(spec.real.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_smooth_ends() {
        let mut values = vec![1.0f32; 20];
        smooth_ends(&mut values, 4);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[19], 0.0);
        assert!(values[1] < values[2] && values[2] < values[3]);
        assert_eq!(values[4], 1.0);
        assert_eq!(values[15], 1.0);
    }

    #[test]
    fn test_peak_set_sorted_and_separation() {
        let set = PeakSet::new(vec![peak(900.0, 1.0, 0.0), peak(500.0, 1.0, 0.0), peak(700.0, 1.0, 0.0)]);
        assert_eq!(set.peaks[0].freq, 500.0);
        assert_eq!(set.min_separation(), Some(200.0));
    }
}
