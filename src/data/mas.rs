//! MAS-rate-dependent spectra
//!
//! Every peak of the isotropic spectrum is broadened, shifted and split by
//! terms scaling with 1/w (first order) and 1/w² (second order) of the
//! spinning rate w. Coefficients are drawn once per sample so the stack is a
//! coherent series; jitter and noise are drawn per spinning condition.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::isotropic::IsotropicSpectrum;
use super::lineshape::{render_peaks, ComplexSpectrum, Peak};
use super::params::{uniform, DataPars, MasMixtures, MasPars, NoiseLevels, Trend};
use crate::Result;

/// Rate-dependent coefficients of a single peak
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakCoefficients {
    pub lw1: f64,
    pub m1: f64,
    pub s1: f64,
    pub lw2: f64,
    pub m2: f64,
    pub s2: f64,
}

/// One spinning rate and the per-condition draws attached to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpinningCondition {
    /// MAS rate in Hz
    pub rate: f64,
    /// Additional zero-order phase (radians)
    pub phase: f64,
    /// Relative linewidth factor, 1 when no jitter
    pub lw_jitter: f64,
    /// Shift jitter in Hz
    pub shift_jitter: f64,
    /// Intensity factor from rate-dependent decay
    pub intensity_scale: f64,
    /// Rate-independent shift in units of the isotropic linewidth
    pub trend: f64,
    /// First-order sideband intensity relative to the centre band, 0 for none
    pub sideband: f64,
    pub sideband_order: usize,
}

impl SpinningCondition {
    /// Condition with no jitter, decay or trend
    pub fn ideal(rate: f64) -> Self {
        SpinningCondition {
            rate,
            phase: 0.0,
            lw_jitter: 1.0,
            shift_jitter: 0.0,
            intensity_scale: 1.0,
            trend: 0.0,
            sideband: 0.0,
            sideband_order: 0,
        }
    }
}

/// Apply the MAS transform to one isotropic peak
///
/// Returns one line, or two half-intensity lines when the splitting is
/// non-zero, each followed by its spinning sidebands at `±n·w` when the
/// condition carries any. Negative linewidths and intensities are clamped
/// to zero.
pub fn apply(peak: &Peak, c: &PeakCoefficients, cond: &SpinningCondition) -> Vec<Peak> {
    let w = cond.rate;
    let w2 = w * w;

    let lw = ((peak.lw + c.lw1 / w + c.lw2 / w2) * cond.lw_jitter).max(0.0);
    let freq = peak.freq + c.m1 / w + c.m2 / w2 + cond.trend * peak.lw + cond.shift_jitter;
    let split = c.s1 / w + c.s2 / w2;
    let intensity = (peak.intensity * cond.intensity_scale).max(0.0);
    let phase = peak.phase + cond.phase;

    let line = Peak {
        freq,
        lw,
        intensity,
        gauss: peak.gauss,
        phase,
    };
    let centre = if split == 0.0 {
        vec![line]
    } else {
        let half = Peak {
            intensity: 0.5 * intensity,
            ..line
        };
        vec![
            Peak {
                freq: freq - 0.5 * split,
                ..half
            },
            Peak {
                freq: freq + 0.5 * split,
                ..half
            },
        ]
    };

    if cond.sideband <= 0.0 || cond.sideband_order == 0 {
        return centre;
    }

    let mut lines = Vec::with_capacity(centre.len() * (1 + 2 * cond.sideband_order));
    for band in centre {
        lines.push(band);
        let mut weight = 1.0;
        for n in 1..=cond.sideband_order {
            weight *= cond.sideband;
            let offset = n as f64 * w;
            for f in [band.freq - offset, band.freq + offset] {
                lines.push(Peak {
                    freq: f,
                    intensity: band.intensity * weight,
                    ..band
                });
            }
        }
    }
    lines
}

/// `nw` MAS spectra sharing the axis of their isotropic source
#[derive(Debug, Clone)]
pub struct MasSpectrumStack {
    pub conditions: Vec<SpinningCondition>,
    pub spectra: Vec<ComplexSpectrum>,
}

impl MasSpectrumStack {
    pub fn rates(&self) -> Vec<f64> {
        self.conditions.iter().map(|c| c.rate).collect()
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R, std: f64) -> f64 {
    if std > 0.0 {
        let z: f64 = StandardNormal.sample(rng);
        std * z
    } else {
        0.0
    }
}

/// Generates MAS spectrum stacks from isotropic spectra
#[derive(Debug, Clone)]
pub struct MasSynthesizer {
    pars: MasPars,
    mixtures: MasMixtures,
    noise: NoiseLevels,
    fs: f64,
    norm_height: bool,
    mas_spec_norm: f64,
}

impl MasSynthesizer {
    pub fn new(data: &DataPars) -> Result<Self> {
        data.mas_pars.validate()?;
        Ok(MasSynthesizer {
            mixtures: data.mas_pars.mixtures()?,
            pars: data.mas_pars.clone(),
            noise: data.noise_levels(),
            fs: data.iso_pars.fs,
            norm_height: data.iso_pars.norm_height,
            mas_spec_norm: data.mas_spec_norm,
        })
    }

    pub fn pars(&self) -> &MasPars {
        &self.pars
    }

    /// Spinning rates for one sample, ascending
    pub fn sample_rates<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let [lo, hi] = self.pars.mas_w_range;
        let nw = self.pars.nw;
        if self.pars.random_mas {
            let mut rates: Vec<f64> = (0..nw).map(|_| uniform(rng, lo, hi)).collect();
            rates.sort_by(|a, b| a.total_cmp(b));
            rates
        } else if nw == 1 {
            vec![lo]
        } else {
            (0..nw)
                .map(|i| lo + (hi - lo) * i as f64 / (nw - 1) as f64)
                .collect()
        }
    }

    pub fn sample_coefficients<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        second_order: bool,
    ) -> PeakCoefficients {
        let m = &self.mixtures;
        let mut c = PeakCoefficients {
            lw1: m.lw1.sample(rng),
            m1: m.m1.sample(rng),
            s1: m.s1.sample(rng),
            ..PeakCoefficients::default()
        };
        if second_order {
            c.lw2 = m.lw2.sample(rng);
            c.m2 = m.m2.sample(rng);
            c.s2 = m.s2.sample(rng);
        }
        c
    }

    /// Draw the per-condition parameters for the given rates
    pub fn sample_conditions<R: Rng + ?Sized>(&self, rng: &mut R, rates: &[f64]) -> Vec<SpinningCondition> {
        let p = &self.pars;
        let [lo, hi] = p.mas_w_range;

        let trend = if rng.random_bool(p.non_mas_p) {
            self.mixtures.trends.as_ref().map(|index| {
                let kind: Trend = p.non_mas_m_trends[index.sample(rng)];
                let amplitude = uniform(rng, p.non_mas_m_range[0], p.non_mas_m_range[1]);
                (kind, amplitude)
            })
        } else {
            None
        };

        let decrease = if rng.random_bool(p.int_decrease_p) {
            Some(uniform(rng, p.int_decrease_scale[0], p.int_decrease_scale[1]))
        } else {
            None
        };

        // Sidebands weaken as (lo / w)² with faster spinning
        let sideband = if rng.random_bool(p.sideband_p) {
            uniform(rng, p.sideband_int_range[0], p.sideband_int_range[1])
        } else {
            0.0
        };

        rates
            .iter()
            .map(|&rate| {
                let u = if hi > lo {
                    ((rate - lo) / (hi - lo)).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let phase = if rng.random_bool(p.mas_phase_p) {
                    gaussian(rng, p.mas_phase_scale * std::f64::consts::PI)
                } else {
                    0.0
                };
                SpinningCondition {
                    rate,
                    phase,
                    lw_jitter: 1.0 + gaussian(rng, self.noise.mas_l_noise),
                    shift_jitter: gaussian(rng, self.noise.mas_s_noise),
                    intensity_scale: decrease.map_or(1.0, |d| 1.0 - (1.0 - d) * u),
                    trend: trend.map_or(0.0, |(kind, a)| a * kind.profile(u)),
                    sideband: sideband * (lo / rate).powi(2),
                    sideband_order: p.sideband_order,
                }
            })
            .collect()
    }

    /// Render the stack for explicit coefficients and conditions, without noise or normalization
    pub fn render(
        &self,
        iso: &IsotropicSpectrum,
        coefficients: &[PeakCoefficients],
        conditions: &[SpinningCondition],
    ) -> Vec<ComplexSpectrum> {
        let td = iso.td();
        conditions
            .iter()
            .map(|cond| {
                let lines: Vec<Peak> = iso
                    .peaks
                    .iter()
                    .zip(coefficients)
                    .flat_map(|(peak, c)| apply(peak, c, cond))
                    .collect();
                render_peaks(lines.iter(), td, self.fs, self.norm_height)
            })
            .collect()
    }

    /// Generate a full MAS spectrum stack for an isotropic spectrum
    pub fn generate<R: Rng + ?Sized>(&self, iso: &IsotropicSpectrum, rng: &mut R) -> MasSpectrumStack {
        let rates = self.sample_rates(rng);
        let second_order = rng.random_bool(self.pars.mas2_prob);
        let coefficients: Vec<PeakCoefficients> = iso
            .peaks
            .iter()
            .map(|_| self.sample_coefficients(rng, second_order))
            .collect();
        let conditions = self.sample_conditions(rng, &rates);

        if self.pars.debug {
            log::debug!("MAS coefficients: {:?}", coefficients);
            log::debug!("Spinning conditions: {:?}", conditions);
        }

        let mut spectra = self.render(iso, &coefficients, &conditions);

        if self.noise.noise > 0.0 {
            for spec in spectra.iter_mut() {
                for v in spec.real.iter_mut().chain(spec.imag.iter_mut()) {
                    *v += gaussian(rng, self.noise.noise) as f32;
                }
            }
        }

        let max = spectra.iter().fold(0.0f32, |m, s| m.max(s.max_abs_real()));
        if max > 0.0 {
            let factor = self.mas_spec_norm as f32 / max;
            spectra.iter_mut().for_each(|s| s.scale(factor));
        }

        MasSpectrumStack {
            conditions,
            spectra,
        }
    }
}
