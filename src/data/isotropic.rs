//! Random isotropic spectra

use rand::Rng;

use super::lineshape::{render_peaks, ComplexSpectrum, Peak, PeakSet};
use super::params::{uniform, IsoPars, WeightedRanges};
use crate::{IsoNetError, Result};

/// Maximum frequency draws per peak before giving up on the separation constraint
pub const MAX_PEAK_DRAWS: usize = 1_000;

/// An isotropic reference spectrum with the peaks it was rendered from
#[derive(Debug, Clone)]
pub struct IsotropicSpectrum {
    pub peaks: PeakSet,
    pub spectrum: ComplexSpectrum,
}

impl IsotropicSpectrum {
    pub fn td(&self) -> usize {
        self.spectrum.len()
    }
}

/// Draws peak sets and renders them on the configured axis
#[derive(Debug, Clone)]
pub struct LineshapeSampler {
    pars: IsoPars,
    linewidths: WeightedRanges,
}

impl LineshapeSampler {
    pub fn new(pars: IsoPars) -> Result<Self> {
        pars.validate()?;
        let linewidths = pars.linewidths()?;
        Ok(LineshapeSampler { pars, linewidths })
    }

    pub fn pars(&self) -> &IsoPars {
        &self.pars
    }

    /// Draw a random peak set
    ///
    /// Frequencies are redrawn whenever they fall closer than `spread` to an
    /// existing peak. Fails with [`IsoNetError::Generation`] once a single
    /// peak exceeds [`MAX_PEAK_DRAWS`] attempts.
    pub fn sample_peaks<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<PeakSet> {
        let p = &self.pars;
        let n = rng.random_range(p.nmin..=p.nmax);
        let mut peaks: Vec<Peak> = Vec::with_capacity(n);

        for i in 0..n {
            let mut attempts = 0;
            let freq = loop {
                if attempts == MAX_PEAK_DRAWS {
                    return Err(IsoNetError::Generation {
                        attempts,
                        message: format!(
                            "could not place peak {} of {} at least {} Hz from its neighbours",
                            i + 1,
                            n,
                            p.spread
                        ),
                    });
                }
                attempts += 1;
                let f = uniform(rng, p.freq_range[0], p.freq_range[1]);
                if peaks.iter().all(|q| (q.freq - f).abs() >= p.spread) {
                    break f;
                }
            };

            peaks.push(Peak {
                freq,
                lw: self.linewidths.sample(rng),
                intensity: uniform(rng, p.int_range[0], p.int_range[1]),
                gauss: uniform(rng, p.gmin, p.gmax),
                phase: p.phase,
            });
        }

        let peaks = PeakSet::new(peaks);
        if p.debug {
            log::debug!("Isotropic peaks: {:?}", peaks.peaks);
        }
        Ok(peaks)
    }

    /// Render a peak set on this sampler's axis
    pub fn render(&self, peaks: PeakSet) -> IsotropicSpectrum {
        let spectrum = render_peaks(peaks.iter(), self.pars.td, self.pars.fs, self.pars.norm_height);
        IsotropicSpectrum { peaks, spectrum }
    }

    /// Draw and render a new isotropic spectrum
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<IsotropicSpectrum> {
        let peaks = self.sample_peaks(rng)?;
        Ok(self.render(peaks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_peak_count_and_separation() {
        let pars = IsoPars {
            nmin: 2,
            nmax: 8,
            spread: 150.0,
            ..IsoPars::default()
        };
        let sampler = LineshapeSampler::new(pars.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..200 {
            let iso = sampler.generate(&mut rng).unwrap();
            assert!(iso.peaks.len() >= pars.nmin && iso.peaks.len() <= pars.nmax);
            if let Some(sep) = iso.peaks.min_separation() {
                assert!(sep >= pars.spread, "separation {} < spread", sep);
            }
            for p in iso.peaks.iter() {
                assert!(p.freq >= pars.freq_range[0] && p.freq <= pars.freq_range[1]);
                assert!(p.intensity >= pars.int_range[0] && p.intensity <= pars.int_range[1]);
                assert!(p.lw >= 50.0 && p.lw <= 1_000.0);
            }
            assert_eq!(iso.td(), pars.td);
        }
    }

    #[test]
    fn test_generation_error_when_separation_unreachable() {
        // Passes config validation (spread * (nmax - 1) == width) but is
        // practically impossible to hit with continuous draws
        let pars = IsoPars {
            nmin: 3,
            nmax: 3,
            freq_range: [1_000.0, 1_200.0],
            spread: 100.0,
            ..IsoPars::default()
        };
        let sampler = LineshapeSampler::new(pars).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        let err = sampler.sample_peaks(&mut rng).unwrap_err();
        match err {
            IsoNetError::Generation { attempts, .. } => assert_eq!(attempts, MAX_PEAK_DRAWS),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_single_peak_render_height() {
        let pars = IsoPars {
            nmin: 1,
            nmax: 1,
            int_range: [0.7, 0.7],
            ..IsoPars::default()
        };
        let sampler = LineshapeSampler::new(pars).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let iso = sampler.generate(&mut rng).unwrap();
        assert_eq!(iso.peaks.len(), 1);
        assert!(iso.spectrum.max_abs_real() <= 0.7 + 1e-6);
        assert!(iso.spectrum.max_abs_real() > 0.0);
    }
}
