//! Synthetic data parameters
//!
//! Field names follow the `data_pars.json` contract shared with inference.

use rand::Rng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

use crate::{IsoNetError, Result};

/// Mixture of uniform ranges: pick a component by weight, then draw uniformly inside it
#[derive(Debug, Clone)]
pub struct WeightedRanges {
    ranges: Vec<[f64; 2]>,
    index: WeightedIndex<f64>,
}

impl WeightedRanges {
    /// Build from a `*_range` / `*_probs` pair, naming `key` in any error
    pub fn new(key: &str, ranges: &[[f64; 2]], probs: &[f64]) -> Result<Self> {
        if ranges.is_empty() {
            return Err(IsoNetError::Config(format!("{}_range is empty", key)));
        }
        if ranges.len() != probs.len() {
            return Err(IsoNetError::Config(format!(
                "{}_range has {} components but {}_probs has {}",
                key,
                ranges.len(),
                key,
                probs.len()
            )));
        }
        if let Some(r) = ranges.iter().find(|r| r[0] > r[1] || !r[0].is_finite() || !r[1].is_finite()) {
            return Err(IsoNetError::Config(format!(
                "{}_range component [{}, {}] is not a valid interval",
                key, r[0], r[1]
            )));
        }
        let index = WeightedIndex::new(probs.iter().copied()).map_err(|e| {
            IsoNetError::Config(format!("{}_probs is not a valid weighting: {}", key, e))
        })?;

        Ok(WeightedRanges {
            ranges: ranges.to_vec(),
            index,
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let [lo, hi] = self.ranges[self.index.sample(rng)];
        uniform(rng, lo, hi)
    }

    /// Smallest lower bound across all components
    pub fn min(&self) -> f64 {
        self.ranges.iter().map(|r| r[0]).fold(f64::INFINITY, f64::min)
    }
}

/// Uniform draw that tolerates degenerate `[a, a]` intervals
pub(crate) fn uniform<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.random_range(lo..=hi)
    } else {
        lo
    }
}

fn check_interval(key: &str, r: [f64; 2]) -> Result<()> {
    if r[0] > r[1] || !r[0].is_finite() || !r[1].is_finite() {
        return Err(IsoNetError::Config(format!(
            "{} = [{}, {}] is not a valid interval",
            key, r[0], r[1]
        )));
    }
    Ok(())
}

fn check_probability(key: &str, p: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(IsoNetError::Config(format!(
            "{} = {} is not a probability",
            key, p
        )));
    }
    Ok(())
}

/// Isotropic peak generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoPars {
    /// Number of points on the frequency axis
    pub td: usize,
    /// Spectral width in Hz
    #[serde(rename = "Fs")]
    pub fs: f64,
    pub nmin: usize,
    pub nmax: usize,
    pub freq_range: [f64; 2],
    /// Gaussian fraction bounds of the pseudo-Voigt profile
    pub gmin: f64,
    pub gmax: f64,
    /// Minimum separation between peak frequencies (Hz)
    pub spread: f64,
    pub lw_range: Vec<[f64; 2]>,
    pub lw_probs: Vec<f64>,
    pub int_range: [f64; 2],
    pub norm_height: bool,
    /// Zero-order phase in radians
    pub phase: f64,
    #[serde(default)]
    pub debug: bool,
}

impl Default for IsoPars {
    fn default() -> Self {
        IsoPars {
            td: 128,
            fs: 3_200.0,
            nmin: 1,
            nmax: 5,
            freq_range: [500.0, 2_700.0],
            gmin: 1.0,
            gmax: 1.0,
            spread: 5.0,
            lw_range: vec![[5e1, 2e2], [1e2, 5e2], [1e2, 1e3]],
            lw_probs: vec![0.6, 0.2, 0.2],
            int_range: [0.1, 1.0],
            norm_height: true,
            phase: 0.0,
            debug: false,
        }
    }
}

impl IsoPars {
    pub fn validate(&self) -> Result<()> {
        if self.td < 2 {
            return Err(IsoNetError::Config(format!("iso_pars.td = {} is too small", self.td)));
        }
        if self.fs <= 0.0 {
            return Err(IsoNetError::Config(format!("iso_pars.Fs = {} must be positive", self.fs)));
        }
        if self.nmin == 0 || self.nmin > self.nmax {
            return Err(IsoNetError::Config(format!(
                "iso_pars.nmin/nmax = {}/{} is not a valid peak count range",
                self.nmin, self.nmax
            )));
        }
        check_interval("iso_pars.freq_range", self.freq_range)?;
        check_interval("iso_pars.int_range", self.int_range)?;
        check_interval("iso_pars.gmin/gmax", [self.gmin, self.gmax])?;
        if self.gmin < 0.0 || self.gmax > 1.0 {
            return Err(IsoNetError::Config(
                "iso_pars.gmin/gmax must lie within [0, 1]".to_string(),
            ));
        }
        if self.spread < 0.0 {
            return Err(IsoNetError::Config("iso_pars.spread must be non-negative".to_string()));
        }
        let width = self.freq_range[1] - self.freq_range[0];
        if self.spread * (self.nmax as f64 - 1.0) > width {
            return Err(IsoNetError::Config(format!(
                "iso_pars.spread = {} cannot fit {} peaks in freq_range of width {}",
                self.spread, self.nmax, width
            )));
        }
        self.linewidths()?;
        Ok(())
    }

    pub fn linewidths(&self) -> Result<WeightedRanges> {
        WeightedRanges::new("iso_pars.lw", &self.lw_range, &self.lw_probs)
    }

    /// Frequency of axis point `k`
    pub fn freq_at(&self, k: usize) -> f64 {
        k as f64 * self.fs / self.td as f64
    }
}

/// Shape of a rate-independent parameter trend across the spinning range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Constant,
    Increase,
    Decrease,
}

impl Trend {
    /// Trend profile at relative rate position `u` in [0, 1]
    pub fn profile(self, u: f64) -> f64 {
        match self {
            Trend::Constant => 1.0,
            Trend::Increase => u,
            Trend::Decrease => 1.0 - u,
        }
    }
}

/// MAS-dependent distortion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasPars {
    /// Number of spinning conditions per sample
    pub nw: usize,
    pub mas_w_range: [f64; 2],
    pub random_mas: bool,
    pub mas_phase_p: f64,
    pub mas_phase_scale: f64,

    pub mas1_lw_range: Vec<[f64; 2]>,
    pub mas1_lw_probs: Vec<f64>,
    pub mas1_m_range: Vec<[f64; 2]>,
    pub mas1_m_probs: Vec<f64>,
    pub mas1_s_range: Vec<[f64; 2]>,
    pub mas1_s_probs: Vec<f64>,

    pub mas2_prob: f64,
    pub mas2_lw_range: Vec<[f64; 2]>,
    pub mas2_lw_probs: Vec<f64>,
    pub mas2_m_range: Vec<[f64; 2]>,
    pub mas2_m_probs: Vec<f64>,
    pub mas2_s_range: Vec<[f64; 2]>,
    pub mas2_s_probs: Vec<f64>,

    pub non_mas_p: f64,
    pub non_mas_m_trends: Vec<Trend>,
    pub non_mas_m_probs: Vec<f64>,
    pub non_mas_m_range: [f64; 2],

    pub int_decrease_p: f64,
    pub int_decrease_scale: [f64; 2],

    /// Probability of a sample carrying spinning sidebands
    #[serde(default)]
    pub sideband_p: f64,
    /// Sidebands on each side of a line
    #[serde(default = "default_sideband_order")]
    pub sideband_order: usize,
    /// First-order sideband intensity relative to its centre band, at the slowest rate
    #[serde(default = "default_sideband_int_range")]
    pub sideband_int_range: [f64; 2],
    #[serde(default)]
    pub debug: bool,
}

fn default_sideband_order() -> usize {
    1
}

fn default_sideband_int_range() -> [f64; 2] {
    [0.0, 0.1]
}

impl Default for MasPars {
    fn default() -> Self {
        MasPars {
            nw: 12,
            mas_w_range: [50_000.0, 100_000.0],
            random_mas: true,
            mas_phase_p: 0.5,
            mas_phase_scale: 0.05,

            mas1_lw_range: vec![[1e7, 2e7], [1e7, 5e7], [5e7, 1e8]],
            mas1_lw_probs: vec![0.6, 0.3, 0.1],
            mas1_m_range: vec![[0.0, 0.0], [0.0, 1e4], [1e4, 5e4]],
            mas1_m_probs: vec![0.2, 0.2, 0.6],
            mas1_s_range: vec![[-1e7, 1e7]],
            mas1_s_probs: vec![1.0],

            mas2_prob: 1.0,
            mas2_lw_range: vec![[0.0, 0.0], [1e11, 5e11]],
            mas2_lw_probs: vec![0.5, 0.5],
            mas2_m_range: vec![[0.0, 0.0], [1e8, 5e8]],
            mas2_m_probs: vec![0.5, 0.5],
            mas2_s_range: vec![[0.0, 0.0], [-2e10, 2e10]],
            mas2_s_probs: vec![0.5, 0.5],

            non_mas_p: 0.5,
            non_mas_m_trends: vec![Trend::Constant, Trend::Increase, Trend::Decrease],
            non_mas_m_probs: vec![0.34, 0.33, 0.33],
            non_mas_m_range: [0.0, 1.0],

            int_decrease_p: 0.3,
            int_decrease_scale: [0.3, 0.7],

            sideband_p: 0.0,
            sideband_order: default_sideband_order(),
            sideband_int_range: default_sideband_int_range(),
            debug: false,
        }
    }
}

impl MasPars {
    pub fn validate(&self) -> Result<()> {
        if self.nw == 0 {
            return Err(IsoNetError::Config("mas_pars.nw must be at least 1".to_string()));
        }
        check_interval("mas_pars.mas_w_range", self.mas_w_range)?;
        if self.mas_w_range[0] <= 0.0 {
            return Err(IsoNetError::Config(
                "mas_pars.mas_w_range must contain strictly positive rates".to_string(),
            ));
        }
        check_probability("mas_pars.mas_phase_p", self.mas_phase_p)?;
        check_probability("mas_pars.mas2_prob", self.mas2_prob)?;
        check_probability("mas_pars.non_mas_p", self.non_mas_p)?;
        check_probability("mas_pars.int_decrease_p", self.int_decrease_p)?;
        check_interval("mas_pars.non_mas_m_range", self.non_mas_m_range)?;
        check_interval("mas_pars.int_decrease_scale", self.int_decrease_scale)?;
        check_probability("mas_pars.sideband_p", self.sideband_p)?;
        check_interval("mas_pars.sideband_int_range", self.sideband_int_range)?;
        if self.sideband_int_range[0] < 0.0 {
            return Err(IsoNetError::Config(
                "mas_pars.sideband_int_range must be non-negative".to_string(),
            ));
        }
        if self.non_mas_m_trends.len() != self.non_mas_m_probs.len() {
            return Err(IsoNetError::Config(
                "mas_pars.non_mas_m_trends and non_mas_m_probs differ in length".to_string(),
            ));
        }
        self.mixtures()?;
        Ok(())
    }

    pub(crate) fn mixtures(&self) -> Result<MasMixtures> {
        let trends = if self.non_mas_m_trends.is_empty() {
            None
        } else {
            Some(
                WeightedIndex::new(self.non_mas_m_probs.iter().copied()).map_err(|e| {
                    IsoNetError::Config(format!(
                        "mas_pars.non_mas_m_probs is not a valid weighting: {}",
                        e
                    ))
                })?,
            )
        };

        Ok(MasMixtures {
            lw1: WeightedRanges::new("mas_pars.mas1_lw", &self.mas1_lw_range, &self.mas1_lw_probs)?,
            m1: WeightedRanges::new("mas_pars.mas1_m", &self.mas1_m_range, &self.mas1_m_probs)?,
            s1: WeightedRanges::new("mas_pars.mas1_s", &self.mas1_s_range, &self.mas1_s_probs)?,
            lw2: WeightedRanges::new("mas_pars.mas2_lw", &self.mas2_lw_range, &self.mas2_lw_probs)?,
            m2: WeightedRanges::new("mas_pars.mas2_m", &self.mas2_m_range, &self.mas2_m_probs)?,
            s2: WeightedRanges::new("mas_pars.mas2_s", &self.mas2_s_range, &self.mas2_s_probs)?,
            trends,
        })
    }
}

/// Pre-built samplers for every MAS mixture
#[derive(Debug, Clone)]
pub(crate) struct MasMixtures {
    pub lw1: WeightedRanges,
    pub m1: WeightedRanges,
    pub s1: WeightedRanges,
    pub lw2: WeightedRanges,
    pub m2: WeightedRanges,
    pub s2: WeightedRanges,
    pub trends: Option<WeightedIndex<f64>>,
}

/// Per-condition noise levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseLevels {
    /// Additive Gaussian noise on every spectral point
    pub noise: f64,
    /// Relative linewidth jitter
    pub mas_l_noise: f64,
    /// Shift jitter in Hz
    pub mas_s_noise: f64,
}

/// Full data generation configuration (`data_pars.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPars {
    pub iso_pars: IsoPars,
    pub mas_pars: MasPars,

    pub positive_iso: bool,
    /// Encode the imaginary part of the MAS spectra as an extra channel
    pub encode_imag: bool,
    /// Encode the MAS rate as an extra channel
    pub encode_wr: bool,

    pub noise: f64,
    pub mas_l_noise: f64,
    pub mas_s_noise: f64,

    pub smooth_end_len: usize,
    pub iso_spec_norm: f64,
    pub mas_spec_norm: f64,
    pub wr_norm_factor: f64,
    /// Encode the inverse MAS rate instead of the rate
    pub wr_inv: bool,
}

impl Default for DataPars {
    fn default() -> Self {
        DataPars {
            iso_pars: IsoPars::default(),
            mas_pars: MasPars::default(),
            positive_iso: true,
            encode_imag: false,
            encode_wr: true,
            noise: 0.0,
            mas_l_noise: 0.05,
            mas_s_noise: 25.0,
            smooth_end_len: 10,
            iso_spec_norm: 1.25,
            mas_spec_norm: 0.5,
            wr_norm_factor: 100_000.0,
            wr_inv: false,
        }
    }
}

impl DataPars {
    pub fn validate(&self) -> Result<()> {
        self.iso_pars.validate()?;
        self.mas_pars.validate()?;
        if self.positive_iso && self.iso_pars.int_range[0] < 0.0 {
            return Err(IsoNetError::Config(
                "iso_pars.int_range must be non-negative when positive_iso is set".to_string(),
            ));
        }
        for (key, value) in [
            ("noise", self.noise),
            ("mas_l_noise", self.mas_l_noise),
            ("mas_s_noise", self.mas_s_noise),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(IsoNetError::Config(format!("{} = {} must be non-negative", key, value)));
            }
        }
        for (key, value) in [
            ("iso_spec_norm", self.iso_spec_norm),
            ("mas_spec_norm", self.mas_spec_norm),
            ("wr_norm_factor", self.wr_norm_factor),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(IsoNetError::Config(format!("{} = {} must be positive", key, value)));
            }
        }
        if 2 * self.smooth_end_len > self.iso_pars.td {
            return Err(IsoNetError::Config(format!(
                "smooth_end_len = {} overlaps across td = {}",
                self.smooth_end_len, self.iso_pars.td
            )));
        }
        Ok(())
    }

    /// Number of input channels per MAS spectrum
    pub fn channels(&self) -> usize {
        1 + self.encode_imag as usize + self.encode_wr as usize
    }

    pub fn noise_levels(&self) -> NoiseLevels {
        NoiseLevels {
            noise: self.noise,
            mas_l_noise: self.mas_l_noise,
            mas_s_noise: self.mas_s_noise,
        }
    }

    /// Value of the rate-encoding channel for spinning rate `w`
    pub fn encode_rate(&self, w: f64) -> f32 {
        if self.wr_inv {
            (self.wr_norm_factor / w) as f32
        } else {
            (w / self.wr_norm_factor) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_weighted_ranges_stay_in_bounds() {
        let ranges = [[0.0, 1.0], [10.0, 20.0], [5.0, 5.0]];
        let sampler = WeightedRanges::new("x", &ranges, &[0.2, 0.5, 0.3]).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen_degenerate = false;
        for _ in 0..2_000 {
            let v = sampler.sample(&mut rng);
            assert!(ranges.iter().any(|r| v >= r[0] && v <= r[1]), "{} out of range", v);
            seen_degenerate |= v == 5.0;
        }
        assert!(seen_degenerate);
        assert_eq!(sampler.min(), 0.0);
    }

    #[test]
    fn test_weighted_ranges_zero_weight_component_never_drawn() {
        let sampler = WeightedRanges::new("x", &[[0.0, 1.0], [100.0, 200.0]], &[1.0, 0.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!((0..500).all(|_| sampler.sample(&mut rng) <= 1.0));
    }

    #[test]
    fn test_weighted_ranges_reject_bad_config() {
        let err = WeightedRanges::new("mas1_lw", &[[0.0, 1.0]], &[0.5, 0.5]).unwrap_err();
        assert!(err.to_string().contains("mas1_lw"));
        assert!(WeightedRanges::new("x", &[[2.0, 1.0]], &[1.0]).is_err());
        assert!(WeightedRanges::new("x", &[[0.0, 1.0]], &[0.0]).is_err());
        assert!(WeightedRanges::new("x", &[], &[]).is_err());
    }

    #[test]
    fn test_default_data_pars_valid() {
        let pars = DataPars::default();
        pars.validate().unwrap();
        assert_eq!(pars.channels(), 2);
    }

    #[test]
    fn test_unsatisfiable_spread_rejected() {
        let mut pars = IsoPars::default();
        pars.freq_range = [1000.0, 1010.0];
        pars.spread = 5.0;
        pars.nmax = 5;
        let err = pars.validate().unwrap_err();
        assert!(err.to_string().contains("spread"));
    }

    #[test]
    fn test_rate_encoding() {
        let mut pars = DataPars::default();
        assert!((pars.encode_rate(50_000.0) - 0.5).abs() < 1e-6);
        pars.wr_inv = true;
        assert!((pars.encode_rate(50_000.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_data_pars_json_contract() {
        let json = serde_json::to_value(DataPars::default()).unwrap();
        assert!(json["iso_pars"]["Fs"].is_number());
        assert_eq!(json["mas_pars"]["non_mas_m_trends"][1], "increase");
        let back: DataPars = serde_json::from_value(json).unwrap();
        assert_eq!(back.iso_pars.td, 128);
    }
}
