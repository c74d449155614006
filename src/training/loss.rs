//! Curriculum reconstruction loss
//!
//! The target is widened into a tolerance band by blending it with shifted
//! copies of itself; predictions inside the band cost nothing. Shrinking the
//! band over training (see [`LossSchedule`]) turns a forgiving early loss
//! into a strict one.

use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{IsoNetError, Result};

/// Loss parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossPars {
    /// Width (in points) of the Gaussian shift kernel, 0 disables the band
    pub trg_fuzz: f64,
    /// Total span of shifts considered
    pub trg_fuzz_len: usize,
    pub ndim: usize,
    /// Exponent applied to the point error
    pub exp: f64,
    /// Weight `offset + factor * target` per point
    pub offset: f64,
    pub factor: f64,
    /// Weight of the integral term
    pub int_w: f64,
    pub int_exp: f64,
    /// Log the individual loss terms
    pub return_components: bool,
}

impl Default for LossPars {
    fn default() -> Self {
        LossPars {
            trg_fuzz: 1.0,
            trg_fuzz_len: 25,
            ndim: 2,
            exp: 1.0,
            offset: 1.0,
            factor: 10.0,
            int_w: 0.0,
            int_exp: 2.0,
            return_components: false,
        }
    }
}

impl LossPars {
    pub fn validate(&self) -> Result<()> {
        if self.trg_fuzz < 0.0 || !self.trg_fuzz.is_finite() {
            return Err(IsoNetError::Config(format!(
                "loss.trg_fuzz = {} must be non-negative",
                self.trg_fuzz
            )));
        }
        if self.exp <= 0.0 || self.int_exp <= 0.0 {
            return Err(IsoNetError::Config(
                "loss.exp and loss.int_exp must be positive".to_string(),
            ));
        }
        if self.offset < 0.0 || self.factor < 0.0 || self.int_w < 0.0 {
            return Err(IsoNetError::Config(
                "loss.offset, loss.factor and loss.int_w must be non-negative".to_string(),
            ));
        }
        if self.ndim != 1 && self.ndim != 2 {
            return Err(IsoNetError::Config(format!("loss.ndim = {} must be 1 or 2", self.ndim)));
        }
        Ok(())
    }

    /// Half-width of the shift window, 0 when the band is disabled
    pub fn half_window(&self) -> usize {
        if self.trg_fuzz > 0.0 {
            self.trg_fuzz_len / 2
        } else {
            0
        }
    }
}

/// Partial update of [`LossPars`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trg_fuzz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trg_fuzz_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_exp: Option<f64>,
}

impl LossOverrides {
    pub fn apply(&self, pars: &mut LossPars) {
        if let Some(v) = self.trg_fuzz {
            pars.trg_fuzz = v;
        }
        if let Some(v) = self.trg_fuzz_len {
            pars.trg_fuzz_len = v;
        }
        if let Some(v) = self.exp {
            pars.exp = v;
        }
        if let Some(v) = self.offset {
            pars.offset = v;
        }
        if let Some(v) = self.factor {
            pars.factor = v;
        }
        if let Some(v) = self.int_w {
            pars.int_w = v;
        }
        if let Some(v) = self.int_exp {
            pars.int_exp = v;
        }
    }
}

/// Loss overrides keyed by the epoch they take effect
///
/// Serialized as a map with string keys (`{"25": {"trg_fuzz": 0.0}}`) so it
/// reads the same from JSON and TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, LossOverrides>",
    into = "BTreeMap<String, LossOverrides>"
)]
pub struct LossSchedule {
    changes: BTreeMap<usize, LossOverrides>,
}

impl LossSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, epoch: usize, overrides: LossOverrides) {
        self.changes.insert(epoch, overrides);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether an entry takes effect at `epoch`
    pub fn changes_at(&self, epoch: usize) -> bool {
        self.changes.contains_key(&epoch)
    }

    /// `base` with every entry up to and including `epoch` applied in order
    pub fn pars_at(&self, base: &LossPars, epoch: usize) -> LossPars {
        let mut pars = base.clone();
        for overrides in self.changes.range(..=epoch).map(|(_, o)| o) {
            overrides.apply(&mut pars);
        }
        pars
    }

    /// Validate every intermediate parameter set the schedule produces
    pub fn validate(&self, base: &LossPars) -> Result<()> {
        let mut pars = base.clone();
        for (epoch, overrides) in &self.changes {
            overrides.apply(&mut pars);
            pars.validate().map_err(|e| {
                IsoNetError::Config(format!("train.change_loss at epoch {}: {}", epoch, e))
            })?;
        }
        Ok(())
    }
}

impl TryFrom<BTreeMap<String, LossOverrides>> for LossSchedule {
    type Error = String;

    fn try_from(map: BTreeMap<String, LossOverrides>) -> std::result::Result<Self, String> {
        let changes = map
            .into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<usize>()
                    .map(|epoch| (epoch, v))
                    .map_err(|_| format!("change_loss key {:?} is not an epoch number", k))
            })
            .collect::<std::result::Result<_, _>>()?;
        Ok(LossSchedule { changes })
    }
}

impl From<LossSchedule> for BTreeMap<String, LossOverrides> {
    fn from(schedule: LossSchedule) -> Self {
        schedule
            .changes
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Loss terms of one batch
#[derive(Debug, Clone)]
pub struct LossComponents<B: Backend> {
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub intensity: Tensor<B, 1>,
}

/// Host-side loss values
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub reconstruction: f32,
    pub intensity: f32,
}

impl<B: Backend> LossComponents<B> {
    pub fn values(&self) -> LossValues {
        LossValues {
            total: self.total.clone().into_scalar().elem(),
            reconstruction: self.reconstruction.clone().into_scalar().elem(),
            intensity: self.intensity.clone().into_scalar().elem(),
        }
    }
}

/// Target `t` moved by `s` points (`out[i] = t[i + s]`), edges replicated
fn shifted<B: Backend>(t: &Tensor<B, 2>, s: isize) -> Tensor<B, 2> {
    let [_, td] = t.dims();
    let n = s.unsigned_abs().min(td.saturating_sub(1));
    if n == 0 {
        return t.clone();
    }
    if s > 0 {
        let body = t.clone().narrow(1, n, td - n);
        let edge = t.clone().narrow(1, td - 1, 1).repeat_dim(1, n);
        Tensor::cat(vec![body, edge], 1)
    } else {
        let body = t.clone().narrow(1, 0, td - n);
        let edge = t.clone().narrow(1, 0, 1).repeat_dim(1, n);
        Tensor::cat(vec![edge, body], 1)
    }
}

/// Reconstruction loss with a shrinkable tolerance band
#[derive(Debug, Clone)]
pub struct CurriculumLoss {
    pars: LossPars,
}

impl CurriculumLoss {
    pub fn new(pars: LossPars) -> Self {
        CurriculumLoss { pars }
    }

    pub fn pars(&self) -> &LossPars {
        &self.pars
    }

    pub fn set_pars(&mut self, pars: LossPars) {
        self.pars = pars;
    }

    /// Lower and upper envelope of the blended, shifted targets, [batch, td] each
    pub fn band<B: Backend>(&self, target: &Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let half = self.pars.half_window() as isize;
        let mut lo = target.clone();
        let mut hi = target.clone();
        if half == 0 {
            return (lo, hi);
        }

        let two_sigma2 = 2.0 * self.pars.trg_fuzz * self.pars.trg_fuzz;
        for s in (-half..=half).filter(|s| *s != 0) {
            let k = (-((s * s) as f64) / two_sigma2).exp();
            let blended = shifted(target, s).mul_scalar(k) + target.clone().mul_scalar(1.0 - k);
            lo = lo.min_pair(blended.clone());
            hi = hi.max_pair(blended);
        }
        (lo, hi)
    }

    /// Loss of every member's prediction against the target
    ///
    /// # Arguments
    /// * `preds` - Member reconstructions [n_models, batch, td]
    /// * `target` - Isotropic target [batch, td]
    pub fn compute<B: Backend>(&self, preds: Tensor<B, 3>, target: Tensor<B, 2>) -> LossComponents<B> {
        let p = &self.pars;
        let (lo, hi) = self.band(&target);

        let err = relu(lo.unsqueeze::<3>() - preds.clone()) + relu(preds.clone() - hi.unsqueeze::<3>());
        let err = if p.exp == 1.0 { err } else { err.powf_scalar(p.exp) };
        let weight = target.clone().mul_scalar(p.factor).add_scalar(p.offset).unsqueeze::<3>();
        let reconstruction = (err * weight).mean();

        let intensity = if p.int_w > 0.0 {
            let pred_int = preds.mean_dim(2);
            let target_int = target.mean_dim(1).unsqueeze::<3>();
            (pred_int - target_int).abs().powf_scalar(p.int_exp).mean().mul_scalar(p.int_w)
        } else {
            reconstruction.zeros_like()
        };

        LossComponents {
            total: reconstruction.clone() + intensity.clone(),
            reconstruction,
            intensity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn gaussian_peak(td: usize, center: f64, width: f64) -> Vec<f32> {
        (0..td)
            .map(|i| (-(i as f64 - center).powi(2) / (2.0 * width * width)).exp() as f32)
            .collect()
    }

    fn tensor2(values: Vec<f32>, td: usize) -> Tensor<TestBackend, 2> {
        let n = values.len() / td;
        Tensor::from_data(TensorData::new(values, [n, td]), &Default::default())
    }

    fn no_fuzz() -> LossPars {
        LossPars {
            trg_fuzz: 0.0,
            offset: 1.0,
            factor: 0.0,
            ..LossPars::default()
        }
    }

    #[test]
    fn test_plain_weighted_error_without_fuzz() {
        let target = tensor2(vec![0.0, 0.5, 1.0, 0.5], 4);
        let preds = tensor2(vec![0.1, 0.5, 0.8, 0.5], 4).unsqueeze::<3>();

        let loss = CurriculumLoss::new(no_fuzz()).compute(preds, target).values();
        assert_abs_diff_eq!(loss.reconstruction, 0.3 / 4.0, epsilon = 1e-6);
        assert_eq!(loss.intensity, 0.0);

        let weighted = CurriculumLoss::new(LossPars {
            factor: 10.0,
            ..no_fuzz()
        });
        let target = tensor2(vec![0.0, 0.5, 1.0, 0.5], 4);
        let preds = tensor2(vec![0.1, 0.5, 0.8, 0.5], 4).unsqueeze::<3>();
        let loss = weighted.compute(preds, target).values();
        // weights 1, 6, 11, 6
        assert_abs_diff_eq!(loss.total, (0.1 + 11.0 * 0.2) / 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_band_brackets_target() {
        let td = 64;
        let target = tensor2(gaussian_peak(td, 30.0, 3.0), td);
        let loss = CurriculumLoss::new(LossPars {
            trg_fuzz: 2.0,
            trg_fuzz_len: 9,
            ..LossPars::default()
        });
        let (lo, hi) = loss.band(&target);
        let t: Vec<f32> = target.into_data().to_vec().unwrap();
        let lo: Vec<f32> = lo.into_data().to_vec().unwrap();
        let hi: Vec<f32> = hi.into_data().to_vec().unwrap();
        for i in 0..td {
            assert!(lo[i] <= t[i] && t[i] <= hi[i]);
        }
        assert!(hi[36] > t[36]);
        assert!(lo[27] < t[27]);
    }

    #[test]
    fn test_fuzz_never_increases_shifted_peak_loss() {
        let td = 96;
        let target = gaussian_peak(td, 40.0, 3.0);
        let mut strict_losses = Vec::new();

        for offset in [0.0, 1.0, 2.0, 4.0] {
            let pred = gaussian_peak(td, 40.0 + offset, 3.0);
            let mut last = f32::INFINITY;
            for fuzz in [0.0, 0.5, 1.0, 2.0, 4.0] {
                let loss = CurriculumLoss::new(LossPars {
                    trg_fuzz: fuzz,
                    trg_fuzz_len: 15,
                    ..no_fuzz()
                });
                let value = loss
                    .compute(tensor2(pred.clone(), td).unsqueeze::<3>(), tensor2(target.clone(), td))
                    .values()
                    .total;
                assert!(value <= last + 1e-6, "fuzz {} raised loss at offset {}", fuzz, offset);
                last = value;
            }

            let strict = CurriculumLoss::new(no_fuzz())
                .compute(tensor2(pred, td).unsqueeze::<3>(), tensor2(target.clone(), td))
                .values()
                .total;
            strict_losses.push(strict);
        }

        assert_eq!(strict_losses[0], 0.0);
        assert!(strict_losses.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_members_are_averaged() {
        let target = tensor2(vec![0.0, 1.0, 0.0, 0.0], 4);
        let exact = vec![0.0, 1.0, 0.0, 0.0];
        let off = vec![0.0, 0.0, 0.0, 0.0];
        let preds = tensor2([exact, off].concat(), 4).reshape([2, 1, 4]);

        let loss = CurriculumLoss::new(no_fuzz()).compute(preds, target).values();
        assert_abs_diff_eq!(loss.total, 0.5 * 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_intensity_term() {
        let target = tensor2(vec![0.2; 8], 8);
        let preds = tensor2(vec![0.5; 8], 8).unsqueeze::<3>();
        let loss = CurriculumLoss::new(LossPars {
            int_w: 2.0,
            int_exp: 2.0,
            ..no_fuzz()
        })
        .compute(preds, target)
        .values();

        assert_abs_diff_eq!(loss.reconstruction, 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(loss.intensity, 2.0 * 0.09, epsilon = 1e-6);
        assert_abs_diff_eq!(loss.total, 0.3 + 0.18, epsilon = 1e-6);
    }

    #[test]
    fn test_schedule_is_cumulative() {
        let schedule: LossSchedule = serde_json::from_str(
            r#"{"25": {"trg_fuzz": 0.0, "factor": 0.0}, "40": {"exp": 2.0}, "5": {"factor": 5.0}}"#,
        )
        .unwrap();
        let base = LossPars::default();

        assert_eq!(schedule.pars_at(&base, 4), base);
        assert_eq!(schedule.pars_at(&base, 5).factor, 5.0);

        let at_25 = schedule.pars_at(&base, 25);
        assert_eq!(at_25.trg_fuzz, 0.0);
        assert_eq!(at_25.factor, 0.0);
        assert_eq!(at_25.exp, base.exp);

        let at_50 = schedule.pars_at(&base, 50);
        assert_eq!(at_50.exp, 2.0);
        assert_eq!(at_50.factor, 0.0);
        assert!(schedule.changes_at(40) && !schedule.changes_at(41));
        schedule.validate(&base).unwrap();
    }

    #[test]
    fn test_schedule_serializes_string_keys() {
        let mut schedule = LossSchedule::new();
        schedule.insert(
            25,
            LossOverrides {
                trg_fuzz: Some(0.0),
                ..LossOverrides::default()
            },
        );
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, r#"{"25":{"trg_fuzz":0.0}}"#);

        assert!(serde_json::from_str::<LossSchedule>(r#"{"x": {}}"#).is_err());
        let bad: LossSchedule = serde_json::from_str(r#"{"3": {"exp": -1.0}}"#).unwrap();
        assert!(bad.validate(&LossPars::default()).is_err());
    }
}
