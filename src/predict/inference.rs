//! Model inference on measured MAS spectra

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::dataset::encode_stack;
use crate::data::lineshape::smooth_ends;
use crate::data::DataPars;
use crate::model::{Ensemble, ModelPars};
use crate::training::CheckpointDir;
use crate::{read_json, IsoNetError, Result};

/// Reconstructed isotropic spectrum with its ensemble spread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconstruction {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    /// One reconstruction per ensemble member
    pub members: Vec<Vec<f32>>,
}

/// Build a network input from measured spectra
///
/// Rows are ordered by spinning rate, each row is normalized by its integral
/// and the whole stack is scaled so its largest real value equals `xmax`.
/// Edge smoothing and channel encoding follow `pars`, as in training.
///
/// # Returns
/// Input tensor [1, nw, channels, td]
pub fn prepare_input<B: Backend>(
    real: &[Vec<f32>],
    imag: Option<&[Vec<f32>]>,
    rates: &[f64],
    pars: &DataPars,
    xmax: f32,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let nw = real.len();
    if nw == 0 {
        return Err(IsoNetError::Config("no MAS spectra to reconstruct from".to_string()));
    }
    if rates.len() != nw {
        return Err(IsoNetError::ShapeMismatch {
            parameter: "rates".to_string(),
            expected: vec![nw],
            found: vec![rates.len()],
        });
    }
    if rates.iter().any(|w| *w <= 0.0 || !w.is_finite()) {
        return Err(IsoNetError::Config("spinning rates must be positive".to_string()));
    }
    if let Some(imag) = imag {
        if imag.len() != nw {
            return Err(IsoNetError::ShapeMismatch {
                parameter: "imag".to_string(),
                expected: vec![nw],
                found: vec![imag.len()],
            });
        }
    }

    let mut order: Vec<usize> = (0..nw).collect();
    order.sort_by(|&a, &b| rates[a].total_cmp(&rates[b]));

    let mut xr: Vec<Vec<f32>> = order.iter().map(|&i| real[i].clone()).collect();
    let mut xi: Option<Vec<Vec<f32>>> = imag.map(|im| order.iter().map(|&i| im[i].clone()).collect());
    let ws: Vec<f64> = order.iter().map(|&i| rates[i]).collect();

    for (k, row) in xr.iter_mut().enumerate() {
        let integral: f32 = row.iter().sum();
        if integral > 0.0 {
            row.iter_mut().for_each(|v| *v /= integral);
            if let Some(xi) = xi.as_mut() {
                xi[k].iter_mut().for_each(|v| *v /= integral);
            }
        }
    }

    let max = xr.iter().flatten().fold(0.0f32, |m, v| m.max(v.abs()));
    if max > 0.0 {
        let factor = xmax / max;
        xr.iter_mut().flatten().for_each(|v| *v *= factor);
        if let Some(xi) = xi.as_mut() {
            xi.iter_mut().flatten().for_each(|v| *v *= factor);
        }
    }

    for row in xr.iter_mut() {
        smooth_ends(row, pars.smooth_end_len);
    }
    if let Some(xi) = xi.as_mut() {
        for row in xi.iter_mut() {
            smooth_ends(row, pars.smooth_end_len);
        }
    }

    let td = xr[0].len();
    let data = encode_stack(&xr, xi.as_deref(), &ws, pars)?;
    Ok(Tensor::from_data(
        TensorData::new(data, [1, nw, pars.channels(), td]),
        device,
    ))
}

/// Predictor for reconstructing isotropic spectra
pub struct Predictor<B: Backend> {
    model: Ensemble<B>,
    model_pars: ModelPars,
    data_pars: DataPars,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: Ensemble<B>, model_pars: ModelPars, data_pars: DataPars, device: B::Device) -> Self {
        Predictor {
            model,
            model_pars,
            data_pars,
            device,
        }
    }

    /// Load predictor from a training output directory
    pub fn load(dir: &Path, device: B::Device) -> Result<Self> {
        let ckpt = CheckpointDir::new(dir);
        let model_pars: ModelPars = read_json(&ckpt.model_pars())?;
        let data_pars: DataPars = read_json(&ckpt.data_pars())?;
        data_pars.validate()?;
        if data_pars.channels() != model_pars.input_dim {
            return Err(IsoNetError::Config(format!(
                "{} encodes {} channels but the model expects {}",
                ckpt.data_pars().display(),
                data_pars.channels(),
                model_pars.input_dim
            )));
        }

        let model = Ensemble::load(&device, &ckpt.network(), &model_pars)?;
        log::info!(
            "Loaded {}-member ensemble from {}",
            model_pars.n_models,
            dir.display()
        );
        Ok(Self::new(model, model_pars, data_pars, device))
    }

    pub fn data_pars(&self) -> &DataPars {
        &self.data_pars
    }

    pub fn model_pars(&self) -> &ModelPars {
        &self.model_pars
    }

    /// Run the ensemble on a prepared input [batch, nw, channels, td]
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<Vec<Reconstruction>> {
        let [batch, nw, _, td] = x.dims();
        if nw % self.model_pars.batch_input != 0 {
            return Err(IsoNetError::Config(format!(
                "{} spectra cannot be grouped by batch_input = {}",
                nw, self.model_pars.batch_input
            )));
        }

        let out = self.model.forward(x);
        let n = self.model.n_models();
        let mean = to_vec(out.mean)?;
        let std = to_vec(out.std)?;
        let members = to_vec(out.members)?;

        Ok((0..batch)
            .map(|b| Reconstruction {
                mean: mean[b * td..(b + 1) * td].to_vec(),
                std: std[b * td..(b + 1) * td].to_vec(),
                members: (0..n)
                    .map(|m| {
                        let start = (m * batch + b) * td;
                        members[start..start + td].to_vec()
                    })
                    .collect(),
            })
            .collect())
    }

    /// Prepare measured spectra and reconstruct their isotropic spectrum
    pub fn predict(
        &self,
        real: &[Vec<f32>],
        imag: Option<&[Vec<f32>]>,
        rates: &[f64],
        xmax: f32,
    ) -> Result<Reconstruction> {
        let x = prepare_input::<B>(real, imag, rates, &self.data_pars, xmax, &self.device)?;
        self.forward(x)?
            .pop()
            .ok_or_else(|| IsoNetError::Config("empty prediction batch".to_string()))
    }
}

fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| IsoNetError::Record(format!("{:?}", e)))
}
