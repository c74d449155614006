//! Ensemble of ConvLSTM networks
//!
//! Members run on the same MAS stack; the ensemble mean is the reconstruction
//! and the spread between members is reported as its uncertainty.

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::conv_lstm::{kernel_shape, ConvLstmConfig, ConvLstmNet, OutputActivation};
use crate::{read_json, write_atomic, write_json, IsoNetError, Result};

/// Network architecture (`model_pars.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPars {
    /// Channels per MAS spectrum, must match the data encoding
    pub input_dim: usize,
    pub n_models: usize,
    pub hidden_dim: Vec<usize>,
    pub kernel_size: Vec<usize>,
    pub num_layers: usize,
    pub batch_input: usize,
    pub bias: bool,
    pub output_bias: bool,
    pub return_all_layers: bool,
    pub batch_norm: bool,
    pub ndim: usize,
    /// Separate weights per member; otherwise every member is the same network
    pub independent: bool,
    pub output_kernel_size: usize,
    pub output_act: OutputActivation,
    pub noise: f64,
    pub invert: bool,
}

impl Default for ModelPars {
    fn default() -> Self {
        ModelPars {
            input_dim: 2,
            n_models: 1,
            hidden_dim: vec![64, 64, 64, 64],
            kernel_size: vec![5, 5, 5, 5],
            num_layers: 4,
            batch_input: 1,
            bias: true,
            output_bias: true,
            return_all_layers: true,
            batch_norm: false,
            ndim: 2,
            independent: true,
            output_kernel_size: 5,
            output_act: OutputActivation::Sigmoid,
            noise: 5e-3,
            invert: false,
        }
    }
}

impl ModelPars {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.n_models == 0 || self.batch_input == 0 {
            return Err(IsoNetError::Config(
                "model.input_dim, n_models and batch_input must be at least 1".to_string(),
            ));
        }
        if self.num_layers == 0
            || self.hidden_dim.len() != self.num_layers
            || self.kernel_size.len() != self.num_layers
        {
            return Err(IsoNetError::Config(format!(
                "model.num_layers = {} but hidden_dim has {} and kernel_size has {} entries",
                self.num_layers,
                self.hidden_dim.len(),
                self.kernel_size.len()
            )));
        }
        if self.hidden_dim.contains(&0) {
            return Err(IsoNetError::Config("model.hidden_dim entries must be positive".to_string()));
        }
        if let Some(k) = self
            .kernel_size
            .iter()
            .chain(std::iter::once(&self.output_kernel_size))
            .find(|k| *k % 2 == 0)
        {
            return Err(IsoNetError::Config(format!(
                "model kernel size {} must be odd to preserve the spectrum length",
                k
            )));
        }
        if self.ndim != 1 && self.ndim != 2 {
            return Err(IsoNetError::Config(format!("model.ndim = {} must be 1 or 2", self.ndim)));
        }
        if self.noise < 0.0 || !self.noise.is_finite() {
            return Err(IsoNetError::Config(format!(
                "model.noise = {} must be non-negative",
                self.noise
            )));
        }
        Ok(())
    }

    /// Number of distinct networks holding weights
    pub fn n_networks(&self) -> usize {
        if self.independent {
            self.n_models
        } else {
            1
        }
    }

    pub fn member_config(&self) -> ConvLstmConfig {
        ConvLstmConfig {
            input_dim: self.input_dim,
            hidden_dim: self.hidden_dim.clone(),
            kernel_size: self.kernel_size.clone(),
            batch_input: self.batch_input,
            bias: self.bias,
            output_bias: self.output_bias,
            return_all_layers: self.return_all_layers,
            batch_norm: self.batch_norm,
            ndim: self.ndim,
            output_kernel_size: self.output_kernel_size,
            output_act: self.output_act,
            noise: self.noise,
            invert: self.invert,
        }
    }

    /// Parameter shapes a network built from these parameters must have
    pub fn shape_manifest(&self) -> ShapeManifest {
        let mut parameters = Vec::new();
        for m in 0..self.n_networks() {
            let mut in_dim = self.input_dim * self.batch_input;
            for (l, (&hidden, &kernel)) in self.hidden_dim.iter().zip(&self.kernel_size).enumerate() {
                let ([kh, kw], _) = kernel_shape(kernel, self.ndim);
                let prefix = format!("members.{}.cells.{}", m, l);
                parameters.push(ParameterShape::new(
                    format!("{}.conv.weight", prefix),
                    vec![4 * hidden, in_dim + hidden, kh, kw],
                ));
                if self.bias {
                    parameters.push(ParameterShape::new(format!("{}.conv.bias", prefix), vec![4 * hidden]));
                }
                if self.batch_norm {
                    parameters.push(ParameterShape::new(format!("{}.norm", prefix), vec![4 * hidden]));
                }
                in_dim = hidden;
            }

            let readout = if self.return_all_layers {
                self.hidden_dim.iter().sum()
            } else {
                in_dim
            };
            let ([kh, kw], _) = kernel_shape(self.output_kernel_size, self.ndim);
            parameters.push(ParameterShape::new(
                format!("members.{}.output.weight", m),
                vec![1, readout, kh, kw],
            ));
            if self.output_bias {
                parameters.push(ParameterShape::new(format!("members.{}.output.bias", m), vec![1]));
            }
        }
        ShapeManifest { parameters }
    }
}

/// Named tensor dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterShape {
    pub name: String,
    pub dims: Vec<usize>,
}

impl ParameterShape {
    fn new(name: String, dims: Vec<usize>) -> Self {
        ParameterShape { name, dims }
    }
}

/// Per-parameter shapes stored next to the weights
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeManifest {
    pub parameters: Vec<ParameterShape>,
}

impl ShapeManifest {
    /// Fail on the first parameter whose shape differs from `expected`
    pub fn check(&self, expected: &ShapeManifest) -> Result<()> {
        let n = self.parameters.len().max(expected.parameters.len());
        for i in 0..n {
            match (expected.parameters.get(i), self.parameters.get(i)) {
                (Some(e), Some(f)) if e == f => continue,
                (Some(e), Some(f)) => {
                    return Err(IsoNetError::ShapeMismatch {
                        parameter: e.name.clone(),
                        expected: e.dims.clone(),
                        found: if e.name == f.name { f.dims.clone() } else { Vec::new() },
                    })
                }
                (Some(e), None) => {
                    return Err(IsoNetError::ShapeMismatch {
                        parameter: e.name.clone(),
                        expected: e.dims.clone(),
                        found: Vec::new(),
                    })
                }
                (None, Some(f)) => {
                    return Err(IsoNetError::ShapeMismatch {
                        parameter: f.name.clone(),
                        expected: Vec::new(),
                        found: f.dims.clone(),
                    })
                }
                (None, None) => unreachable!(),
            }
        }
        Ok(())
    }
}

/// Ensemble prediction
#[derive(Debug, Clone)]
pub struct EnsembleOutput<B: Backend> {
    /// Mean over members [batch, td]
    pub mean: Tensor<B, 2>,
    /// Sample standard deviation over members [batch, td]
    pub std: Tensor<B, 2>,
    /// Every member's reconstruction [n_models, batch, td]
    pub members: Tensor<B, 3>,
}

/// Ensemble of ConvLSTM networks
#[derive(Module, Debug)]
pub struct Ensemble<B: Backend> {
    members: Vec<ConvLstmNet<B>>,
    n_models: usize,
}

impl<B: Backend> Ensemble<B> {
    pub fn new(device: &B::Device, pars: &ModelPars) -> Result<Self> {
        pars.validate()?;
        let config = pars.member_config();
        let members = (0..pars.n_networks())
            .map(|_| ConvLstmNet::new(device, &config))
            .collect();

        Ok(Ensemble {
            members,
            n_models: pars.n_models,
        })
    }

    pub fn n_models(&self) -> usize {
        self.n_models
    }

    /// Reconstructions of every member, [n_models, batch, td]
    pub fn forward_members(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let outputs: Vec<Tensor<B, 2>> = (0..self.n_models)
            .map(|i| self.members[i % self.members.len()].forward(x.clone()))
            .collect();
        Tensor::stack(outputs, 0)
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - MAS stack [batch, nw, channels, td]
    pub fn forward(&self, x: Tensor<B, 4>) -> EnsembleOutput<B> {
        let members = self.forward_members(x);
        let mean: Tensor<B, 2> = members.clone().mean_dim(0).squeeze(0);
        let std = if self.n_models > 1 {
            members.clone().var(0).sqrt().squeeze(0)
        } else {
            mean.zeros_like()
        };

        EnsembleOutput { mean, std, members }
    }

    /// Shapes of the weights actually held by this ensemble
    pub fn shape_manifest(&self) -> ShapeManifest {
        let mut parameters = Vec::new();
        for (m, member) in self.members.iter().enumerate() {
            let prefix = format!("members.{}", m);
            parameters.extend(
                member
                    .parameter_shapes(&prefix)
                    .into_iter()
                    .map(|(name, dims)| ParameterShape { name, dims }),
            );
        }
        ShapeManifest { parameters }
    }

    /// Save weights to `<base>.mpk` and the shape manifest to `<base>.shapes.json`
    pub fn save(&self, base: &Path) -> Result<()> {
        let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = recorder
            .record(self.clone().into_record(), ())
            .map_err(|e| IsoNetError::Record(e.to_string()))?;
        write_atomic(&weights_path(base), &bytes)?;
        write_json(&manifest_path(base), &self.shape_manifest())
    }

    /// Load weights saved by [`Ensemble::save`] into a network built from `pars`
    ///
    /// The stored manifest is checked before the record is read; the shapes
    /// of the loaded weights are checked again, so a weights file without a
    /// manifest or with a stale one still fails with `ShapeMismatch`.
    pub fn load(device: &B::Device, base: &Path, pars: &ModelPars) -> Result<Self> {
        let model = Self::new(device, pars)?;
        let expected = pars.shape_manifest();

        let manifest = manifest_path(base);
        if manifest.is_file() {
            let found: ShapeManifest = read_json(&manifest)?;
            found.check(&expected)?;
        } else {
            log::warn!("No shape manifest at {}, checking loaded weights only", manifest.display());
        }

        let bytes = std::fs::read(weights_path(base))?;
        let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
        let record: EnsembleRecord<B> = recorder
            .load(bytes, device)
            .map_err(|e| IsoNetError::Record(e.to_string()))?;

        let model = model.load_record(record);
        model.shape_manifest().check(&expected)?;
        Ok(model)
    }
}

fn weights_path(base: &Path) -> PathBuf {
    base.with_extension("mpk")
}

fn manifest_path(base: &Path) -> PathBuf {
    base.with_extension("shapes.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn small_pars() -> ModelPars {
        ModelPars {
            input_dim: 2,
            n_models: 3,
            hidden_dim: vec![4, 4],
            kernel_size: vec![3, 3],
            num_layers: 2,
            ndim: 1,
            output_kernel_size: 3,
            noise: 0.0,
            ..ModelPars::default()
        }
    }

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_zero_input_gives_finite_output() {
        let device = Default::default();
        let model = Ensemble::<TestBackend>::new(&device, &small_pars()).unwrap();
        let out = model.forward(Tensor::zeros([2, 6, 2, 24], &device));

        assert_eq!(out.mean.dims(), [2, 24]);
        assert_eq!(out.std.dims(), [2, 24]);
        assert_eq!(out.members.dims(), [3, 2, 24]);
        assert!(to_vec(out.mean).iter().all(|v| v.is_finite()));
        assert!(to_vec(out.std).iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn test_single_member_has_zero_std() {
        let device = Default::default();
        let pars = ModelPars {
            n_models: 1,
            ..small_pars()
        };
        let model = Ensemble::<TestBackend>::new(&device, &pars).unwrap();
        let x = Tensor::random([1, 4, 2, 16], Distribution::Normal(0.0, 1.0), &device);
        let out = model.forward(x);
        assert!(to_vec(out.std).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_shared_members_agree() {
        let device = Default::default();
        let pars = ModelPars {
            independent: false,
            ..small_pars()
        };
        let model = Ensemble::<TestBackend>::new(&device, &pars).unwrap();
        let x = Tensor::random([1, 4, 2, 16], Distribution::Normal(0.0, 1.0), &device);
        let out = model.forward(x);
        assert!(to_vec(out.std).iter().all(|v| v.abs() < 1e-6));
        assert_eq!(model.shape_manifest(), pars.shape_manifest());
    }

    #[test]
    fn test_manifest_matches_built_network() {
        let device = Default::default();
        for pars in [
            small_pars(),
            ModelPars {
                ndim: 2,
                batch_input: 2,
                return_all_layers: false,
                bias: false,
                output_bias: false,
                batch_norm: true,
                ..small_pars()
            },
        ] {
            let model = Ensemble::<TestBackend>::new(&device, &pars).unwrap();
            assert_eq!(model.shape_manifest(), pars.shape_manifest());
        }
    }

    #[test]
    fn test_save_load_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("network");
        let device = Default::default();
        let pars = small_pars();

        let model = Ensemble::<TestBackend>::new(&device, &pars).unwrap();
        model.save(&base).unwrap();
        assert!(dir.path().join("network.mpk").exists());
        assert!(dir.path().join("network.shapes.json").exists());

        let loaded = Ensemble::<TestBackend>::load(&device, &base, &pars).unwrap();
        let x = Tensor::random([2, 6, 2, 24], Distribution::Normal(0.0, 1.0), &device);
        let a = to_vec(model.forward(x.clone()).members);
        let b = to_vec(loaded.forward(x).members);
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_detects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("network");
        let device = Default::default();

        let model = Ensemble::<TestBackend>::new(&device, &small_pars()).unwrap();
        model.save(&base).unwrap();

        let wider = ModelPars {
            hidden_dim: vec![8, 4],
            ..small_pars()
        };
        match Ensemble::<TestBackend>::load(&device, &base, &wider) {
            Err(IsoNetError::ShapeMismatch {
                parameter,
                expected,
                found,
            }) => {
                assert_eq!(parameter, "members.0.cells.0.conv.weight");
                assert_eq!(expected, vec![32, 10, 1, 3]);
                assert_eq!(found, vec![16, 6, 1, 3]);
            }
            other => panic!("expected shape mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_pars_rejected() {
        let device = Default::default();
        let even = ModelPars {
            kernel_size: vec![4, 3],
            ..small_pars()
        };
        assert!(matches!(
            Ensemble::<TestBackend>::new(&device, &even),
            Err(IsoNetError::Config(_))
        ));
        let layers = ModelPars {
            num_layers: 3,
            ..small_pars()
        };
        assert!(layers.validate().is_err());
    }

    #[test]
    fn test_swapped_weights_rejected_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("network");
        let other = dir.path().join("other");
        let device = Default::default();
        let pars = small_pars();

        Ensemble::<TestBackend>::new(&device, &pars).unwrap().save(&base).unwrap();
        let wider = ModelPars {
            hidden_dim: vec![8, 4],
            ..small_pars()
        };
        Ensemble::<TestBackend>::new(&device, &wider).unwrap().save(&other).unwrap();
        std::fs::copy(other.with_extension("mpk"), base.with_extension("mpk")).unwrap();

        let check = |result: Result<Ensemble<TestBackend>>| match result {
            Err(IsoNetError::ShapeMismatch {
                parameter,
                expected,
                found,
            }) => {
                assert_eq!(parameter, "members.0.cells.0.conv.weight");
                assert_eq!(expected, vec![16, 6, 1, 3]);
                assert_eq!(found, vec![32, 10, 1, 3]);
            }
            res => panic!("expected shape mismatch, got {:?}", res.map(|_| ())),
        };

        // Manifest still describes the original weights
        check(Ensemble::<TestBackend>::load(&device, &base, &pars));

        std::fs::remove_file(base.with_extension("shapes.json")).unwrap();
        check(Ensemble::<TestBackend>::load(&device, &base, &pars));

        // Matching weights load without a manifest
        Ensemble::<TestBackend>::new(&device, &pars).unwrap().save(&other).unwrap();
        std::fs::remove_file(other.with_extension("shapes.json")).unwrap();
        Ensemble::<TestBackend>::load(&device, &other, &pars).unwrap();
    }
}
