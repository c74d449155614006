//! Convolutional LSTM over the MAS-rate axis
//!
//! The recurrence runs across spinning rates; each step sees a spatial field
//! of shape [1, td] (the frequency axis), convolved with `[1, k]` kernels
//! for `ndim = 1` or `[k, k]` kernels for `ndim = 2`.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

/// Final activation applied to the reconstructed spectrum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    Sigmoid,
    Relu,
    Linear,
}

impl OutputActivation {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            OutputActivation::Sigmoid => sigmoid(x),
            OutputActivation::Relu => relu(x),
            OutputActivation::Linear => x,
        }
    }
}

/// Hidden and cell state of one layer
pub type CellState<B> = (Tensor<B, 4>, Tensor<B, 4>);

/// Kernel shape and matching "same" padding for a kernel size
///
/// On the height-1 field an `ndim = 2` kernel only ever overlaps zero
/// padding with its off-centre rows, so it computes the same map as the
/// `[1, k]` kernel made of its centre row. The square shape keeps the weight
/// layout of two-dimensional checkpoints.
pub(crate) fn kernel_shape(kernel_size: usize, ndim: usize) -> ([usize; 2], [usize; 2]) {
    let kh = if ndim == 2 { kernel_size } else { 1 };
    ([kh, kernel_size], [kh / 2, kernel_size / 2])
}

/// A single ConvLSTM cell
#[derive(Module, Debug)]
pub struct ConvLstmCell<B: Backend> {
    /// Joint gate convolution over [input, hidden]
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    hidden_dim: usize,
}

impl<B: Backend> ConvLstmCell<B> {
    pub fn new(
        device: &B::Device,
        input_dim: usize,
        hidden_dim: usize,
        kernel_size: usize,
        ndim: usize,
        bias: bool,
        batch_norm: bool,
    ) -> Self {
        let (kernel, padding) = kernel_shape(kernel_size, ndim);
        let conv = Conv2dConfig::new([input_dim + hidden_dim, 4 * hidden_dim], kernel)
            .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
            .with_bias(bias)
            .init(device);
        let norm = batch_norm.then(|| BatchNormConfig::new(4 * hidden_dim).init(device));

        ConvLstmCell {
            conv,
            norm,
            hidden_dim,
        }
    }

    /// One recurrent step
    ///
    /// # Arguments
    /// * `x` - Step input [batch, channels, height, width]
    /// * `state` - Previous (hidden, cell), zeros when `None`
    pub fn forward(&self, x: Tensor<B, 4>, state: Option<CellState<B>>) -> CellState<B> {
        let [batch, _, height, width] = x.dims();
        let (h, c) = state.unwrap_or_else(|| {
            let zeros = Tensor::zeros([batch, self.hidden_dim, height, width], &x.device());
            (zeros.clone(), zeros)
        });

        let gates = self.conv.forward(Tensor::cat(vec![x, h], 1));
        let gates = match &self.norm {
            Some(norm) => norm.forward(gates),
            None => gates,
        };

        let mut chunks = gates.chunk(4, 1).into_iter();
        let (i, f, o, g) = match (chunks.next(), chunks.next(), chunks.next(), chunks.next()) {
            (Some(i), Some(f), Some(o), Some(g)) => (sigmoid(i), sigmoid(f), sigmoid(o), g.tanh()),
            _ => unreachable!("gate convolution has 4 * hidden_dim channels"),
        };

        let c_next = f * c + i * g;
        let h_next = o * c_next.clone().tanh();
        (h_next, c_next)
    }
}

/// Architecture of one ConvLSTM network
#[derive(Debug, Clone)]
pub struct ConvLstmConfig {
    /// Channels per MAS spectrum
    pub input_dim: usize,
    pub hidden_dim: Vec<usize>,
    pub kernel_size: Vec<usize>,
    /// MAS spectra fed per recurrent step
    pub batch_input: usize,
    pub bias: bool,
    pub output_bias: bool,
    pub return_all_layers: bool,
    pub batch_norm: bool,
    pub ndim: usize,
    pub output_kernel_size: usize,
    pub output_act: OutputActivation,
    /// Std of Gaussian input noise while training
    pub noise: f64,
    /// Process spinning rates from last to first
    pub invert: bool,
}

/// Stacked ConvLSTM with a convolutional read-out
#[derive(Module, Debug)]
pub struct ConvLstmNet<B: Backend> {
    cells: Vec<ConvLstmCell<B>>,
    output: Conv2d<B>,
    output_act: Ignored<OutputActivation>,
    batch_input: usize,
    return_all_layers: bool,
    invert: bool,
    noise: f64,
}

impl<B: Backend> ConvLstmNet<B> {
    pub fn new(device: &B::Device, config: &ConvLstmConfig) -> Self {
        let mut cells = Vec::with_capacity(config.hidden_dim.len());
        let mut in_dim = config.input_dim * config.batch_input;
        for (&hidden, &kernel) in config.hidden_dim.iter().zip(&config.kernel_size) {
            cells.push(ConvLstmCell::new(
                device,
                in_dim,
                hidden,
                kernel,
                config.ndim,
                config.bias,
                config.batch_norm,
            ));
            in_dim = hidden;
        }

        let readout_dim = if config.return_all_layers {
            config.hidden_dim.iter().sum()
        } else {
            config.hidden_dim.last().copied().unwrap_or(0)
        };
        let (kernel, padding) = kernel_shape(config.output_kernel_size, config.ndim);
        let output = Conv2dConfig::new([readout_dim, 1], kernel)
            .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
            .with_bias(config.output_bias)
            .init(device);

        ConvLstmNet {
            cells,
            output,
            output_act: Ignored(config.output_act),
            batch_input: config.batch_input.max(1),
            return_all_layers: config.return_all_layers,
            invert: config.invert,
            noise: config.noise,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    /// Reconstruct the isotropic spectrum
    ///
    /// # Arguments
    /// * `x` - MAS stack [batch, nw, channels, td]
    ///
    /// # Returns
    /// Reconstruction [batch, td]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, nw, channels, td] = x.dims();

        // Input noise only while gradients are tracked
        let x = if self.noise > 0.0 && B::ad_enabled() {
            let noise = x.random_like(Distribution::Normal(0.0, self.noise));
            x + noise
        } else {
            x
        };

        let steps = (nw / self.batch_input).max(1);
        let group = self.batch_input.min(nw);
        let order: Vec<usize> = if self.invert {
            (0..steps).rev().collect()
        } else {
            (0..steps).collect()
        };

        let mut states: Vec<Option<CellState<B>>> = vec![None; self.cells.len()];
        for step in order {
            let mut input = x
                .clone()
                .narrow(1, step * group, group)
                .reshape([batch, group * channels, 1, td]);
            for (cell, state) in self.cells.iter().zip(states.iter_mut()) {
                let (h, c) = cell.forward(input, state.take());
                input = h.clone();
                *state = Some((h, c));
            }
        }

        let mut hidden: Vec<Tensor<B, 4>> = states.into_iter().flatten().map(|(h, _)| h).collect();
        let features = match hidden.pop() {
            Some(last) if self.return_all_layers => {
                hidden.push(last);
                Tensor::cat(hidden, 1)
            }
            Some(last) => last,
            // No recurrent layers: read out straight from the first group
            None => x.narrow(1, 0, group).reshape([batch, group * channels, 1, td]),
        };

        let out = self.output.forward(features).reshape([batch, td]);
        self.output_act.0.apply(out)
    }

    /// Shapes of every parameter tensor, in declaration order
    pub fn parameter_shapes(&self, prefix: &str) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        for (l, cell) in self.cells.iter().enumerate() {
            shapes.push((
                format!("{}.cells.{}.conv.weight", prefix, l),
                cell.conv.weight.dims().to_vec(),
            ));
            if let Some(bias) = &cell.conv.bias {
                shapes.push((format!("{}.cells.{}.conv.bias", prefix, l), bias.dims().to_vec()));
            }
            if cell.norm.is_some() {
                shapes.push((format!("{}.cells.{}.norm", prefix, l), vec![4 * cell.hidden_dim]));
            }
        }
        shapes.push((format!("{}.output.weight", prefix), self.output.weight.dims().to_vec()));
        if let Some(bias) = &self.output.bias {
            shapes.push((format!("{}.output.bias", prefix), bias.dims().to_vec()));
        }
        shapes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config() -> ConvLstmConfig {
        ConvLstmConfig {
            input_dim: 2,
            hidden_dim: vec![4, 6],
            kernel_size: vec![3, 5],
            batch_input: 1,
            bias: true,
            output_bias: true,
            return_all_layers: true,
            batch_norm: false,
            ndim: 1,
            output_kernel_size: 3,
            output_act: OutputActivation::Sigmoid,
            noise: 0.0,
            invert: false,
        }
    }

    #[test]
    fn test_cell_state_shapes() {
        let device = Default::default();
        let cell = ConvLstmCell::<TestBackend>::new(&device, 2, 4, 3, 1, true, false);
        let x = Tensor::random([3, 2, 1, 16], Distribution::Normal(0.0, 1.0), &device);
        let (h, c) = cell.forward(x.clone(), None);
        assert_eq!(h.dims(), [3, 4, 1, 16]);
        assert_eq!(c.dims(), [3, 4, 1, 16]);
        let (h2, _) = cell.forward(x, Some((h, c)));
        assert_eq!(h2.dims(), [3, 4, 1, 16]);
    }

    #[test]
    fn test_net_output_bounded() {
        let device = Default::default();
        let net = ConvLstmNet::<TestBackend>::new(&device, &config());
        let x = Tensor::random([2, 5, 2, 32], Distribution::Normal(0.0, 1.0), &device);
        let y = net.forward(x);
        assert_eq!(y.dims(), [2, 32]);
        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_grouped_inverted_2d_variant() {
        let device = Default::default();
        let cfg = ConvLstmConfig {
            batch_input: 2,
            invert: true,
            ndim: 2,
            return_all_layers: false,
            batch_norm: true,
            ..config()
        };
        let net = ConvLstmNet::<TestBackend>::new(&device, &cfg);
        let x = Tensor::random([2, 4, 2, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(net.forward(x).dims(), [2, 16]);

        let shapes = net.parameter_shapes("m");
        assert_eq!(shapes[0].1, vec![16, 8, 3, 3]);
        assert_eq!(shapes.last().unwrap().1, vec![1]);
    }

    #[test]
    fn test_square_kernel_matches_centre_row() {
        use burn::module::Param;

        let device = Default::default();
        let square = ConvLstmCell::<TestBackend>::new(&device, 2, 4, 3, 2, true, false);
        let mut row = ConvLstmCell::<TestBackend>::new(&device, 2, 4, 3, 1, true, false);
        row.conv.weight = Param::from_tensor(square.conv.weight.val().narrow(2, 1, 1));
        row.conv.bias = square.conv.bias.as_ref().map(|b| Param::from_tensor(b.val()));

        let x = Tensor::random([2, 2, 1, 16], Distribution::Normal(0.0, 1.0), &device);
        let (h_square, c_square) = square.forward(x.clone(), None);
        let (h_row, c_row) = row.forward(x, None);

        let diff = |a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>| -> f32 {
            (a - b).abs().max().into_scalar()
        };
        assert!(diff(h_square, h_row) < 1e-6);
        assert!(diff(c_square, c_row) < 1e-6);
    }
}
