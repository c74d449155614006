//! Neural network architecture
//!
//! - ConvLSTM: recurrent convolution across spinning rates
//! - Ensemble: several ConvLSTMs with mean/std aggregation

pub mod conv_lstm;
pub mod ensemble;

pub use conv_lstm::{ConvLstmCell, ConvLstmConfig, ConvLstmNet, OutputActivation};
pub use ensemble::{Ensemble, EnsembleOutput, ModelPars, ShapeManifest};
