//! Prediction and inference
//!
//! Load trained ensembles and reconstruct isotropic spectra.

pub mod inference;

pub use inference::{prepare_input, Predictor, Reconstruction};
