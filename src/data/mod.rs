//! Synthetic data generation
//!
//! Isotropic peak sampling, MAS distortion and batch assembly.

pub mod dataset;
pub mod isotropic;
pub mod lineshape;
pub mod mas;
pub mod params;

pub use dataset::{SampleGenerator, SpectrumBatch, SpectrumBatcher, SpectrumSample, SyntheticDataset};
pub use isotropic::{IsotropicSpectrum, LineshapeSampler};
pub use mas::{MasSpectrumStack, MasSynthesizer, SpinningCondition};
pub use params::{DataPars, IsoPars, MasPars, WeightedRanges};
