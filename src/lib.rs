//! Isotropic spectrum reconstruction from MAS NMR spectra
//!
//! Synthetic training data (isotropic spectra and their MAS-rate-dependent
//! distortions) and an ensemble of convolutional LSTMs that recovers the
//! isotropic spectrum from a stack of MAS spectra.

pub mod data;
pub mod model;
pub mod predict;
pub mod training;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use data::DataPars;
use model::ModelPars;
use training::{LossPars, TrainPars};

/// Application-wide errors
#[derive(Debug, Error)]
pub enum IsoNetError {
    #[error("Generation failed after {attempts} attempts: {message}")]
    Generation { attempts: usize, message: String },

    #[error("Non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NumericInstability {
        epoch: usize,
        batch: usize,
        value: f32,
    },

    #[error("Shape mismatch for {parameter}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        parameter: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record error: {0}")]
    Record(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IsoNetError>;

/// Write `bytes` to `<path>.tmp`, then rename over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    std::fs::write(tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &content)
}

/// Read a JSON file into `T`
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Application configuration loaded from config.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub data: DataPars,
    pub model: ModelPars,
    pub loss: LossPars,
    pub train: TrainPars,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IsoNetError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        toml::from_str(&content)
            .map_err(|e| IsoNetError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IsoNetError::Config(format!("Failed to serialize config: {}", e)))?;
        write_atomic(Path::new(path), content.as_bytes())
    }

    /// Check every parameter group and their cross-constraints
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.model.validate()?;
        self.loss.validate()?;
        self.train.validate()?;

        let channels = self.data.channels();
        if channels != self.model.input_dim {
            return Err(IsoNetError::Config(format!(
                "model.input_dim = {} but data encodes {} channels per spectrum",
                self.model.input_dim, channels
            )));
        }
        let nw = self.data.mas_pars.nw;
        if nw % self.model.batch_input != 0 {
            return Err(IsoNetError::Config(format!(
                "model.batch_input = {} does not divide mas_pars.nw = {}",
                self.model.batch_input, nw
            )));
        }
        Ok(())
    }
}
