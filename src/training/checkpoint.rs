//! Checkpoint directory layout and resumable training state

use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::loss::LossPars;
use super::metrics::TrainingHistory;
use super::scheduler::ReduceLrOnPlateau;
use crate::{read_json, write_atomic, write_json, IsoNetError, Result};

pub const MODEL_PARS_FILE: &str = "model_pars.json";
pub const DATA_PARS_FILE: &str = "data_pars.json";
pub const LOSS_PARS_FILE: &str = "loss_pars.json";
pub const NETWORK_FILE: &str = "network";
pub const OPTIMIZER_FILE: &str = "optimizer.mpk";
pub const STATE_FILE: &str = "training_state.json";

/// Files making up a training output directory
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CheckpointDir { root: root.into() }
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_pars(&self) -> PathBuf {
        self.root.join(MODEL_PARS_FILE)
    }

    pub fn data_pars(&self) -> PathBuf {
        self.root.join(DATA_PARS_FILE)
    }

    pub fn loss_pars(&self) -> PathBuf {
        self.root.join(LOSS_PARS_FILE)
    }

    /// Base path of the network weights (`network.mpk`, `network.shapes.json`)
    pub fn network(&self) -> PathBuf {
        self.root.join(NETWORK_FILE)
    }

    pub fn optimizer(&self) -> PathBuf {
        self.root.join(OPTIMIZER_FILE)
    }

    pub fn state(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// Whether a resumable checkpoint is present
    pub fn has_checkpoint(&self) -> bool {
        self.state().is_file() && self.network().with_extension("mpk").is_file()
    }
}

/// Everything besides weights needed to continue training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,
    pub scheduler: ReduceLrOnPlateau,
    /// Loss parameters in effect, schedule included
    pub loss_pars: LossPars,
    pub history: TrainingHistory,
}

impl TrainingState {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

/// Serialize any burn record (e.g. optimizer state) atomically
pub fn save_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<()> {
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = Recorder::<B>::record(&recorder, record, ())
        .map_err(|e| IsoNetError::Record(e.to_string()))?;
    write_atomic(path, &bytes)
}

pub fn load_record<B: Backend, R: Record<B>>(path: &Path, device: &B::Device) -> Result<R> {
    let bytes = std::fs::read(path)?;
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::load(&recorder, bytes, device).map_err(|e| IsoNetError::Record(e.to_string()))
}
