//! Training loop

use burn::data::dataloader::DataLoaderBuilder;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use super::checkpoint::{load_record, save_record, CheckpointDir, TrainingState};
use super::loss::{CurriculumLoss, LossOverrides, LossPars, LossSchedule};
use super::metrics::{LossMetrics, TrainingHistory};
use super::scheduler::ReduceLrOnPlateau;
use crate::data::{SampleGenerator, SpectrumBatch, SpectrumBatcher, SyntheticDataset};
use crate::model::Ensemble;
use crate::{write_json, Config, IsoNetError, Result};

/// Seed offset separating the evaluation stream from the training stream
const EVAL_SEED_OFFSET: u64 = 0x5EED_E7A1;

/// Training loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainPars {
    pub batch_size: usize,
    /// Data loader worker threads, 0 generates on the training thread
    pub num_workers: usize,
    pub batches_per_epoch: usize,
    pub batches_per_eval: usize,
    pub n_epochs: usize,
    /// Loss parameter changes keyed by the (0-based) epoch they start at
    #[serde(default)]
    pub change_loss: LossSchedule,
    pub out_dir: String,
    pub save_every: usize,
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    pub learning_rate: f64,
    pub lr_factor: f64,
    pub lr_patience: usize,
    /// Relative improvement the plateau scheduler counts as progress
    #[serde(default = "default_lr_threshold")]
    pub lr_threshold: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_eval_every() -> usize {
    1
}

fn default_lr_threshold() -> f64 {
    1e-4
}

impl Default for TrainPars {
    fn default() -> Self {
        let mut change_loss = LossSchedule::new();
        change_loss.insert(
            25,
            LossOverrides {
                trg_fuzz: Some(0.0),
                factor: Some(0.0),
                ..LossOverrides::default()
            },
        );

        TrainPars {
            batch_size: 8,
            num_workers: 4,
            batches_per_epoch: 500,
            batches_per_eval: 100,
            n_epochs: 250,
            change_loss,
            out_dir: "runs/isonet".to_string(),
            save_every: 50,
            eval_every: 1,
            learning_rate: 1e-3,
            lr_factor: 0.5,
            lr_patience: 10,
            lr_threshold: default_lr_threshold(),
            min_lr: 0.0,
            seed: None,
        }
    }
}

impl TrainPars {
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("batch_size", self.batch_size),
            ("batches_per_epoch", self.batches_per_epoch),
            ("save_every", self.save_every),
            ("eval_every", self.eval_every),
        ] {
            if value == 0 {
                return Err(IsoNetError::Config(format!("train.{} must be at least 1", key)));
            }
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(IsoNetError::Config(format!(
                "train.learning_rate = {} must be positive",
                self.learning_rate
            )));
        }
        if self.lr_factor <= 0.0 || self.lr_factor >= 1.0 {
            return Err(IsoNetError::Config(format!(
                "train.lr_factor = {} must lie in (0, 1)",
                self.lr_factor
            )));
        }
        if !(0.0..1.0).contains(&self.lr_threshold) {
            return Err(IsoNetError::Config(format!(
                "train.lr_threshold = {} must lie in [0, 1)",
                self.lr_threshold
            )));
        }
        if self.min_lr < 0.0 {
            return Err(IsoNetError::Config("train.min_lr must be non-negative".to_string()));
        }
        Ok(())
    }
}

/// Trainer for the ConvLSTM ensemble
pub struct Trainer<B: AutodiffBackend> {
    model: Ensemble<B>,
    optimizer: OptimizerAdaptor<Adam, Ensemble<B>, B>,
    loss_fn: CurriculumLoss,
    generator: Arc<SampleGenerator>,
    checkpoint: CheckpointDir,
    state: TrainingState,
    config: Config,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Create a new trainer with freshly initialized weights
    pub fn new(config: Config, device: B::Device) -> Result<Self> {
        config.validate()?;
        config.train.change_loss.validate(&config.loss)?;

        let generator = Arc::new(SampleGenerator::symmetric(config.data.clone())?);
        let model = Ensemble::new(&device, &config.model)?;
        let optimizer = AdamConfig::new().init();

        let t = &config.train;
        let state = TrainingState {
            epoch: 0,
            scheduler: ReduceLrOnPlateau::new(t.learning_rate, t.lr_factor, t.lr_patience, t.min_lr)
                .with_threshold(t.lr_threshold),
            loss_pars: config.loss.clone(),
            history: TrainingHistory::new(),
        };

        Ok(Trainer {
            model,
            optimizer,
            loss_fn: CurriculumLoss::new(config.loss.clone()),
            generator,
            checkpoint: CheckpointDir::new(&config.train.out_dir),
            state,
            config,
            device,
        })
    }

    /// Continue from the checkpoint in `out_dir`
    pub fn resume(mut self) -> Result<Self> {
        if !self.checkpoint.has_checkpoint() {
            return Err(IsoNetError::Config(format!(
                "no checkpoint to resume in {}",
                self.checkpoint.root().display()
            )));
        }

        self.model = Ensemble::load(&self.device, &self.checkpoint.network(), &self.config.model)?;
        let optimizer_path = self.checkpoint.optimizer();
        if optimizer_path.is_file() {
            let record = load_record::<B, _>(&optimizer_path, &self.device)?;
            self.optimizer = self.optimizer.load_record(record);
        } else {
            log::warn!("No optimizer state in {}, restarting Adam moments", optimizer_path.display());
        }

        self.state = TrainingState::load(&self.checkpoint.state())?;
        self.loss_fn.set_pars(self.state.loss_pars.clone());
        log::info!(
            "Resuming from {} at epoch {}",
            self.checkpoint.root().display(),
            self.state.epoch + 1
        );
        Ok(self)
    }

    /// Write the parameter files inference needs next to the weights
    fn write_pars(&self) -> Result<()> {
        self.checkpoint.create()?;
        write_json(&self.checkpoint.model_pars(), &self.config.model)?;
        write_json(&self.checkpoint.data_pars(), &self.config.data)?;
        write_json(&self.checkpoint.loss_pars(), &self.config.loss)?;
        self.config
            .save(&self.checkpoint.root().join("config.toml").to_string_lossy())
    }

    fn save_checkpoint(&self) -> Result<()> {
        self.model.save(&self.checkpoint.network())?;
        save_record::<B, _>(self.optimizer.to_record(), &self.checkpoint.optimizer())?;
        self.state.save(&self.checkpoint.state())?;
        log::info!(
            "Saved checkpoint to {} (epoch {})",
            self.checkpoint.root().display(),
            self.state.epoch
        );
        Ok(())
    }

    /// Train until `n_epochs`, returning the final model and history
    pub fn train(mut self) -> Result<(Ensemble<B>, TrainingHistory)> {
        self.write_pars()?;

        let t = self.config.train.clone();
        let start = self.state.epoch;
        let seed = t.seed.map(|s| s.wrapping_add((start as u64) << 32));

        let mut train_data = SyntheticDataset::new(self.generator.clone(), t.batches_per_epoch * t.batch_size);
        let mut eval_data = SyntheticDataset::new(self.generator.clone(), t.batches_per_eval * t.batch_size);
        if let Some(seed) = seed {
            train_data = train_data.with_seed(seed);
            eval_data = eval_data.with_seed(seed ^ EVAL_SEED_OFFSET);
        }

        // Burn splits the dataset across workers, so 0 keeps its single-threaded loader
        let mut train_builder =
            DataLoaderBuilder::new(SpectrumBatcher::<B>::new(self.device.clone())).batch_size(t.batch_size);
        let mut eval_builder =
            DataLoaderBuilder::new(SpectrumBatcher::<B::InnerBackend>::new(self.device.clone()))
                .batch_size(t.batch_size);
        if t.num_workers > 0 {
            train_builder = train_builder.num_workers(t.num_workers);
            eval_builder = eval_builder.num_workers(t.num_workers);
        }
        let train_loader = train_builder.build(train_data);
        let eval_loader = eval_builder.build(eval_data);

        log::info!(
            "Training {} model(s) for epochs {}..{} ({} batches of {} per epoch)",
            self.config.model.n_models,
            start + 1,
            t.n_epochs,
            t.batches_per_epoch,
            t.batch_size
        );

        for epoch in start..t.n_epochs {
            if t.change_loss.changes_at(epoch) {
                let pars = t.change_loss.pars_at(&self.config.loss, epoch);
                log::info!("Epoch {}: loss parameters changed to {:?}", epoch + 1, pars);
                self.loss_fn.set_pars(pars);
            }

            let lr = self.state.scheduler.lr();
            let train_metrics = self.train_epoch(epoch, train_loader.iter(), lr);

            let val_metrics = if t.batches_per_eval > 0 && (epoch + 1) % t.eval_every == 0 {
                let metrics = self.validate_epoch(eval_loader.iter());
                self.state.scheduler.step(metrics.avg_loss());
                Some(metrics)
            } else {
                None
            };

            self.state
                .history
                .record_epoch(epoch, &train_metrics, val_metrics.as_ref(), lr);

            log::info!(
                "Epoch {}/{}: Train: {} | Val: {} | LR: {:.2e}",
                epoch + 1,
                t.n_epochs,
                train_metrics,
                val_metrics
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |m| m.to_string()),
                lr
            );

            self.state.epoch = epoch + 1;
            self.state.loss_pars = self.loss_fn.pars().clone();
            if (epoch + 1) % t.save_every == 0 && epoch + 1 < t.n_epochs {
                self.save_checkpoint()?;
            }
        }

        self.save_checkpoint()?;
        if let (Some(best), Some(epoch)) = (self.state.history.best_val_loss, self.state.history.best_epoch) {
            log::info!("Best validation loss {:.4e} at epoch {}", best, epoch + 1);
        }
        Ok((self.model, self.state.history))
    }

    /// Train one epoch
    ///
    /// Batches with a non-finite loss or gradient are skipped without an
    /// optimizer step. An epoch without a single finite batch is logged and
    /// recorded with no training loss; the run continues.
    fn train_epoch(
        &mut self,
        epoch: usize,
        loader: impl Iterator<Item = SpectrumBatch<B>>,
        lr: f64,
    ) -> LossMetrics {
        let mut metrics = LossMetrics::with_components(self.loss_fn.pars().return_components);
        let mut last_bad = None;

        for (batch_idx, batch) in loader.enumerate() {
            let preds = self.model.forward_members(batch.inputs);
            let loss = self.loss_fn.compute(preds, batch.targets);
            let values = loss.values();

            if !values.total.is_finite() {
                log::warn!(
                    "Skipping batch {} of epoch {}: non-finite loss {}",
                    batch_idx + 1,
                    epoch + 1,
                    values.total
                );
                metrics.skip();
                last_bad = Some((batch_idx, values.total));
                continue;
            }

            let grads = loss.total.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            let bad_grads = non_finite_gradients::<B, _>(&self.model, &grads);
            if bad_grads > 0 {
                log::warn!(
                    "Skipping batch {} of epoch {}: {} non-finite gradient values",
                    batch_idx + 1,
                    epoch + 1,
                    bad_grads
                );
                metrics.skip();
                last_bad = Some((batch_idx, f32::NAN));
                continue;
            }
            self.model = self.optimizer.step(lr, self.model.clone(), grads);

            metrics.update(values);
        }

        if metrics.batch_count == 0 {
            if let Some((batch, value)) = last_bad {
                log::warn!(
                    "{} ({} batches skipped, weights unchanged this epoch)",
                    IsoNetError::NumericInstability { epoch, batch, value },
                    metrics.skipped_batches
                );
            }
        }
        metrics
    }

    /// Validate one epoch on the inference model (no input noise, no gradients)
    fn validate_epoch(&self, loader: impl Iterator<Item = SpectrumBatch<B::InnerBackend>>) -> LossMetrics {
        let model = self.model.valid();
        let mut metrics = LossMetrics::with_components(self.loss_fn.pars().return_components);

        for batch in loader {
            let preds = model.forward_members(batch.inputs);
            let values = self.loss_fn.compute(preds, batch.targets).values();
            if values.total.is_finite() {
                metrics.update(values);
            } else {
                metrics.skip();
            }
        }

        metrics
    }

    /// Get the current model
    pub fn model(&self) -> &Ensemble<B> {
        &self.model
    }

    pub fn loss_pars(&self) -> &LossPars {
        self.loss_fn.pars()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

}

/// Counts NaN and infinite values over the gradients of a module's parameters
struct NonFiniteGradients<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    count: usize,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for NonFiniteGradients<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            // inf - inf and NaN - NaN are both NaN
            let bad: i64 = (grad.clone() - grad).is_nan().int().sum().into_scalar().elem();
            self.count += bad as usize;
        }
    }
}

pub(crate) fn non_finite_gradients<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &GradientsParams,
) -> usize {
    let mut visitor = NonFiniteGradients::<B> {
        grads,
        count: 0,
        backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.count
}
