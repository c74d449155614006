//! Model training
//!
//! Training loop, curriculum loss, learning-rate scheduling and checkpoints.

pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDir, TrainingState};
pub use loss::{CurriculumLoss, LossComponents, LossOverrides, LossPars, LossSchedule, LossValues};
pub use metrics::{LossMetrics, TrainingHistory};
pub use scheduler::ReduceLrOnPlateau;
pub use trainer::{TrainPars, Trainer};
