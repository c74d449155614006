//! Training metrics and history

use serde::{Deserialize, Serialize};
use std::fmt;

use super::loss::LossValues;

/// Loss values accumulated over the batches of one epoch
#[derive(Debug, Clone, Default)]
pub struct LossMetrics {
    pub total_loss: f64,
    pub reconstruction_loss: f64,
    pub intensity_loss: f64,
    /// Batches that contributed to the sums
    pub batch_count: usize,
    /// Batches dropped for a non-finite loss
    pub skipped_batches: usize,
    /// Include the loss terms in `Display`
    pub show_components: bool,
}

impl LossMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_components(show_components: bool) -> Self {
        LossMetrics {
            show_components,
            ..Self::default()
        }
    }

    /// Update metrics with a batch result
    pub fn update(&mut self, values: LossValues) {
        self.total_loss += values.total as f64;
        self.reconstruction_loss += values.reconstruction as f64;
        self.intensity_loss += values.intensity as f64;
        self.batch_count += 1;
    }

    pub fn skip(&mut self) {
        self.skipped_batches += 1;
    }

    fn average(&self, sum: f64) -> f64 {
        if self.batch_count == 0 {
            f64::NAN
        } else {
            sum / self.batch_count as f64
        }
    }

    /// Get average total loss, NaN when no batch contributed
    pub fn avg_loss(&self) -> f64 {
        self.average(self.total_loss)
    }

    pub fn avg_reconstruction_loss(&self) -> f64 {
        self.average(self.reconstruction_loss)
    }

    pub fn avg_intensity_loss(&self) -> f64 {
        self.average(self.intensity_loss)
    }
}

impl fmt::Display for LossMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loss: {:.4e}", self.avg_loss())?;
        if self.show_components {
            write!(
                f,
                " (rec: {:.4e}, int: {:.4e})",
                self.avg_reconstruction_loss(),
                self.avg_intensity_loss()
            )?;
        }
        if self.skipped_batches > 0 {
            write!(f, " [{} skipped]", self.skipped_batches)?;
        }
        Ok(())
    }
}

/// One epoch of the training history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    pub learning_rate: f64,
}

/// Training history for tracking progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metrics for an epoch; `val` is `None` on epochs without evaluation
    pub fn record_epoch(
        &mut self,
        epoch: usize,
        train: &LossMetrics,
        val: Option<&LossMetrics>,
        learning_rate: f64,
    ) {
        let val_loss = val.and_then(|m| finite(m.avg_loss()));
        if let Some(loss) = val_loss {
            if self.best_val_loss.map_or(true, |best| loss < best) {
                self.best_val_loss = Some(loss);
                self.best_epoch = Some(epoch);
            }
        }

        self.epochs.push(EpochRecord {
            epoch,
            train_loss: finite(train.avg_loss()),
            val_loss,
            learning_rate,
        });
    }

    /// Get improvement between the last two evaluated epochs
    pub fn last_improvement(&self) -> Option<f64> {
        let mut evaluated = self.epochs.iter().rev().filter_map(|e| e.val_loss);
        let last = evaluated.next()?;
        let previous = evaluated.next()?;
        Some(previous - last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(losses: &[f32]) -> LossMetrics {
        let mut m = LossMetrics::new();
        for &l in losses {
            m.update(LossValues {
                total: l,
                reconstruction: l,
                intensity: 0.0,
            });
        }
        m
    }

    #[test]
    fn test_metrics_average_and_display() {
        let mut m = metrics(&[1.0, 3.0]);
        m.skip();
        assert_eq!(m.avg_loss(), 2.0);
        assert!(m.to_string().contains("1 skipped"));
        assert!(LossMetrics::new().avg_loss().is_nan());
    }

    #[test]
    fn test_history_tracks_best() {
        let mut h = TrainingHistory::new();
        h.record_epoch(0, &metrics(&[1.0]), Some(&metrics(&[0.8])), 1e-3);
        h.record_epoch(1, &metrics(&[0.9]), None, 1e-3);
        h.record_epoch(2, &metrics(&[0.7]), Some(&metrics(&[0.5])), 1e-3);
        h.record_epoch(3, &metrics(&[0.6]), Some(&metrics(&[0.6])), 5e-4);

        assert_eq!(h.best_val_loss, Some(0.5));
        assert_eq!(h.best_epoch, Some(2));
        assert_eq!(h.epochs.len(), 4);
        assert_eq!(h.epochs[1].val_loss, None);
        assert!((h.last_improvement().unwrap() + 0.1).abs() < 1e-6);
    }
}
