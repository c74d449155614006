//! Learning-rate reduction on validation plateaus

use serde::{Deserialize, Serialize};

/// Multiplies the learning rate by `factor` once the monitored loss has not
/// improved for more than `patience` consecutive steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    /// Relative improvement required to reset the patience counter
    threshold: f64,
    min_lr: f64,
    best: Option<f64>,
    num_bad_steps: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        ReduceLrOnPlateau {
            lr,
            factor,
            patience,
            threshold: 1e-4,
            min_lr,
            best: None,
            num_bad_steps: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    fn is_better(&self, loss: f64) -> bool {
        match self.best {
            _ if !loss.is_finite() => false,
            None => true,
            Some(best) => loss < best * (1.0 - self.threshold),
        }
    }

    /// Record a validation loss; returns the learning rate to use next
    pub fn step(&mut self, loss: f64) -> f64 {
        if self.is_better(loss) {
            self.best = Some(loss);
            self.num_bad_steps = 0;
        } else {
            self.num_bad_steps += 1;
        }

        if self.num_bad_steps > self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if reduced < self.lr {
                log::info!("Reducing learning rate from {:.3e} to {:.3e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.num_bad_steps = 0;
        }
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduces_after_patience_exceeded() {
        let mut sch = ReduceLrOnPlateau::new(1e-3, 0.5, 2, 1e-6);
        assert_eq!(sch.step(1.0), 1e-3);
        assert_eq!(sch.step(1.0), 1e-3);
        assert_eq!(sch.step(1.0), 1e-3);
        assert_eq!(sch.step(1.0), 5e-4);
        // Counter resets after a reduction
        assert_eq!(sch.step(1.0), 5e-4);
        assert_eq!(sch.best(), Some(1.0));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut sch = ReduceLrOnPlateau::new(1e-3, 0.5, 1, 1e-6);
        sch.step(1.0);
        sch.step(1.0);
        sch.step(0.5);
        assert_eq!(sch.step(0.5), 1e-3);
        assert_eq!(sch.step(0.5), 5e-4);
    }

    #[test]
    fn test_min_lr_and_nan() {
        let mut sch = ReduceLrOnPlateau::new(1e-3, 0.1, 0, 5e-4);
        sch.step(1.0);
        assert_eq!(sch.step(f64::NAN), 5e-4);
        assert_eq!(sch.step(2.0), 5e-4);
        assert_eq!(sch.best(), Some(1.0));
    }

    #[test]
    fn test_state_serializes() {
        let mut sch = ReduceLrOnPlateau::new(1e-3, 0.5, 3, 0.0);
        let json = serde_json::to_string(&sch).unwrap();
        let restored: ReduceLrOnPlateau = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sch);
        sch.step(0.3);
        let restored: ReduceLrOnPlateau =
            serde_json::from_str(&serde_json::to_string(&sch).unwrap()).unwrap();
        assert_eq!(restored.best(), Some(0.3));
    }
}
