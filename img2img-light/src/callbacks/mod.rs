//! Callback system for training hooks.

mod checkpoint;
mod early_stopping;

pub use checkpoint::ModelCheckpoint;
pub use early_stopping::EarlyStopping;

use crate::{StepOutput, Trainer};
use candle::Result;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    /// Averaged validation metrics, keyed without the `val_` prefix.
    pub val_metrics: HashMap<String, f64>,
    /// Learning rate in effect for the next epoch.
    pub learning_rate: Option<f64>,
}

impl EpochMetrics {
    pub fn new(train_loss: f32) -> Self {
        Self {
            train_loss,
            val_loss: None,
            val_metrics: HashMap::new(),
            learning_rate: None,
        }
    }

    /// Looks up `train_loss`, `val_loss` or `val_<metric>`.
    pub fn get(&self, name: &str) -> Option<f32> {
        match name {
            "train_loss" => Some(self.train_loss),
            "val_loss" => self.val_loss,
            _ => name
                .strip_prefix("val_")
                .and_then(|metric| self.val_metrics.get(metric))
                .map(|&v| v as f32),
        }
    }
}

/// A named metric watched for improvement.
#[derive(Clone, Debug)]
pub struct Monitor {
    pub(crate) name: String,
    pub(crate) mode: Mode,
    pub(crate) min_delta: f32,
    best: Option<f32>,
}

impl Monitor {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            min_delta: 0.0,
            best: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    /// The watched value for this epoch, if it was reported.
    pub fn read(&self, metrics: &EpochMetrics) -> Option<f32> {
        metrics.get(&self.name)
    }

    /// Whether `a` is a better value than `b`, ignoring `min_delta`.
    pub fn prefers(&self, a: f32, b: f32) -> bool {
        match self.mode {
            Mode::Min => a < b,
            Mode::Max => a > b,
        }
    }

    /// Records `value` when it beats the best by more than `min_delta`.
    pub fn update(&mut self, value: f32) -> bool {
        let improved = match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), Mode::Min) => value < best - self.min_delta,
            (Some(best), Mode::Max) => value > best + self.min_delta,
        };
        if improved {
            self.best = Some(value);
        }
        improved
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn should_stop(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_lookup() {
        let mut metrics = EpochMetrics::new(0.5);
        metrics.val_loss = Some(0.25);
        metrics.val_metrics.insert("psnr".to_string(), 21.0);
        assert_eq!(metrics.get("train_loss"), Some(0.5));
        assert_eq!(metrics.get("val_loss"), Some(0.25));
        assert_eq!(metrics.get("val_psnr"), Some(21.0));
        assert_eq!(metrics.get("val_ssim"), None);
        assert_eq!(metrics.get("psnr"), None);
    }

    #[test]
    fn monitor_respects_mode_and_delta() {
        let mut min = Monitor::new("val_loss", Mode::Min);
        min.min_delta = 0.1;
        assert!(min.update(1.0));
        assert!(!min.update(0.95));
        assert!(min.update(0.8));
        assert_eq!(min.best(), Some(0.8));

        let mut max = Monitor::new("val_psnr", Mode::Max);
        assert!(max.update(20.0));
        assert!(!max.update(19.0));
        assert!(max.update(22.5));
        assert!(max.prefers(23.0, 22.5));
    }
}
