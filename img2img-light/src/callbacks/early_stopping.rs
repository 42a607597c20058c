//! Stops training once a monitored metric stops improving.

use super::{Callback, EpochMetrics, Mode, Monitor};
use crate::Trainer;
use candle::Result;

pub struct EarlyStopping {
    monitor: Monitor,
    patience: usize,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    /// Watches `val_loss` (lower is better) with a patience of 3 epochs.
    pub fn new() -> Self {
        Self {
            monitor: Monitor::new("val_loss", Mode::Min),
            patience: 3,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor.name = metric.into();
        self
    }

    /// Epochs without improvement tolerated before stopping.
    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f32) -> Self {
        self.monitor.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.monitor.mode = mode;
        self
    }

    pub fn best_metric(&self) -> Option<f32> {
        self.monitor.best()
    }

    /// Epoch at which the stop was requested.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(value) = self.monitor.read(metrics) else {
            return Ok(());
        };
        if self.monitor.update(value) {
            self.wait = 0;
            return Ok(());
        }
        self.wait += 1;
        if self.wait >= self.patience && self.stopped_epoch.is_none() {
            tracing::info!(
                epoch,
                monitor = self.monitor.name(),
                best = ?self.monitor.best(),
                "no improvement for {} epochs, stopping",
                self.wait
            );
            self.stopped_epoch = Some(epoch);
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stopped_epoch.is_some()
    }
}
