//! Model checkpointing callback.

use super::{Callback, EpochMetrics, Mode, Monitor};
use crate::Trainer;
use candle::Result;
use candle_nn::VarMap;
use std::path::{Path, PathBuf};

/// Saves the variables of a `VarMap` as safetensors files.
///
/// Three kinds of files can be written, each optional:
/// * the best `save_top_k` checkpoints by the monitored metric,
///   `epoch_{epoch:04}_{monitor}_{value:.4}.safetensors`;
/// * every `n` epochs, `{epoch}_{name}.safetensors`;
/// * after every epoch, `latest_{name}.safetensors`.
///
/// Epoch labels are `epoch + epoch_offset`, 1-based by default.
pub struct ModelCheckpoint {
    varmap: VarMap,
    dirpath: PathBuf,
    name: String,
    monitor: Monitor,
    save_top_k: usize,
    every_n_epochs: Option<usize>,
    save_last: bool,
    epoch_offset: usize,
    /// Monitored checkpoints on disk, best first.
    kept: Vec<(f32, PathBuf)>,
}

impl ModelCheckpoint {
    /// `varmap` is a handle sharing storage with the model's variables.
    pub fn new(varmap: VarMap, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            name: "model".to_string(),
            monitor: Monitor::new("val_loss", Mode::Min),
            save_top_k: 1,
            every_n_epochs: None,
            save_last: false,
            epoch_offset: 1,
            kept: Vec::new(),
        }
    }

    /// Suffix of the periodic and latest files, e.g. `net_G`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor.name = metric.into();
        self
    }

    /// Zero disables the monitored checkpoints.
    pub fn save_top_k(mut self, k: usize) -> Self {
        self.save_top_k = k;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.monitor.mode = mode;
        self
    }

    pub fn every_n_epochs(mut self, n: usize) -> Self {
        self.every_n_epochs = (n > 0).then_some(n);
        self
    }

    pub fn save_last(mut self, save_last: bool) -> Self {
        self.save_last = save_last;
        self
    }

    pub fn epoch_offset(mut self, offset: usize) -> Self {
        self.epoch_offset = offset;
        self
    }

    pub fn best_metric(&self) -> Option<f32> {
        self.monitor.best()
    }

    /// Paths of the monitored checkpoints currently kept, best first.
    pub fn best_paths(&self) -> Vec<PathBuf> {
        self.kept.iter().map(|(_, path)| path.clone()).collect()
    }

    fn write(&self, filename: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dirpath).map_err(candle::Error::wrap)?;
        let path = self.dirpath.join(filename);
        self.varmap.save(&path)?;
        tracing::debug!(path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    fn qualifies(&self, value: f32) -> bool {
        match self.kept.last() {
            _ if self.kept.len() < self.save_top_k => true,
            Some((worst, _)) => self.monitor.prefers(value, *worst),
            None => false,
        }
    }

    fn save_monitored(&mut self, label: usize, value: f32) -> Result<()> {
        let filename = format!(
            "epoch_{label:04}_{}_{value:.4}.safetensors",
            self.monitor.name()
        );
        let path = self.write(&filename)?;
        if self.monitor.update(value) {
            tracing::info!(path = %path.display(), monitor = self.monitor.name(), value, "new best checkpoint");
        }

        let at = self
            .kept
            .iter()
            .position(|(kept, _)| self.monitor.prefers(value, *kept))
            .unwrap_or(self.kept.len());
        self.kept.insert(at, (value, path));
        if self.kept.len() > self.save_top_k {
            for (_, stale) in self.kept.split_off(self.save_top_k) {
                remove_stale(&stale);
            }
        }
        Ok(())
    }
}

fn remove_stale(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), %err, "could not remove old checkpoint");
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let label = epoch + self.epoch_offset;

        if self.save_last {
            self.write(&format!("latest_{}.safetensors", self.name))?;
        }
        if let Some(n) = self.every_n_epochs.filter(|n| label % n == 0) {
            let path = self.write(&format!("{label}_{}.safetensors", self.name))?;
            tracing::info!(epoch = label, every = n, path = %path.display(), "saved periodic checkpoint");
        }

        if self.save_top_k == 0 {
            return Ok(());
        }
        match self.monitor.read(metrics) {
            Some(value) if self.qualifies(value) => self.save_monitored(label, value),
            _ => Ok(()),
        }
    }
}
