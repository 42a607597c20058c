//! Training loop implementation.

use crate::callbacks::EpochMetrics;
use crate::scheduler::LrScheduler;
use crate::{Callback, LightModule, TrainerConfig};
use candle::Result;
use candle_nn::Optimizer;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::time::Instant;

/// Batches of one epoch, produced as the iterator advances.
pub type EpochIter<'a, B> = Box<dyn Iterator<Item = Result<B>> + 'a>;

/// Something that hands out the batches of one epoch at a time.
///
/// Sources that read from disk decode each batch when it is requested, so
/// only the batch being processed is resident.
pub trait BatchSource {
    type Batch;

    fn epoch_batches(&mut self, epoch: usize) -> Result<EpochIter<'_, Self::Batch>>;
}

impl<B: Clone> BatchSource for Vec<B> {
    type Batch = B;

    fn epoch_batches(&mut self, _epoch: usize) -> Result<EpochIter<'_, B>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    lr_scheduler: Option<LrScheduler>,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            lr_scheduler: None,
            global_step: 0,
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Adjusts the optimizer's learning rate at the end of every epoch.
    pub fn with_lr_scheduler(mut self, scheduler: LrScheduler) -> Self {
        self.lr_scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Optimizer steps taken so far, over all `fit` calls.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn fit<M, O, S>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        mut train_data: S,
        mut val_data: Option<S>,
    ) -> Result<()>
    where
        M: LightModule,
        O: Optimizer,
        S: BatchSource<Batch = M::Batch>,
    {
        // Callbacks get `&Trainer`, so they are held outside of `self` while
        // the loop runs.
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let result = self.run(
            &mut callbacks,
            model,
            optimizer,
            &mut train_data,
            val_data.as_mut(),
        );
        self.callbacks = callbacks;
        result
    }

    fn run<M, O, S>(
        &mut self,
        callbacks: &mut [Box<dyn Callback>],
        model: &mut M,
        optimizer: &mut O,
        train_data: &mut S,
        mut val_data: Option<&mut S>,
    ) -> Result<()>
    where
        M: LightModule,
        O: Optimizer,
        S: BatchSource<Batch = M::Batch>,
    {
        tracing::info!(
            max_epochs = self.config.max_epochs,
            learning_rate = optimizer.learning_rate(),
            "starting training"
        );
        for cb in callbacks.iter_mut() {
            cb.on_fit_start(self)?;
        }

        for epoch in 0..self.config.max_epochs {
            let started = Instant::now();
            for cb in callbacks.iter_mut() {
                cb.on_epoch_start(self, epoch)?;
            }

            let mut total_loss = 0f64;
            let mut n_batches = 0usize;
            for (batch_idx, batch) in train_data.epoch_batches(epoch)?.enumerate() {
                let batch = batch?;
                let output = model.optimize_parameters(optimizer, &batch, batch_idx)?;
                let loss = output.loss_value()?;
                total_loss += loss as f64;
                n_batches += 1;
                self.global_step += 1;

                let every = self.config.log_every_n_steps;
                if every > 0 && self.global_step % every == 0 {
                    tracing::info!(
                        epoch,
                        step = self.global_step,
                        loss,
                        metrics = ?output.metrics,
                        "train step"
                    );
                }
                for cb in callbacks.iter_mut() {
                    cb.on_train_batch_end(self, batch_idx, &output)?;
                }
            }
            let train_loss = (total_loss / n_batches.max(1) as f64) as f32;

            let mut metrics = EpochMetrics::new(train_loss);
            if let Some(val) = val_data.as_deref_mut() {
                let (val_loss, val_metrics) = self.evaluate(model, val.epoch_batches(epoch)?)?;
                metrics.val_loss = Some(val_loss);
                metrics.val_metrics = val_metrics;
            }

            if let Some(scheduler) = self.lr_scheduler.as_mut() {
                let old_lr = optimizer.learning_rate();
                let monitored = metrics.val_loss.unwrap_or(metrics.train_loss);
                let new_lr = scheduler.step(Some(monitored));
                optimizer.set_learning_rate(new_lr);
                if new_lr != old_lr {
                    tracing::info!("learning rate {old_lr:.7} -> {new_lr:.7}");
                }
            }
            metrics.learning_rate = Some(optimizer.learning_rate());

            tracing::info!(
                epoch,
                train_loss = metrics.train_loss,
                val_loss = ?metrics.val_loss,
                elapsed_secs = started.elapsed().as_secs_f32(),
                "end of epoch"
            );

            for cb in callbacks.iter_mut() {
                cb.on_epoch_end(self, epoch, &metrics)?;
            }
            if callbacks.iter().any(|cb| cb.should_stop()) {
                tracing::info!(epoch, "stopping early at the request of a callback");
                break;
            }
        }

        for cb in callbacks.iter_mut() {
            cb.on_fit_end(self)?;
        }
        Ok(())
    }

    /// Mean validation loss over `batches`.
    pub fn validate<M: LightModule>(&self, model: &M, batches: &[M::Batch]) -> Result<f32> {
        self.validate_with_metrics(model, batches).map(|(loss, _)| loss)
    }

    /// Mean validation loss and mean of every metric reported by
    /// `validation_step`, each weighted by batch size.
    pub fn validate_with_metrics<M: LightModule>(
        &self,
        model: &M,
        batches: &[M::Batch],
    ) -> Result<(f32, HashMap<String, f64>)> {
        self.evaluate(model, batches.iter().map(Ok))
    }

    fn evaluate<M, B>(
        &self,
        model: &M,
        batches: impl Iterator<Item = Result<B>>,
    ) -> Result<(f32, HashMap<String, f64>)>
    where
        M: LightModule,
        B: Borrow<M::Batch>,
    {
        let mut total_loss = 0f64;
        let mut seen = 0usize;
        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for (batch_idx, batch) in batches.enumerate() {
            let owned = batch?;
            let batch: &M::Batch = owned.borrow();
            let weight = model.batch_size(batch);
            let output = model.validation_step(batch, batch_idx)?;
            total_loss += output.loss_value()? as f64 * weight as f64;
            seen += weight;
            for (name, value) in output.metrics {
                let entry = sums.entry(name).or_insert((0.0, 0));
                entry.0 += value * weight as f64;
                entry.1 += weight;
            }
        }
        let loss = (total_loss / seen.max(1) as f64) as f32;
        let metrics = sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n.max(1) as f64))
            .collect();
        Ok((loss, metrics))
    }
}
