//! LightModule trait for trainable models.

use candle::{Result, Tensor, Var};
use candle_nn::Optimizer;
use std::collections::HashMap;

/// Output from a training or validation step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The loss tensor for backpropagation.
    pub loss: Tensor,
    /// Optional metrics (e.g., PSNR, per-term losses).
    pub metrics: HashMap<String, f64>,
}

impl StepOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// The loss as a host scalar.
    pub fn loss_value(&self) -> Result<f32> {
        self.loss.to_dtype(candle::DType::F32)?.to_scalar::<f32>()
    }
}

/// Trait for models that can be trained with [`Trainer`](crate::Trainer).
pub trait LightModule {
    type Batch;

    /// Runs the forward pass on a training batch and returns the loss.
    fn training_step(&mut self, batch: &Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Compute loss and metrics for a validation batch.
    fn validation_step(&self, batch: &Self::Batch, batch_idx: usize) -> Result<StepOutput> {
        let _ = (batch, batch_idx);
        candle::bail!("validation_step not implemented")
    }

    /// Number of samples in `batch`, the weight of its validation loss.
    fn batch_size(&self, batch: &Self::Batch) -> usize {
        let _ = batch;
        1
    }

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var>;

    /// One optimization step: forward, zero gradients, backward, update.
    ///
    /// Candle never accumulates gradients on variables; each backward pass
    /// fills a fresh `GradStore`, so starting from an empty store is the
    /// zeroing step.
    fn optimize_parameters<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        batch: &Self::Batch,
        batch_idx: usize,
    ) -> Result<StepOutput> {
        let output = self.training_step(batch, batch_idx)?;
        let grads = output.loss.backward()?;
        optimizer.step(&grads)?;
        Ok(output)
    }
}
