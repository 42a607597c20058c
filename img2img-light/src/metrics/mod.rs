//! Metrics for tracking training progress.

use candle::{DType, Result, Tensor};

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

fn check_shapes(preds: &Tensor, targets: &Tensor) -> Result<()> {
    if preds.dims() != targets.dims() {
        candle::bail!(
            "prediction shape {:?} does not match target shape {:?}",
            preds.dims(),
            targets.dims()
        )
    }
    Ok(())
}

/// Mean absolute (L1) error over every element seen.
#[derive(Debug, Default, Clone)]
pub struct MeanAbsoluteError {
    sum: f64,
    count: usize,
}

impl MeanAbsoluteError {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for MeanAbsoluteError {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        check_shapes(preds, targets)?;
        let sum = (preds - targets)?
            .abs()?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;
        self.sum += sum;
        self.count += preds.elem_count();
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Peak signal-to-noise ratio in dB, averaged over images.
///
/// Images are `(N, C, H, W)` or `(C, H, W)` with values spanning
/// `data_range` (2.0 for images scaled to `[-1, 1]`).
#[derive(Debug, Clone)]
pub struct Psnr {
    data_range: f64,
    sum: f64,
    count: usize,
}

impl Default for Psnr {
    fn default() -> Self {
        Self::new(2.0)
    }
}

/// Ceiling for identical images.
const MAX_PSNR: f64 = 100.0;

impl Psnr {
    pub fn new(data_range: f64) -> Self {
        Self {
            data_range,
            sum: 0.0,
            count: 0,
        }
    }
}

impl Metric for Psnr {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        check_shapes(preds, targets)?;
        let (preds, targets) = if preds.rank() == 3 {
            (preds.unsqueeze(0)?, targets.unsqueeze(0)?)
        } else {
            (preds.clone(), targets.clone())
        };
        let mses = (preds - targets)?
            .sqr()?
            .to_dtype(DType::F64)?
            .flatten_from(1)?
            .mean(1)?
            .to_vec1::<f64>()?;
        for mse in mses {
            let psnr = if mse <= 0.0 {
                MAX_PSNR
            } else {
                (10.0 * (self.data_range * self.data_range / mse).log10()).min(MAX_PSNR)
            };
            self.sum += psnr;
            self.count += 1;
        }
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}
