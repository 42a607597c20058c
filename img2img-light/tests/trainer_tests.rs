#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{Device, Tensor, Var};
use candle_nn::{Linear, Module, Optimizer, SGD};
use img2img_light::{
    Callback, EarlyStopping, EpochMetrics, LightModule, LrPolicy, LrScheduler, Mode, StepOutput,
    Trainer, TrainerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct Rows {
    xs: Tensor,
    ys: Tensor,
}

impl Rows {
    /// Targets of `y = w . x + b` for the given rows.
    fn generated(xs: &[[f32; 2]], w: [f32; 2], b: f32, device: &Device) -> Result<Self> {
        let flat: Vec<f32> = xs.iter().flatten().copied().collect();
        let xs = Tensor::from_vec(flat, (xs.len(), 2), device)?;
        let truth = Linear::new(Tensor::new(&[w], device)?, Some(Tensor::new(b, device)?));
        let ys = truth.forward(&xs)?;
        Ok(Self { xs, ys })
    }

    fn single(x: [f32; 2], y: f32, device: &Device) -> Result<Self> {
        Ok(Self {
            xs: Tensor::new(&[x], device)?,
            ys: Tensor::new(&[[y]], device)?,
        })
    }
}

const TRAIN_XS: [[f32; 2]; 4] = [[2., 1.], [7., 4.], [-4., 12.], [5., 8.]];

/// Least squares regression on two features.
struct Regression {
    linear: Linear,
    w: Var,
    b: Var,
}

impl Regression {
    fn new(device: &Device) -> Result<Self> {
        let w = Var::new(&[[0f32, 0.]], device)?;
        let b = Var::new(0f32, device)?;
        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        Ok(Self { linear, w, b })
    }

    fn sse(&self, rows: &Rows) -> candle::Result<Tensor> {
        self.linear.forward(&rows.xs)?.sub(&rows.ys)?.sqr()?.sum_all()
    }
}

impl LightModule for Regression {
    type Batch = Rows;

    fn training_step(&mut self, rows: &Rows, _batch_idx: usize) -> candle::Result<StepOutput> {
        Ok(StepOutput::new(self.sse(rows)?))
    }

    fn validation_step(&self, rows: &Rows, _batch_idx: usize) -> candle::Result<StepOutput> {
        let loss = self.sse(rows)?;
        let rmse = (loss.to_scalar::<f32>()? as f64 / rows.xs.dim(0)? as f64).sqrt();
        Ok(StepOutput::new(loss).with_metric("rmse", rmse))
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone()]
    }
}

fn quiet(max_epochs: usize) -> TrainerConfig {
    TrainerConfig::new()
        .max_epochs(max_epochs)
        .log_every_n_steps(0)
}

#[derive(Clone, Default)]
struct Counters {
    epoch_starts: Arc<AtomicUsize>,
    epoch_ends: Arc<AtomicUsize>,
    batch_ends: Arc<AtomicUsize>,
    fit_ends: Arc<AtomicUsize>,
}

impl Callback for Counters {
    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> candle::Result<()> {
        self.epoch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        self.epoch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> candle::Result<()> {
        self.batch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> candle::Result<()> {
        self.fit_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every epoch's metrics.
#[derive(Clone, Default)]
struct History(Arc<Mutex<Vec<EpochMetrics>>>);

impl History {
    fn epochs(&self) -> Vec<EpochMetrics> {
        self.0.lock().unwrap().clone()
    }
}

impl Callback for History {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        self.0.lock().unwrap().push(metrics.clone());
        Ok(())
    }
}

#[test]
fn fit_recovers_linear_relationship() -> Result<()> {
    let device = Device::Cpu;
    let train = vec![Rows::generated(&TRAIN_XS, [3., 1.], -2., &device)?];

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;
    let mut trainer = Trainer::new(quiet(1000));
    trainer.fit(&mut model, &mut optimizer, train, None)?;

    let w = model.w.to_vec2::<f32>()?;
    let b = model.b.to_scalar::<f32>()?;
    assert!((w[0][0] - 3.0).abs() < 0.01, "w = {w:?}");
    assert!((w[0][1] - 1.0).abs() < 0.01, "w = {w:?}");
    assert!((b + 2.0).abs() < 0.03, "b = {b}");
    assert_eq!(trainer.global_step(), 1000);
    Ok(())
}

#[test]
fn validation_feeds_epoch_metrics() -> Result<()> {
    let device = Device::Cpu;
    let rows = Rows::generated(&TRAIN_XS, [3., 1.], -2., &device)?;
    let history = History::default();

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;
    let mut trainer = Trainer::new(quiet(100)).with_callback(history.clone());
    trainer.fit(
        &mut model,
        &mut optimizer,
        vec![rows.clone()],
        Some(vec![rows.clone()]),
    )?;

    let epochs = history.epochs();
    assert_eq!(epochs.len(), 100);
    let (first, last) = (&epochs[0], &epochs[99]);
    let first_val = first.val_loss.expect("validation ran");
    let last_val = last.val_loss.expect("validation ran");
    assert!(last_val < first_val);
    assert!(last.get("val_rmse").is_some());

    let (loss, metrics) = trainer.validate_with_metrics(&model, &[rows])?;
    assert!(loss.is_finite());
    assert!(metrics["rmse"] >= 0.0);

    let held_out = Rows::single([2., 1.], 5., &device)?;
    assert!(trainer.validate(&model, &[held_out])?.is_finite());
    Ok(())
}

#[test]
fn callbacks_see_every_hook() -> Result<()> {
    let device = Device::Cpu;
    let train = vec![
        Rows::single([1., 0.], 1., &device)?,
        Rows::single([0., 1.], 1., &device)?,
    ];
    let counters = Counters::default();

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;
    let mut trainer = Trainer::new(quiet(5)).with_callback(counters.clone());
    trainer.fit(&mut model, &mut optimizer, train, None)?;

    assert_eq!(counters.epoch_starts.load(Ordering::SeqCst), 5);
    assert_eq!(counters.epoch_ends.load(Ordering::SeqCst), 5);
    // Two batches per epoch.
    assert_eq!(counters.batch_ends.load(Ordering::SeqCst), 10);
    assert_eq!(counters.fit_ends.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Asks to stop after a fixed number of epochs.
struct StopAfter {
    epochs: usize,
    seen: usize,
}

impl Callback for StopAfter {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        self.seen += 1;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.seen >= self.epochs
    }
}

#[test]
fn any_callback_can_stop_training() -> Result<()> {
    let device = Device::Cpu;
    let counters = Counters::default();

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;
    let mut trainer = Trainer::new(quiet(100))
        .with_callback(counters.clone())
        .with_callback(StopAfter { epochs: 3, seen: 0 });
    trainer.fit(
        &mut model,
        &mut optimizer,
        vec![Rows::single([1., 0.], 1., &device)?],
        None,
    )?;

    assert_eq!(counters.epoch_starts.load(Ordering::SeqCst), 3);
    assert_eq!(counters.fit_ends.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn early_stopping_on_diverging_validation() -> Result<()> {
    let device = Device::Cpu;
    // Fit y = 3x + z - 2 but validate against y = -x + 2z + 5, so the
    // validation loss rises as the training fit improves.
    let train = vec![Rows::generated(&TRAIN_XS, [3., 1.], -2., &device)?];
    let val = vec![Rows::generated(
        &[[1., 1.], [2., 3.], [0., 2.]],
        [-1., 2.],
        5.,
        &device,
    )?];
    let counters = Counters::default();

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;
    let mut trainer = Trainer::new(quiet(500))
        .with_callback(counters.clone())
        .with_callback(
            EarlyStopping::new()
                .monitor("val_loss")
                .patience(5)
                .mode(Mode::Min),
        );
    trainer.fit(&mut model, &mut optimizer, train, Some(val))?;

    let epochs_run = counters.epoch_starts.load(Ordering::SeqCst);
    assert!(epochs_run < 500, "ran all {epochs_run} epochs");
    assert!(epochs_run > 5, "stopped after only {epochs_run} epochs");
    Ok(())
}

#[test]
fn scheduler_updates_optimizer_between_epochs() -> Result<()> {
    let device = Device::Cpu;
    let history = History::default();
    // Two epochs at the base rate, then two decaying to zero.
    let scheduler = LrScheduler::new(LrPolicy::Linear, 0.1)
        .n_epochs(2)
        .n_epochs_decay(2);

    let mut model = Regression::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.1)?;
    let mut trainer = Trainer::new(quiet(4))
        .with_lr_scheduler(scheduler)
        .with_callback(history.clone());
    trainer.fit(
        &mut model,
        &mut optimizer,
        vec![Rows::single([1., 0.], 1., &device)?],
        None,
    )?;

    let rates: Vec<f64> = history
        .epochs()
        .iter()
        .filter_map(|m| m.learning_rate)
        .collect();
    let expected = [0.1, 0.1 * 2. / 3., 0.1 / 3., 0.0];
    assert_eq!(rates.len(), expected.len());
    for (got, want) in rates.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "{rates:?}");
    }
    assert!(optimizer.learning_rate().abs() < 1e-12);
    Ok(())
}

/// Validation loss is the batch mean of `ys`; the model has nothing to learn.
struct MeanTarget;

impl LightModule for MeanTarget {
    type Batch = Rows;

    fn training_step(&mut self, rows: &Rows, _batch_idx: usize) -> candle::Result<StepOutput> {
        Ok(StepOutput::new(rows.ys.mean_all()?))
    }

    fn validation_step(&self, rows: &Rows, _batch_idx: usize) -> candle::Result<StepOutput> {
        let mean = rows.ys.mean_all()?;
        let value = mean.to_scalar::<f32>()? as f64;
        Ok(StepOutput::new(mean).with_metric("mean", value))
    }

    fn parameters(&self) -> Vec<Var> {
        Vec::new()
    }

    fn batch_size(&self, rows: &Rows) -> usize {
        rows.ys.dim(0).unwrap_or(1)
    }
}

#[test]
fn validation_weights_batches_by_size() -> Result<()> {
    let device = Device::Cpu;
    let one = Rows::single([0., 0.], 1., &device)?;
    let three = Rows {
        xs: Tensor::zeros((3, 2), candle::DType::F32, &device)?,
        ys: Tensor::new(&[[3f32], [3.], [3.]], &device)?,
    };

    // Four samples: 1 + 3 + 3 + 3, not the mean of the two batch means.
    let trainer = Trainer::new(quiet(1));
    let (loss, metrics) = trainer.validate_with_metrics(&MeanTarget, &[one, three])?;
    assert!((loss - 2.5).abs() < 1e-6, "loss = {loss}");
    assert!((metrics["mean"] - 2.5).abs() < 1e-6);
    Ok(())
}
