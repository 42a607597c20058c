//! Generator-only translation model trained with an L1 reconstruction loss.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle::backprop::GradStore;
use candle::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, ModuleT, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::data::PairedBatch;
use crate::error::{Error, Result};
use crate::metrics::{Metric, Psnr};
use crate::networks::{self, Generator, GeneratorConfig, NormKind};
use crate::options::Options;
use crate::{LightModule, StepOutput};

/// Losses reported by [`UnetModel::current_losses`].
pub const LOSS_NAMES: [&str; 1] = ["G_L1"];
/// Images reported by [`UnetModel::current_visuals`], in display order.
pub const VISUAL_NAMES: [&str; 3] = ["real_A", "fake_B", "real_B"];
/// Networks saved and loaded as `{label}_net_{name}.safetensors`.
pub const MODEL_NAMES: [&str; 1] = ["G"];

const BETA2: f64 = 0.999;

/// Mean absolute difference between two tensors of the same shape.
pub fn l1_loss(preds: &Tensor, targets: &Tensor) -> candle::Result<Tensor> {
    (preds - targets)?.abs()?.mean_all()
}

/// Learns a mapping from input images to output images with a single
/// generator `G`; `fake_B = G(real_A)` is pulled towards `real_B` by
/// `lambda_l1 * L1(fake_B, real_B)`.
pub struct UnetModel {
    options: Options,
    device: Device,
    varmap: VarMap,
    net_g: Generator,
    training: bool,
    real_a: Option<Tensor>,
    real_b: Option<Tensor>,
    fake_b: Option<Tensor>,
    image_paths: Vec<PathBuf>,
    loss_g_l1: Option<Tensor>,
}

impl UnetModel {
    /// Rewrites the defaults this model needs: batch norm, a 256 U-Net and,
    /// for training, an L1 weight of 100. Data is always read as aligned pairs.
    pub fn modify_options(mut options: Options, is_train: bool) -> Options {
        options.norm = NormKind::Batch;
        options.net_g = "unet_256".to_string();
        options.is_train = is_train;
        if is_train {
            options.lambda_l1 = 100.0;
        }
        options
    }

    pub fn new(options: Options, device: &Device) -> Result<Self> {
        let config = GeneratorConfig::from_options(&options)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net_g = networks::define_g(&config, vb.pp("net_G"))?;
        let training = options.is_train || !options.eval;
        Ok(Self {
            options,
            device: device.clone(),
            varmap,
            net_g,
            training,
            real_a: None,
            real_b: None,
            fake_b: None,
            image_paths: Vec::new(),
            loss_g_l1: None,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Handle to the variables of every network; clones share storage.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn generator(&self) -> &Generator {
        &self.net_g
    }

    /// Adam over G's parameters with `betas = (beta1, 0.999)`.
    pub fn configure_optimizer(&self) -> Result<AdamW> {
        if !self.options.is_train {
            return Err(Error::Config(
                "an optimizer was requested for a model built for inference".to_string(),
            ));
        }
        let params = ParamsAdamW {
            lr: self.options.lr,
            beta1: self.options.beta1,
            beta2: BETA2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        Ok(AdamW::new(self.parameters(), params)?)
    }

    /// Eval mode disables dropout and uses running batch-norm statistics.
    pub fn set_eval(&mut self, eval: bool) {
        self.training = !eval;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Number of trainable values, excluding batch-norm running statistics.
    pub fn num_parameters(&self) -> usize {
        let data = match self.varmap.data().lock() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.iter()
            .filter(|(name, _)| !name.contains("running_"))
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    /// Logs the size of every network.
    pub fn setup(&self) {
        for name in MODEL_NAMES {
            tracing::info!(
                network = name,
                generator = %self.options.net_g,
                parameters_m = self.num_parameters() as f64 / 1e6,
                "initialized network"
            );
        }
    }

    /// Unpacks a batch; with `BtoA` the roles of A and B are swapped.
    pub fn set_input(&mut self, batch: &PairedBatch) -> candle::Result<()> {
        let direction = self.options.direction;
        let (input, target) = direction.order(&batch.a, &batch.b);
        let (paths, _) = direction.order(&batch.a_paths, &batch.b_paths);
        self.real_a = Some(input.to_device(&self.device)?);
        self.real_b = Some(target.to_device(&self.device)?);
        self.image_paths = paths.clone();
        Ok(())
    }

    fn real_a(&self) -> candle::Result<&Tensor> {
        match &self.real_a {
            Some(t) => Ok(t),
            None => candle::bail!("set_input must be called before running the generator"),
        }
    }

    /// fake_B = G(real_A)
    pub fn forward(&mut self) -> candle::Result<()> {
        let fake_b = self.net_g.forward_t(self.real_a()?, self.training)?;
        self.fake_b = Some(fake_b);
        Ok(())
    }

    /// Forward pass without gradient tracking.
    pub fn test(&mut self) -> candle::Result<()> {
        let fake_b = self.net_g.forward_t(self.real_a()?, self.training)?.detach();
        self.fake_b = Some(fake_b);
        Ok(())
    }

    /// Computes and records `loss_G_L1 = L1(fake_B, real_B) * lambda_l1`.
    pub fn compute_loss_g(&mut self) -> candle::Result<Tensor> {
        let (Some(fake_b), Some(real_b)) = (&self.fake_b, &self.real_b) else {
            candle::bail!("forward must run before the loss is computed")
        };
        let loss = l1_loss(fake_b, real_b)?.affine(self.options.lambda_l1, 0.0)?;
        self.loss_g_l1 = Some(loss.clone());
        Ok(loss)
    }

    /// Back-propagates `loss_G_L1` into a fresh gradient store.
    pub fn backward_g(&mut self) -> candle::Result<GradStore> {
        self.compute_loss_g()?.backward()
    }

    fn step_output(&self) -> candle::Result<StepOutput> {
        let Some(loss) = &self.loss_g_l1 else {
            candle::bail!("no loss has been computed yet")
        };
        let value = loss.to_scalar::<f32>()?;
        Ok(StepOutput::new(loss.clone()).with_metric(LOSS_NAMES[0], value as f64))
    }

    /// Latest value of every tracked loss.
    pub fn current_losses(&self) -> candle::Result<BTreeMap<String, f32>> {
        let mut losses = BTreeMap::new();
        if let Some(loss) = &self.loss_g_l1 {
            losses.insert(LOSS_NAMES[0].to_string(), loss.to_scalar::<f32>()?);
        }
        Ok(losses)
    }

    /// The images named in [`VISUAL_NAMES`] that are currently available.
    pub fn current_visuals(&self) -> Vec<(&'static str, Tensor)> {
        let [real_a, fake_b, real_b] = VISUAL_NAMES;
        [
            (real_a, &self.real_a),
            (fake_b, &self.fake_b),
            (real_b, &self.real_b),
        ]
        .into_iter()
        .filter_map(|(name, tensor)| tensor.as_ref().map(|t| (name, t.clone())))
        .collect()
    }

    /// Paths of the images behind the current input.
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    fn network_path(dir: &Path, label: &str, name: &str) -> PathBuf {
        dir.join(format!("{label}_net_{name}.safetensors"))
    }

    pub fn save_networks(&self, dir: impl AsRef<Path>, label: &str) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut paths = Vec::with_capacity(MODEL_NAMES.len());
        for name in MODEL_NAMES {
            let path = Self::network_path(dir, label, name);
            self.varmap.save(&path)?;
            tracing::info!(path = %path.display(), "saved network");
            paths.push(path);
        }
        Ok(paths)
    }

    pub fn load_networks(&mut self, dir: impl AsRef<Path>, label: &str) -> Result<()> {
        let dir = dir.as_ref();
        for name in MODEL_NAMES {
            let path = Self::network_path(dir, label, name);
            if !path.is_file() {
                return Err(Error::Checkpoint(format!(
                    "no weights for net_{name} at {}",
                    path.display()
                )));
            }
            self.varmap.load(&path)?;
            tracing::info!(path = %path.display(), "loaded network");
        }
        Ok(())
    }
}

impl LightModule for UnetModel {
    type Batch = PairedBatch;

    fn training_step(&mut self, batch: &PairedBatch, _batch_idx: usize) -> candle::Result<StepOutput> {
        self.set_input(batch)?;
        self.forward()?;
        self.compute_loss_g()?;
        self.step_output()
    }

    fn validation_step(&self, batch: &PairedBatch, _batch_idx: usize) -> candle::Result<StepOutput> {
        let (input, target) = self.options.direction.order(&batch.a, &batch.b);
        let input = input.to_device(&self.device)?;
        let target = target.to_device(&self.device)?;
        let fake = self.net_g.forward_t(&input, false)?.detach();

        let l1 = l1_loss(&fake, &target)?;
        let loss = l1.affine(self.options.lambda_l1, 0.0)?;
        let mut psnr = Psnr::default();
        psnr.update(&fake, &target)?;
        Ok(StepOutput::new(loss)
            .with_metric("l1", l1.to_scalar::<f32>()? as f64)
            .with_metric("psnr", psnr.compute()))
    }

    fn batch_size(&self, batch: &PairedBatch) -> usize {
        batch.len()
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Forward, zero gradients, backward, update.
    fn optimize_parameters<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        batch: &PairedBatch,
        _batch_idx: usize,
    ) -> candle::Result<StepOutput> {
        self.set_input(batch)?;
        // compute fake images: G(A)
        self.forward()?;
        // gradients start from an empty store and get G's L1 gradients
        let grads = self.backward_g()?;
        // update G's weights
        optimizer.step(&grads)?;
        self.step_output()
    }
}
