//! Run options for training and testing an image translation model.
//!
//! Options are layered: [`Options::default`] holds the framework-wide
//! defaults, a model rewrites some of them (see
//! [`UnetModel::modify_options`](crate::models::UnetModel::modify_options)),
//! a JSON file may override any field ([`Options::merge_json_file`]) and the
//! command line has the last word.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::{Direction, Preprocess};
use crate::error::{Error, Result};
use crate::networks::{GeneratorKind, InitKind, NormKind, PaddingKind};
use crate::scheduler::LrPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Experiment name; checkpoints land in `checkpoints_dir/name`.
    pub name: String,
    pub checkpoints_dir: PathBuf,
    pub results_dir: PathBuf,
    pub seed: u64,

    /// Root of the dataset; images are read from `dataroot/phase`.
    pub dataroot: PathBuf,
    pub phase: String,
    pub direction: Direction,
    pub batch_size: usize,
    pub load_size: usize,
    pub crop_size: usize,
    pub preprocess: Preprocess,
    pub no_flip: bool,
    /// Keep dataset order instead of shuffling every epoch.
    pub serial_batches: bool,
    pub max_dataset_size: Option<usize>,

    /// Channels of the input image (1 = grayscale, 3 = RGB).
    pub input_nc: usize,
    pub output_nc: usize,
    /// Filters in the last conv layer of the generator.
    pub ngf: usize,
    pub net_g: String,
    pub norm: NormKind,
    pub no_dropout: bool,
    pub init_type: InitKind,
    pub init_gain: f64,
    /// Padding inside the residual blocks of a ResNet generator.
    pub padding_type: PaddingKind,

    pub is_train: bool,
    /// Number of the first epoch; greater than one when resuming.
    pub epoch_count: usize,
    /// Epochs at the initial learning rate.
    pub n_epochs: usize,
    /// Epochs over which the learning rate decays linearly to zero.
    pub n_epochs_decay: usize,
    pub lr: f64,
    pub beta1: f64,
    pub lr_policy: LrPolicy,
    pub lr_decay_iters: usize,
    /// Weight of the L1 reconstruction loss.
    pub lambda_l1: f64,
    pub print_freq: usize,
    pub save_epoch_freq: usize,
    pub continue_train: bool,
    /// Checkpoint label to load, `latest` or an epoch number.
    pub load_epoch: String,

    /// Run inference in eval mode (no dropout, running batch-norm stats).
    pub eval: bool,
    pub num_test: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "experiment_name".to_string(),
            checkpoints_dir: PathBuf::from("./checkpoints"),
            results_dir: PathBuf::from("./results"),
            seed: 0,
            dataroot: PathBuf::new(),
            phase: "train".to_string(),
            direction: Direction::AtoB,
            batch_size: 1,
            load_size: 286,
            crop_size: 256,
            preprocess: Preprocess::ResizeAndCrop,
            no_flip: false,
            serial_batches: false,
            max_dataset_size: None,
            input_nc: 3,
            output_nc: 3,
            ngf: 64,
            net_g: "resnet_9blocks".to_string(),
            norm: NormKind::Instance,
            no_dropout: false,
            init_type: InitKind::Normal,
            init_gain: 0.02,
            padding_type: PaddingKind::Reflect,
            is_train: true,
            epoch_count: 1,
            n_epochs: 100,
            n_epochs_decay: 100,
            lr: 0.0002,
            beta1: 0.5,
            lr_policy: LrPolicy::Linear,
            lr_decay_iters: 50,
            lambda_l1: 100.0,
            print_freq: 100,
            save_epoch_freq: 5,
            continue_train: false,
            load_epoch: "latest".to_string(),
            eval: false,
            num_test: 50,
        }
    }
}

impl Options {
    /// Defaults for an inference run.
    pub fn for_test() -> Self {
        Self {
            is_train: false,
            phase: "test".to_string(),
            preprocess: Preprocess::Resize,
            load_size: 256,
            no_flip: true,
            serial_batches: true,
            batch_size: 1,
            ..Self::default()
        }
    }

    /// Overlays the fields present in a JSON object file onto `self`.
    ///
    /// Unknown keys are rejected so that typos do not silently fall back to
    /// defaults.
    pub fn merge_json_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        self.merge_json_str(&text)
    }

    pub fn merge_json_str(self, text: &str) -> Result<Self> {
        let overlay: serde_json::Value = serde_json::from_str(text)?;
        let mut merged = serde_json::to_value(&self)?;
        match (&mut merged, overlay) {
            (serde_json::Value::Object(base), serde_json::Value::Object(fields)) => {
                for (key, value) in fields {
                    if !base.contains_key(&key) {
                        return Err(Error::Config(format!("unknown option `{key}`")));
                    }
                    base.insert(key, value);
                }
            }
            _ => {
                return Err(Error::Config(
                    "options file must contain a JSON object".to_string(),
                ))
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Directory holding this experiment's checkpoints.
    pub fn save_dir(&self) -> PathBuf {
        self.checkpoints_dir.join(&self.name)
    }

    /// Directory holding the images of the current phase.
    pub fn phase_dir(&self) -> PathBuf {
        self.dataroot.join(&self.phase)
    }

    pub fn generator_kind(&self) -> Result<GeneratorKind> {
        self.net_g.parse()
    }

    /// Side length of the images fed to the network, when it is fixed.
    pub fn network_input_size(&self) -> Option<usize> {
        match self.preprocess {
            Preprocess::ResizeAndCrop | Preprocess::Crop => Some(self.crop_size),
            Preprocess::Resize => Some(self.load_size),
            Preprocess::None => None,
        }
    }

    /// Checks ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.ngf == 0 {
            return Err(Error::Config("ngf must be positive".to_string()));
        }
        for (field, channels) in [("input_nc", self.input_nc), ("output_nc", self.output_nc)] {
            if channels != 1 && channels != 3 {
                return Err(Error::Config(format!(
                    "{field} must be 1 or 3, got {channels}"
                )));
            }
        }
        if self.crop_size == 0 || self.load_size == 0 {
            return Err(Error::Config(
                "load_size and crop_size must be positive".to_string(),
            ));
        }
        if self.preprocess == Preprocess::ResizeAndCrop && self.crop_size > self.load_size {
            return Err(Error::Config(format!(
                "crop_size {} is larger than load_size {}",
                self.crop_size, self.load_size
            )));
        }
        if self.is_train {
            if !(self.lr > 0.0) {
                return Err(Error::Config("lr must be positive".to_string()));
            }
            if !(0.0..1.0).contains(&self.beta1) {
                return Err(Error::Config("beta1 must be in [0, 1)".to_string()));
            }
            if self.lambda_l1 < 0.0 {
                return Err(Error::Config("lambda_l1 must not be negative".to_string()));
            }
            if self.epoch_count == 0 {
                return Err(Error::Config("epoch_count starts at 1".to_string()));
            }
            if self.lr_policy == LrPolicy::Step && self.lr_decay_iters == 0 {
                return Err(Error::Config(
                    "the step policy needs lr_decay_iters > 0".to_string(),
                ));
            }
            if self.lr_policy == LrPolicy::Cosine && self.n_epochs == 0 {
                return Err(Error::Config(
                    "the cosine policy needs n_epochs > 0".to_string(),
                ));
            }
        }

        let kind = self.generator_kind()?;
        if let Some(size) = self.network_input_size() {
            let factor = kind.size_multiple();
            if size % factor != 0 {
                return Err(Error::Config(format!(
                    "{} needs images whose side is a multiple of {factor}, got {size}",
                    self.net_g
                )));
            }
        }
        Ok(())
    }
}
