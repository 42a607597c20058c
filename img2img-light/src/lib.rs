//! Image-to-image translation training for Candle, inspired by PyTorch Lightning.
//!
//! The crate pairs a small Lightning-style framework ([`LightModule`],
//! [`Trainer`], callbacks, metrics, learning-rate schedules) with the pieces of
//! a paired translation pipeline: an aligned A|B image dataset, a generator
//! factory and [`UnetModel`], a generator trained with an L1 reconstruction
//! loss.
//!
//! ```no_run
//! use img2img_light::data::{AlignedDataset, AlignedLoader, DatasetOptions};
//! use img2img_light::{LightModule, Options, Trainer, TrainerConfig, UnetModel};
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = candle::Device::Cpu;
//! let mut options = UnetModel::modify_options(Options::default(), true);
//! options.dataroot = "./datasets/facades".into();
//! options.validate()?;
//!
//! let dataset = AlignedDataset::open(
//!     options.phase_dir(),
//!     DatasetOptions::from_options(&options),
//!     device.clone(),
//! )?;
//! let loader = AlignedLoader::from_options(dataset, &options);
//!
//! let mut model = UnetModel::new(options.clone(), &device)?;
//! let mut optimizer = model.configure_optimizer()?;
//! let mut trainer = Trainer::new(TrainerConfig::from_options(&options, device));
//! trainer.fit(&mut model, &mut optimizer, loader, None)?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod models;
pub mod module;
pub mod networks;
pub mod options;
pub mod scheduler;
pub mod trainer;
pub mod visuals;

pub use callbacks::{Callback, EarlyStopping, EpochMetrics, Mode, ModelCheckpoint, Monitor};
pub use config::TrainerConfig;
pub use error::{Error, Result};
pub use models::UnetModel;
pub use module::{LightModule, StepOutput};
pub use options::Options;
pub use scheduler::{LrPolicy, LrScheduler};
pub use trainer::{BatchSource, EpochIter, Trainer};

pub use candle::{Module, ModuleT};
