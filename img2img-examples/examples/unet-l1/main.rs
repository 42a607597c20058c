// Paired image translation with a U-Net generator and an L1 loss.
//
//   cargo run --example unet-l1 --release -- train --dataroot ./datasets/facades --name facades
//   cargo run --example unet-l1 --release -- test --dataroot ./datasets/facades --name facades
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle::Device;
use clap::{Args, Parser, Subcommand};
use img2img_light::data::{AlignedDataset, AlignedLoader, DatasetOptions, Direction, Preprocess};
use img2img_light::metrics::{MeanAbsoluteError, Metric, Psnr};
use img2img_light::networks::{InitKind, NormKind, PaddingKind};
use img2img_light::{
    visuals, EarlyStopping, LrPolicy, LrScheduler, Mode, ModelCheckpoint, Options, Trainer,
    TrainerConfig, UnetModel,
};

#[derive(Parser)]
#[command(about = "Train or test a U-Net image-to-image translator with an L1 loss")]
struct Cli {
    /// Run on the CPU even when an accelerator is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Train(TrainArgs),
    Test(TestArgs),
}

/// Flags shared by both commands; each one overrides the JSON config.
#[derive(Args)]
struct CommonArgs {
    /// JSON object overriding any option by field name.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    dataroot: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    checkpoints_dir: Option<PathBuf>,
    #[arg(long)]
    direction: Option<Direction>,
    #[arg(long)]
    net_g: Option<String>,
    #[arg(long)]
    ngf: Option<usize>,
    #[arg(long)]
    norm: Option<NormKind>,
    #[arg(long)]
    init_type: Option<InitKind>,
    #[arg(long)]
    no_dropout: bool,
    /// Padding inside ResNet blocks: reflect, replicate or zero.
    #[arg(long)]
    padding_type: Option<PaddingKind>,
    #[arg(long)]
    input_nc: Option<usize>,
    #[arg(long)]
    output_nc: Option<usize>,
    #[arg(long)]
    load_size: Option<usize>,
    #[arg(long)]
    crop_size: Option<usize>,
    #[arg(long)]
    preprocess: Option<Preprocess>,
    #[arg(long)]
    max_dataset_size: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Checkpoint label, `latest` or an epoch number.
    #[arg(long)]
    epoch: Option<String>,
}

impl CommonArgs {
    fn apply(&self, options: Options) -> Result<Options> {
        let mut options = match &self.config {
            Some(path) => options
                .merge_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => options,
        };
        if let Some(v) = &self.dataroot {
            options.dataroot = v.clone();
        }
        if let Some(v) = &self.name {
            options.name = v.clone();
        }
        if let Some(v) = &self.checkpoints_dir {
            options.checkpoints_dir = v.clone();
        }
        if let Some(v) = self.direction {
            options.direction = v;
        }
        if let Some(v) = &self.net_g {
            options.net_g = v.clone();
        }
        if let Some(v) = self.ngf {
            options.ngf = v;
        }
        if let Some(v) = self.norm {
            options.norm = v;
        }
        if let Some(v) = self.init_type {
            options.init_type = v;
        }
        options.no_dropout |= self.no_dropout;
        if let Some(v) = self.padding_type {
            options.padding_type = v;
        }
        if let Some(v) = self.input_nc {
            options.input_nc = v;
        }
        if let Some(v) = self.output_nc {
            options.output_nc = v;
        }
        if let Some(v) = self.load_size {
            options.load_size = v;
        }
        if let Some(v) = self.crop_size {
            options.crop_size = v;
        }
        if let Some(v) = self.preprocess {
            options.preprocess = v;
        }
        if let Some(v) = self.max_dataset_size {
            options.max_dataset_size = Some(v);
        }
        if let Some(v) = self.batch_size {
            options.batch_size = v;
        }
        if let Some(v) = self.seed {
            options.seed = v;
        }
        if let Some(v) = &self.epoch {
            options.load_epoch = v.clone();
        }
        Ok(options)
    }
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    n_epochs: Option<usize>,
    #[arg(long)]
    n_epochs_decay: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    beta1: Option<f64>,
    #[arg(long)]
    lr_policy: Option<LrPolicy>,
    #[arg(long)]
    lambda_l1: Option<f64>,
    #[arg(long)]
    print_freq: Option<usize>,
    #[arg(long)]
    save_epoch_freq: Option<usize>,
    /// Resume from the `--epoch` checkpoint.
    #[arg(long)]
    continue_train: bool,
    /// First epoch number when resuming.
    #[arg(long)]
    epoch_count: Option<usize>,
    /// Keep dataset order instead of shuffling.
    #[arg(long)]
    serial_batches: bool,
    #[arg(long)]
    no_flip: bool,
    /// Validate on `dataroot/<phase>` after every epoch.
    #[arg(long)]
    val_phase: Option<String>,
    /// Stop after this many epochs without a better validation loss.
    #[arg(long, requires = "val_phase")]
    early_stopping_patience: Option<usize>,
}

impl TrainArgs {
    fn options(&self) -> Result<Options> {
        let mut options = UnetModel::modify_options(Options::default(), true);
        options = self.common.apply(options)?;
        if let Some(v) = self.n_epochs {
            options.n_epochs = v;
        }
        if let Some(v) = self.n_epochs_decay {
            options.n_epochs_decay = v;
        }
        if let Some(v) = self.lr {
            options.lr = v;
        }
        if let Some(v) = self.beta1 {
            options.beta1 = v;
        }
        if let Some(v) = self.lr_policy {
            options.lr_policy = v;
        }
        if let Some(v) = self.lambda_l1 {
            options.lambda_l1 = v;
        }
        if let Some(v) = self.print_freq {
            options.print_freq = v;
        }
        if let Some(v) = self.save_epoch_freq {
            options.save_epoch_freq = v;
        }
        if let Some(v) = self.epoch_count {
            options.epoch_count = v;
        }
        options.continue_train |= self.continue_train;
        options.serial_batches |= self.serial_batches;
        options.no_flip |= self.no_flip;
        options.validate()?;
        Ok(options)
    }
}

#[derive(Args)]
struct TestArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    results_dir: Option<PathBuf>,
    #[arg(long)]
    phase: Option<String>,
    #[arg(long)]
    num_test: Option<usize>,
    /// Disable dropout and use running batch-norm statistics.
    #[arg(long)]
    eval: bool,
}

impl TestArgs {
    fn options(&self) -> Result<Options> {
        let mut options = UnetModel::modify_options(Options::for_test(), false);
        options = self.common.apply(options)?;
        if let Some(v) = &self.results_dir {
            options.results_dir = v.clone();
        }
        if let Some(v) = &self.phase {
            options.phase = v.clone();
        }
        if let Some(v) = self.num_test {
            options.num_test = v;
        }
        options.eval |= self.eval;
        options.validate()?;
        Ok(options)
    }
}

fn train(args: &TrainArgs, device: &Device) -> Result<()> {
    let options = args.options()?;
    let save_dir = options.save_dir();
    std::fs::create_dir_all(&save_dir)?;
    let opt_path = save_dir.join("train_opt.json");
    std::fs::write(&opt_path, serde_json::to_string_pretty(&options)?)?;
    tracing::info!(path = %opt_path.display(), "wrote options");

    let dataset = AlignedDataset::open(
        options.phase_dir(),
        DatasetOptions::from_options(&options),
        device.clone(),
    )?;
    let loader = AlignedLoader::from_options(dataset, &options);
    let val_loader = match &args.val_phase {
        Some(phase) => {
            let mut dataset_options = DatasetOptions::from_options(&options);
            dataset_options.no_flip = true;
            let dataset =
                AlignedDataset::open(options.dataroot.join(phase), dataset_options, device.clone())?;
            Some(AlignedLoader::new(dataset, options.batch_size, false, options.seed))
        }
        None => None,
    };

    let mut model = UnetModel::new(options.clone(), device)?;
    if options.continue_train {
        model.load_networks(&save_dir, &options.load_epoch)?;
    }
    model.setup();
    let mut optimizer = model.configure_optimizer()?;

    let checkpoint = ModelCheckpoint::new(model.varmap().clone(), &save_dir)
        .name("net_G")
        .monitor("val_loss")
        .save_top_k(usize::from(val_loader.is_some()))
        .save_last(true)
        .every_n_epochs(options.save_epoch_freq)
        .epoch_offset(options.epoch_count);
    let mut trainer = Trainer::new(TrainerConfig::from_options(&options, device.clone()))
        .with_callback(checkpoint)
        .with_lr_scheduler(LrScheduler::from_options(&options));
    if let Some(patience) = args.early_stopping_patience {
        trainer = trainer.with_callback(
            EarlyStopping::new()
                .monitor("val_loss")
                .patience(patience)
                .mode(Mode::Min),
        );
    }

    trainer.fit(&mut model, &mut optimizer, loader, val_loader)?;
    tracing::info!(steps = trainer.global_step(), dir = %save_dir.display(), "training finished");
    Ok(())
}

fn test(args: &TestArgs, device: &Device) -> Result<()> {
    let options = args.options()?;
    let mut dataset_options = DatasetOptions::from_options(&options);
    dataset_options.max_dataset_size = Some(
        options
            .max_dataset_size
            .map_or(options.num_test, |max| max.min(options.num_test)),
    );
    let dataset = AlignedDataset::open(options.phase_dir(), dataset_options, device.clone())?;
    let mut loader = AlignedLoader::new(dataset, 1, false, options.seed);

    let mut model = UnetModel::new(options.clone(), device)?;
    model.load_networks(options.save_dir(), &options.load_epoch)?;
    model.setup();

    let image_dir = options
        .results_dir
        .join(&options.name)
        .join(format!("{}_{}", options.phase, options.load_epoch))
        .join("images");
    let mut mae = MeanAbsoluteError::new();
    let mut psnr = Psnr::default();
    for (i, batch) in loader.batches().enumerate() {
        model.set_input(&batch?)?;
        model.test()?;
        let stem = model
            .image_paths()
            .first()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{i:04}"));
        let visuals = model.current_visuals();
        visuals::save_visuals(&image_dir, &stem, &visuals)?;

        let find = |name: &str| visuals.iter().find(|(n, _)| *n == name).map(|(_, t)| t);
        if let (Some(fake), Some(real)) = (find("fake_B"), find("real_B")) {
            mae.update(fake, real)?;
            psnr.update(fake, real)?;
        }
        if i % 5 == 0 {
            tracing::info!("processing ({i:04})-th image... {stem}");
        }
    }
    tracing::info!(
        l1 = mae.compute(),
        psnr = psnr.compute(),
        dir = %image_dir.display(),
        "finished testing"
    );
    Ok(())
}

fn main() -> Result<()> {
    img2img_examples::init_tracing();
    let cli = Cli::parse();
    let device = img2img_examples::device(cli.cpu)?;
    tracing::info!(?device, "using device");

    match &cli.command {
        Command::Train(args) => train(args, &device),
        Command::Test(args) => test(args, &device),
    }
}
