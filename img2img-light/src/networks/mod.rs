//! Generator factory: architectures, normalization layers and weight init.
//!
//! [`define_g`] builds a generator from a [`GeneratorConfig`]; every layer is
//! created through the given `VarBuilder` so that a `VarMap` behind it owns
//! all trainable variables.

mod resnet;
mod unet;

pub use resnet::ResnetGenerator;
pub use unet::UnetGenerator;

use std::fmt;
use std::str::FromStr;

use candle::{Result, Tensor};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Init, ModuleT, VarBuilder,
};
use serde::{Deserialize, Serialize};

use crate::options::Options;

/// Generator architecture, parsed from names such as `unet_256` or
/// `resnet_9blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// U-Net with `num_downs` stride-2 downsamplings.
    Unet { num_downs: usize },
    /// ResNet-style encoder/decoder with `n_blocks` residual blocks.
    Resnet { n_blocks: usize },
}

impl GeneratorKind {
    /// Image sides must be a multiple of this value.
    pub fn size_multiple(&self) -> usize {
        match self {
            GeneratorKind::Unet { num_downs } => 1usize << *num_downs,
            GeneratorKind::Resnet { .. } => 4,
        }
    }
}

impl FromStr for GeneratorKind {
    type Err = crate::Error;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || crate::Error::Config(format!("generator model name [{name}] is not recognized"));
        if let Some(size) = name.strip_prefix("unet_") {
            let size: usize = size.parse().map_err(|_| invalid())?;
            // Five levels is the shallowest U-Net: outermost, three widening
            // levels and the innermost one.
            if !size.is_power_of_two() || size < 32 {
                return Err(invalid());
            }
            return Ok(GeneratorKind::Unet {
                num_downs: size.trailing_zeros() as usize,
            });
        }
        if let Some(blocks) = name
            .strip_prefix("resnet_")
            .and_then(|rest| rest.strip_suffix("blocks"))
        {
            let n_blocks: usize = blocks.parse().map_err(|_| invalid())?;
            if n_blocks == 0 {
                return Err(invalid());
            }
            return Ok(GeneratorKind::Resnet { n_blocks });
        }
        Err(invalid())
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorKind::Unet { num_downs } => write!(f, "unet_{}", 1usize << *num_downs),
            GeneratorKind::Resnet { n_blocks } => write!(f, "resnet_{n_blocks}blocks"),
        }
    }
}

/// Normalization layer used after convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Batch norm with learned affine parameters and running statistics.
    Batch,
    /// Per-sample, per-channel normalization without affine parameters.
    Instance,
    None,
}

impl NormKind {
    /// Batch norm carries its own shift, so convolutions before it drop the bias.
    pub fn conv_bias(&self) -> bool {
        !matches!(self, NormKind::Batch)
    }
}

impl FromStr for NormKind {
    type Err = crate::Error;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        match name {
            "batch" => Ok(NormKind::Batch),
            "instance" => Ok(NormKind::Instance),
            "none" => Ok(NormKind::None),
            _ => Err(crate::Error::Config(format!(
                "normalization layer [{name}] is not found"
            ))),
        }
    }
}

/// Weight initialization scheme for convolution kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitKind {
    Normal,
    Xavier,
    Kaiming,
}

impl FromStr for InitKind {
    type Err = crate::Error;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        match name {
            "normal" => Ok(InitKind::Normal),
            "xavier" => Ok(InitKind::Xavier),
            "kaiming" => Ok(InitKind::Kaiming),
            _ => Err(crate::Error::Config(format!(
                "initialization method [{name}] is not implemented"
            ))),
        }
    }
}

/// Padding applied before the 3x3 convolutions of the ResNet blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingKind {
    #[default]
    Reflect,
    Replicate,
    Zero,
}

impl FromStr for PaddingKind {
    type Err = crate::Error;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        match name {
            "reflect" => Ok(PaddingKind::Reflect),
            "replicate" => Ok(PaddingKind::Replicate),
            "zero" => Ok(PaddingKind::Zero),
            _ => Err(crate::Error::Config(format!(
                "padding [{name}] is not implemented"
            ))),
        }
    }
}

impl PaddingKind {
    /// Pads the two spatial dimensions of an `(N, C, H, W)` tensor.
    pub fn pad(&self, xs: &Tensor, pad: usize) -> Result<Tensor> {
        match self {
            PaddingKind::Reflect => reflection_pad2d(xs, pad),
            PaddingKind::Replicate => xs.pad_with_same(2, pad, pad)?.pad_with_same(3, pad, pad),
            PaddingKind::Zero => xs.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad),
        }
    }
}

fn reflect_pad_dim(xs: &Tensor, dim: usize, pad: usize) -> Result<Tensor> {
    let len = xs.dim(dim)?;
    if pad >= len {
        candle::bail!("reflection padding {pad} needs a dimension larger than {len}")
    }
    let left: Vec<u32> = (1..=pad).rev().map(|i| i as u32).collect();
    let right: Vec<u32> = (len - 1 - pad..len - 1).rev().map(|i| i as u32).collect();
    let left = xs.index_select(&Tensor::new(left.as_slice(), xs.device())?, dim)?;
    let right = xs.index_select(&Tensor::new(right.as_slice(), xs.device())?, dim)?;
    Tensor::cat(&[&left, xs, &right], dim)
}

/// Mirror padding that excludes the edge pixel, on both spatial dimensions.
pub fn reflection_pad2d(xs: &Tensor, pad: usize) -> Result<Tensor> {
    if pad == 0 {
        return Ok(xs.clone());
    }
    let xs = reflect_pad_dim(xs, 2, pad)?;
    reflect_pad_dim(&xs, 3, pad)
}

fn instance_norm(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let flat = xs.reshape((b, c, h * w))?;
    let mean = flat.mean_keepdim(2)?;
    let centered = flat.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    centered
        .broadcast_div(&var.affine(1.0, 1e-5)?.sqrt()?)?
        .reshape((b, c, h, w))
}

/// A normalization layer selected by [`NormKind`].
#[derive(Debug, Clone)]
pub enum Norm {
    Batch(BatchNorm),
    Instance,
    Identity,
}

impl Norm {
    pub fn new(kind: NormKind, channels: usize, init: &WeightInit, vb: VarBuilder) -> Result<Self> {
        match kind {
            NormKind::Batch => {
                // Registered ahead of batch_norm, which then reuses it instead
                // of a constant-one scale.
                vb.get_with_hints(
                    channels,
                    "weight",
                    Init::Randn {
                        mean: 1.0,
                        stdev: init.gain,
                    },
                )?;
                let bn = candle_nn::batch_norm(channels, BatchNormConfig::default(), vb)?;
                Ok(Norm::Batch(bn))
            }
            NormKind::Instance => Ok(Norm::Instance),
            NormKind::None => Ok(Norm::Identity),
        }
    }
}

impl ModuleT for Norm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Norm::Batch(bn) => bn.forward_t(xs, train),
            Norm::Instance => instance_norm(xs),
            Norm::Identity => Ok(xs.clone()),
        }
    }
}

/// Initialization for convolution weights; biases always start at zero.
#[derive(Debug, Clone, Copy)]
pub struct WeightInit {
    pub kind: InitKind,
    pub gain: f64,
}

impl WeightInit {
    pub fn new(kind: InitKind, gain: f64) -> Self {
        Self { kind, gain }
    }

    /// Init for a kernel of shape `(d0, d1, kh, kw)`, fans computed the usual
    /// way from the first two dimensions.
    fn kernel(&self, shape: (usize, usize, usize, usize)) -> Init {
        let (d0, d1, kh, kw) = shape;
        let fan_in = (d1 * kh * kw) as f64;
        let fan_out = (d0 * kh * kw) as f64;
        let stdev = match self.kind {
            InitKind::Normal => self.gain,
            InitKind::Xavier => self.gain * (2.0 / (fan_in + fan_out)).sqrt(),
            InitKind::Kaiming => (2.0 / fan_in).sqrt(),
        };
        Init::Randn { mean: 0.0, stdev }
    }
}

/// Kernel geometry of a convolution layer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConvSpec {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
}

impl ConvSpec {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride,
            padding,
            output_padding: 0,
        }
    }

    pub fn output_padding(mut self, output_padding: usize) -> Self {
        self.output_padding = output_padding;
        self
    }
}

pub(crate) fn conv2d(
    in_channels: usize,
    out_channels: usize,
    spec: ConvSpec,
    bias: bool,
    init: &WeightInit,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let shape = (out_channels, in_channels, spec.kernel, spec.kernel);
    let weight = vb.get_with_hints(shape, "weight", init.kernel(shape))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    let config = Conv2dConfig {
        padding: spec.padding,
        stride: spec.stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, bias, config))
}

pub(crate) fn conv_transpose2d(
    in_channels: usize,
    out_channels: usize,
    spec: ConvSpec,
    bias: bool,
    init: &WeightInit,
    vb: VarBuilder,
) -> Result<ConvTranspose2d> {
    let shape = (in_channels, out_channels, spec.kernel, spec.kernel);
    let weight = vb.get_with_hints(shape, "weight", init.kernel(shape))?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    let config = ConvTranspose2dConfig {
        padding: spec.padding,
        output_padding: spec.output_padding,
        stride: spec.stride,
        ..Default::default()
    };
    Ok(ConvTranspose2d::new(weight, bias, config))
}

/// Everything [`define_g`] needs to build a generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    pub ngf: usize,
    pub kind: GeneratorKind,
    pub norm: NormKind,
    pub use_dropout: bool,
    pub init: WeightInit,
    pub padding: PaddingKind,
}

impl GeneratorConfig {
    pub fn from_options(options: &Options) -> crate::Result<Self> {
        Ok(Self {
            input_nc: options.input_nc,
            output_nc: options.output_nc,
            ngf: options.ngf,
            kind: options.generator_kind()?,
            norm: options.norm,
            use_dropout: !options.no_dropout,
            init: WeightInit::new(options.init_type, options.init_gain),
            padding: options.padding_type,
        })
    }
}

/// A generator network; the input and output are `(N, C, H, W)` images in
/// `[-1, 1]`.
#[derive(Debug, Clone)]
pub enum Generator {
    Unet(UnetGenerator),
    Resnet(ResnetGenerator),
}

impl ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Generator::Unet(g) => g.forward_t(xs, train),
            Generator::Resnet(g) => g.forward_t(xs, train),
        }
    }
}

/// Builds the generator described by `config`.
pub fn define_g(config: &GeneratorConfig, vb: VarBuilder) -> Result<Generator> {
    match config.kind {
        GeneratorKind::Unet { num_downs } => {
            UnetGenerator::new(config, num_downs, vb.pp("unet")).map(Generator::Unet)
        }
        GeneratorKind::Resnet { n_blocks } => {
            ResnetGenerator::new(config, n_blocks, vb.pp("resnet")).map(Generator::Resnet)
        }
    }
}
