//! ResNet generator: downsample twice, run residual blocks, upsample twice.

use candle::{Result, Tensor};
use candle_nn::{Conv2d, ConvTranspose2d, Dropout, Module, ModuleT, VarBuilder};

use super::{conv2d, conv_transpose2d, ConvSpec, GeneratorConfig, Norm, PaddingKind};

const N_DOWNSAMPLING: usize = 2;

#[derive(Debug, Clone)]
struct ResnetBlock {
    padding: PaddingKind,
    conv1: Conv2d,
    norm1: Norm,
    dropout: Option<Dropout>,
    conv2: Conv2d,
    norm2: Norm,
}

impl ResnetBlock {
    fn new(dim: usize, config: &GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        let bias = config.norm.conv_bias();
        let spec = ConvSpec::new(3, 1, 0);
        Ok(Self {
            padding: config.padding,
            conv1: conv2d(dim, dim, spec, bias, &config.init, vb.pp("conv1"))?,
            norm1: Norm::new(config.norm, dim, &config.init, vb.pp("norm1"))?,
            dropout: config.use_dropout.then(|| Dropout::new(0.5)),
            conv2: conv2d(dim, dim, spec, bias, &config.init, vb.pp("conv2"))?,
            norm2: Norm::new(config.norm, dim, &config.init, vb.pp("norm2"))?,
        })
    }
}

impl ModuleT for ResnetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.padding.pad(xs, 1)?;
        let mut ys = self.conv1.forward(&ys)?.apply_t(&self.norm1, train)?.relu()?;
        if let Some(dropout) = &self.dropout {
            ys = dropout.forward_t(&ys, train)?;
        }
        let ys = self.padding.pad(&ys, 1)?;
        let ys = self.conv2.forward(&ys)?.apply_t(&self.norm2, train)?;
        xs + ys
    }
}

#[derive(Debug, Clone)]
pub struct ResnetGenerator {
    stem: Conv2d,
    stem_norm: Norm,
    downs: Vec<(Conv2d, Norm)>,
    blocks: Vec<ResnetBlock>,
    ups: Vec<(ConvTranspose2d, Norm)>,
    head: Conv2d,
}

impl ResnetGenerator {
    pub fn new(config: &GeneratorConfig, n_blocks: usize, vb: VarBuilder) -> Result<Self> {
        let ngf = config.ngf;
        let bias = config.norm.conv_bias();
        let init = &config.init;

        let stem = conv2d(config.input_nc, ngf, ConvSpec::new(7, 1, 0), bias, init, vb.pp("stem"))?;
        let stem_norm = Norm::new(config.norm, ngf, init, vb.pp("stem_norm"))?;

        let mut downs = Vec::with_capacity(N_DOWNSAMPLING);
        for i in 0..N_DOWNSAMPLING {
            let mult = 1 << i;
            let vb = vb.pp(format!("down{i}"));
            let conv = conv2d(ngf * mult, ngf * mult * 2, ConvSpec::new(3, 2, 1), bias, init, vb.pp("conv"))?;
            let norm = Norm::new(config.norm, ngf * mult * 2, init, vb.pp("norm"))?;
            downs.push((conv, norm));
        }

        let dim = ngf * (1 << N_DOWNSAMPLING);
        let blocks = (0..n_blocks)
            .map(|i| ResnetBlock::new(dim, config, vb.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let mut ups = Vec::with_capacity(N_DOWNSAMPLING);
        for i in 0..N_DOWNSAMPLING {
            let mult = 1 << (N_DOWNSAMPLING - i);
            let vb = vb.pp(format!("up{i}"));
            let spec = ConvSpec::new(3, 2, 1).output_padding(1);
            let conv = conv_transpose2d(ngf * mult, ngf * mult / 2, spec, bias, init, vb.pp("conv"))?;
            let norm = Norm::new(config.norm, ngf * mult / 2, init, vb.pp("norm"))?;
            ups.push((conv, norm));
        }

        let head = conv2d(ngf, config.output_nc, ConvSpec::new(7, 1, 0), true, init, vb.pp("head"))?;
        Ok(Self {
            stem,
            stem_norm,
            downs,
            blocks,
            ups,
            head,
        })
    }
}

impl ModuleT for ResnetGenerator {
    /// The 7x7 stem and head always reflect-pad; `config.padding` applies to
    /// the residual blocks.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut ys = self
            .stem
            .forward(&PaddingKind::Reflect.pad(xs, 3)?)?
            .apply_t(&self.stem_norm, train)?
            .relu()?;
        for (conv, norm) in &self.downs {
            ys = conv.forward(&ys)?.apply_t(norm, train)?.relu()?;
        }
        for block in &self.blocks {
            ys = block.forward_t(&ys, train)?;
        }
        for (conv, norm) in &self.ups {
            ys = conv.forward(&ys)?.apply_t(norm, train)?.relu()?;
        }
        self.head.forward(&PaddingKind::Reflect.pad(&ys, 3)?)?.tanh()
    }
}
