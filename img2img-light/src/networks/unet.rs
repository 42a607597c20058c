//! U-Net generator with skip connections between mirrored levels.

use candle::{Result, Tensor};
use candle_nn::{ops, Conv2d, ConvTranspose2d, Dropout, Module, ModuleT, VarBuilder};

use super::{conv2d, conv_transpose2d, ConvSpec, GeneratorConfig, Norm, NormKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Outermost,
    Middle,
    Innermost,
}

/// One encoder/decoder pair. The decoder of every level but the outermost
/// concatenates its output with the level's input along the channel axis.
#[derive(Debug, Clone)]
struct UnetLevel {
    role: Role,
    down_conv: Conv2d,
    down_norm: Norm,
    up_conv: ConvTranspose2d,
    up_norm: Norm,
    dropout: Option<Dropout>,
}

impl UnetLevel {
    #[allow(clippy::too_many_arguments)]
    fn new(
        role: Role,
        outer_nc: usize,
        inner_nc: usize,
        input_nc: usize,
        use_dropout: bool,
        config: &GeneratorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bias = config.norm.conv_bias();
        let init = &config.init;
        let spec = ConvSpec::new(4, 2, 1);
        let down_conv = conv2d(input_nc, inner_nc, spec, bias, init, vb.pp("down_conv"))?;
        let (down_norm, up_in, up_bias, up_norm) = match role {
            Role::Outermost => (NormKind::None, inner_nc * 2, true, NormKind::None),
            Role::Middle => (config.norm, inner_nc * 2, bias, config.norm),
            Role::Innermost => (NormKind::None, inner_nc, bias, config.norm),
        };
        let down_norm = Norm::new(down_norm, inner_nc, init, vb.pp("down_norm"))?;
        let up_conv = conv_transpose2d(up_in, outer_nc, spec, up_bias, init, vb.pp("up_conv"))?;
        let up_norm = Norm::new(up_norm, outer_nc, init, vb.pp("up_norm"))?;
        let dropout = (use_dropout && role == Role::Middle).then(|| Dropout::new(0.5));
        Ok(Self {
            role,
            down_conv,
            down_norm,
            up_conv,
            up_norm,
            dropout,
        })
    }

    fn down(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = match self.role {
            Role::Outermost => xs.clone(),
            Role::Middle | Role::Innermost => ops::leaky_relu(xs, 0.2)?,
        };
        self.down_conv.forward(&xs)?.apply_t(&self.down_norm, train)
    }

    fn up(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self
            .up_conv
            .forward(&xs.relu()?)?
            .apply_t(&self.up_norm, train)?;
        match (&self.dropout, self.role) {
            (_, Role::Outermost) => ys.tanh(),
            (Some(dropout), _) => dropout.forward_t(&ys, train),
            (None, _) => Ok(ys),
        }
    }
}

/// U-Net generator; an image of side `2^num_downs` is reduced to 1x1 at the
/// bottleneck.
#[derive(Debug, Clone)]
pub struct UnetGenerator {
    /// Outermost level first.
    levels: Vec<UnetLevel>,
}

impl UnetGenerator {
    pub fn new(config: &GeneratorConfig, num_downs: usize, vb: VarBuilder) -> Result<Self> {
        if num_downs < 5 {
            candle::bail!("a U-Net needs at least 5 downsamplings, got {num_downs}")
        }
        let ngf = config.ngf;
        // (outer_nc, inner_nc, input_nc, dropout) from the outside in.
        let mut shapes = vec![
            (Role::Outermost, config.output_nc, ngf, config.input_nc, false),
            (Role::Middle, ngf, ngf * 2, ngf, false),
            (Role::Middle, ngf * 2, ngf * 4, ngf * 2, false),
            (Role::Middle, ngf * 4, ngf * 8, ngf * 4, false),
        ];
        for _ in 0..num_downs - 5 {
            shapes.push((Role::Middle, ngf * 8, ngf * 8, ngf * 8, config.use_dropout));
        }
        shapes.push((Role::Innermost, ngf * 8, ngf * 8, ngf * 8, false));

        let levels = shapes
            .into_iter()
            .enumerate()
            .map(|(i, (role, outer_nc, inner_nc, input_nc, dropout))| {
                UnetLevel::new(role, outer_nc, inner_nc, input_nc, dropout, config, vb.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { levels })
    }

    pub fn num_downs(&self) -> usize {
        self.levels.len()
    }
}

impl ModuleT for UnetGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.levels.len());
        let mut hidden = xs.clone();
        for level in &self.levels {
            skips.push(hidden.clone());
            hidden = level.down(&hidden, train)?;
        }
        for (level, skip) in self.levels.iter().zip(skips.iter()).rev() {
            let up = level.up(&hidden, train)?;
            hidden = match level.role {
                Role::Outermost => up,
                Role::Middle | Role::Innermost => Tensor::cat(&[skip, &up], 1)?,
            };
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::{GeneratorKind, InitKind, PaddingKind, WeightInit};
    use candle::{DType, Device};
    use candle_nn::VarMap;

    fn config(norm: NormKind, input_nc: usize, output_nc: usize) -> GeneratorConfig {
        GeneratorConfig {
            input_nc,
            output_nc,
            ngf: 2,
            kind: GeneratorKind::Unet { num_downs: 5 },
            norm,
            use_dropout: true,
            init: WeightInit::new(InitKind::Normal, 0.02),
            padding: PaddingKind::Reflect,
        }
    }

    #[test]
    fn output_matches_input_size() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let unet = UnetGenerator::new(&config(NormKind::Batch, 3, 1), 5, vb)?;
        assert_eq!(unet.num_downs(), 5);

        let xs = Tensor::randn(0f32, 1., (2, 3, 32, 32), &dev)?;
        let ys = unet.forward_t(&xs, true)?;
        assert_eq!(ys.dims(), &[2, 1, 32, 32]);

        let max = ys.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max <= 1.0, "tanh output escaped [-1, 1]: {max}");
        Ok(())
    }

    #[test]
    fn deeper_unet_adds_dropout_levels() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let unet = UnetGenerator::new(&config(NormKind::Instance, 1, 1), 7, vb)?;
        let with_dropout = unet.levels.iter().filter(|l| l.dropout.is_some()).count();
        assert_eq!(with_dropout, 2);

        let xs = Tensor::randn(0f32, 1., (1, 1, 128, 128), &dev)?;
        let ys = unet.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), &[1, 1, 128, 128]);
        Ok(())
    }

    #[test]
    fn batch_norm_drops_conv_bias() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        UnetGenerator::new(&config(NormKind::Batch, 3, 3), 5, vb)?;
        let data = varmap.data().lock().unwrap();
        assert!(!data.contains_key("1.down_conv.bias"));
        // The outermost decoder always has a bias.
        assert!(data.contains_key("0.up_conv.bias"));
        Ok(())
    }

    #[test]
    fn rejects_shallow_unet() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(UnetGenerator::new(&config(NormKind::Batch, 3, 3), 4, vb).is_err());
    }
}
