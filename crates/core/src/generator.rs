//! The CartoonGAN generator: a fixed encoder, eight residual blocks, a
//! decoder and a sigmoid, evaluated as an ordered list of layer descriptors.

use std::path::Path;

use tracing::info;

use crate::checkpoint::{
    self, ConvParams, NormParams, ParamTensor, ParameterMap, ParameterSource, ResidualParams,
};
use crate::error::{Result, ToonError};
use crate::layers::{
    Activation, BatchNorm2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Layer,
    LayerDescriptor, ResidualBlock,
};
use crate::tensor::{Shape, Tensor};

pub const RESIDUAL_BLOCKS: usize = 8;
pub const RESIDUAL_CHANNELS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    Standard,
    Transposed,
}

/// Hyperparameters of one convolution in the fixed architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub name: &'static str,
    pub kind: ConvKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
}

impl ConvSpec {
    const fn standard(
        name: &'static str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        Self {
            name,
            kind: ConvKind::Standard,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            output_padding: 0,
        }
    }

    const fn transposed(
        name: &'static str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        output_padding: usize,
    ) -> Self {
        Self {
            name,
            kind: ConvKind::Transposed,
            in_channels,
            out_channels,
            kernel: 3,
            stride,
            padding: 1,
            output_padding,
        }
    }

    /// Kernel shape as stored in the checkpoint.
    pub fn weight_shape(&self) -> [usize; 4] {
        let k = self.kernel;
        match self.kind {
            ConvKind::Standard => [self.out_channels, self.in_channels, k, k],
            ConvKind::Transposed => [self.in_channels, self.out_channels, k, k],
        }
    }

    fn load(&self, source: &dyn ParameterSource) -> Result<ConvParams> {
        ConvParams::load(source, self.name, self.weight_shape(), self.out_channels)
    }

    fn build(&self, params: ConvParams) -> Result<LayerDescriptor> {
        let layer = match self.kind {
            ConvKind::Standard => Layer::Conv(Conv2d::new(
                params.weight,
                Some(params.bias),
                Conv2dConfig {
                    stride: self.stride,
                    padding: self.padding,
                },
            )?),
            ConvKind::Transposed => Layer::ConvTranspose(ConvTranspose2d::new(
                params.weight,
                Some(params.bias),
                ConvTranspose2dConfig {
                    stride: self.stride,
                    padding: self.padding,
                    output_padding: self.output_padding,
                },
            )?),
        };
        Ok(LayerDescriptor::new(self.name, layer))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormSpec {
    pub name: &'static str,
    pub channels: usize,
}

impl NormSpec {
    fn load(&self, source: &dyn ParameterSource) -> Result<NormParams> {
        NormParams::load(source, self.name, self.channels)
    }
}

// Input stage.
pub const CONV_1: ConvSpec = ConvSpec::standard("conv_1", 3, 64, 7, 1, 3);
pub const NORM_1: NormSpec = NormSpec { name: "norm_1", channels: 64 };
// Downsampling.
pub const CONV_2: ConvSpec = ConvSpec::standard("conv_2", 64, 128, 3, 2, 1);
pub const CONV_3: ConvSpec = ConvSpec::standard("conv_3", 128, 128, 3, 1, 1);
pub const NORM_2: NormSpec = NormSpec { name: "norm_2", channels: 128 };
pub const CONV_4: ConvSpec = ConvSpec::standard("conv_4", 128, 256, 3, 2, 1);
pub const CONV_5: ConvSpec = ConvSpec::standard("conv_5", 256, 256, 3, 1, 1);
pub const NORM_3: NormSpec = NormSpec { name: "norm_3", channels: 256 };
// Upsampling.
pub const CONV_6: ConvSpec = ConvSpec::transposed("conv_6", 256, 128, 2, 1);
pub const CONV_7: ConvSpec = ConvSpec::transposed("conv_7", 128, 128, 1, 0);
pub const NORM_4: NormSpec = NormSpec { name: "norm_4", channels: 128 };
pub const CONV_8: ConvSpec = ConvSpec::transposed("conv_8", 128, 64, 2, 1);
pub const CONV_9: ConvSpec = ConvSpec::transposed("conv_9", 64, 64, 1, 0);
pub const NORM_5: NormSpec = NormSpec { name: "norm_5", channels: 64 };
// Output stage.
pub const CONV_10: ConvSpec = ConvSpec::standard("conv_10", 64, 3, 7, 1, 3);

fn residual_name(index: usize) -> String {
    format!("res.{index}")
}

/// Every parameter of the generator, validated against the architecture.
#[derive(Debug, Clone)]
pub struct GeneratorParams {
    pub conv_1: ConvParams,
    pub norm_1: NormParams,
    pub conv_2: ConvParams,
    pub conv_3: ConvParams,
    pub norm_2: NormParams,
    pub conv_4: ConvParams,
    pub conv_5: ConvParams,
    pub norm_3: NormParams,
    pub residual: Vec<ResidualParams>,
    pub conv_6: ConvParams,
    pub conv_7: ConvParams,
    pub norm_4: NormParams,
    pub conv_8: ConvParams,
    pub conv_9: ConvParams,
    pub norm_5: NormParams,
    pub conv_10: ConvParams,
}

impl GeneratorParams {
    pub fn load(source: &dyn ParameterSource) -> Result<Self> {
        let residual = (0..RESIDUAL_BLOCKS)
            .map(|index| ResidualParams::load(source, &residual_name(index), RESIDUAL_CHANNELS))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conv_1: CONV_1.load(source)?,
            norm_1: NORM_1.load(source)?,
            conv_2: CONV_2.load(source)?,
            conv_3: CONV_3.load(source)?,
            norm_2: NORM_2.load(source)?,
            conv_4: CONV_4.load(source)?,
            conv_5: CONV_5.load(source)?,
            norm_3: NORM_3.load(source)?,
            residual,
            conv_6: CONV_6.load(source)?,
            conv_7: CONV_7.load(source)?,
            norm_4: NORM_4.load(source)?,
            conv_8: CONV_8.load(source)?,
            conv_9: CONV_9.load(source)?,
            norm_5: NORM_5.load(source)?,
            conv_10: CONV_10.load(source)?,
        })
    }
}

/// What a parameter vector holds; decides its neutral initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterRole {
    Weight,
    Bias,
    Scale,
    Shift,
    RunningMean,
    RunningVar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub key: String,
    pub shape: Vec<usize>,
    pub role: ParameterRole,
}

fn push_conv(specs: &mut Vec<ParameterSpec>, name: &str, weight_shape: [usize; 4], out: usize) {
    specs.push(ParameterSpec {
        key: format!("{name}.weight"),
        shape: weight_shape.to_vec(),
        role: ParameterRole::Weight,
    });
    specs.push(ParameterSpec {
        key: format!("{name}.bias"),
        shape: vec![out],
        role: ParameterRole::Bias,
    });
}

fn push_norm(specs: &mut Vec<ParameterSpec>, name: &str, channels: usize) {
    for (suffix, role) in [
        ("weight", ParameterRole::Scale),
        ("bias", ParameterRole::Shift),
        ("running_mean", ParameterRole::RunningMean),
        ("running_var", ParameterRole::RunningVar),
    ] {
        specs.push(ParameterSpec {
            key: format!("{name}.{suffix}"),
            shape: vec![channels],
            role,
        });
    }
}

/// Every key the generator reads, in evaluation order.
pub fn parameter_specs() -> Vec<ParameterSpec> {
    let mut specs = Vec::new();
    let conv = |specs: &mut Vec<ParameterSpec>, spec: ConvSpec| {
        push_conv(specs, spec.name, spec.weight_shape(), spec.out_channels)
    };
    let norm = |specs: &mut Vec<ParameterSpec>, spec: NormSpec| push_norm(specs, spec.name, spec.channels);

    conv(&mut specs, CONV_1);
    norm(&mut specs, NORM_1);
    conv(&mut specs, CONV_2);
    conv(&mut specs, CONV_3);
    norm(&mut specs, NORM_2);
    conv(&mut specs, CONV_4);
    conv(&mut specs, CONV_5);
    norm(&mut specs, NORM_3);
    let kernel = [RESIDUAL_CHANNELS, RESIDUAL_CHANNELS, 3, 3];
    for index in 0..RESIDUAL_BLOCKS {
        let name = residual_name(index);
        push_conv(&mut specs, &format!("{name}.conv_1"), kernel, RESIDUAL_CHANNELS);
        push_norm(&mut specs, &format!("{name}.norm_1"), RESIDUAL_CHANNELS);
        push_conv(&mut specs, &format!("{name}.conv_2"), kernel, RESIDUAL_CHANNELS);
        push_norm(&mut specs, &format!("{name}.norm_2"), RESIDUAL_CHANNELS);
    }
    conv(&mut specs, CONV_6);
    conv(&mut specs, CONV_7);
    norm(&mut specs, NORM_4);
    conv(&mut specs, CONV_8);
    conv(&mut specs, CONV_9);
    norm(&mut specs, NORM_5);
    conv(&mut specs, CONV_10);
    specs
}

/// A complete checkpoint with zero kernels and biases and neutral
/// normalization (scale 1, shift 0, mean 0, variance 1).
pub fn zero_checkpoint() -> ParameterMap {
    let mut map = ParameterMap::new();
    for spec in parameter_specs() {
        let value = match spec.role {
            ParameterRole::Scale | ParameterRole::RunningVar => 1.0,
            ParameterRole::Weight
            | ParameterRole::Bias
            | ParameterRole::Shift
            | ParameterRole::RunningMean => 0.0,
        };
        map.insert(spec.key, ParamTensor::filled(spec.shape, value));
    }
    map
}

/// One row of [`Generator::summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    pub params: usize,
    pub output: Shape,
}

/// Immutable after construction; `forward` takes `&self` and may run on many
/// threads at once.
#[derive(Debug, Clone)]
pub struct Generator {
    layers: Vec<LayerDescriptor>,
}

impl Generator {
    /// Loads a safetensors checkpoint and builds the network from it.
    pub fn load(path: &Path, key_prefix: &str) -> Result<Self> {
        let source = checkpoint::load_safetensors(path)?.normalize_keys(key_prefix);
        let generator = Self::from_source(&source)?;
        info!(
            path = %path.display(),
            layers = generator.layers.len(),
            params = generator.param_count(),
            "Generator ready"
        );
        Ok(generator)
    }

    pub fn from_source(source: &dyn ParameterSource) -> Result<Self> {
        Self::from_params(GeneratorParams::load(source)?)
    }

    pub fn from_params(params: GeneratorParams) -> Result<Self> {
        let norm = |spec: NormSpec, p: NormParams| -> Result<LayerDescriptor> {
            let layer = BatchNorm2d::new(p.scale, p.shift, p.running_mean, p.running_var)?;
            Ok(LayerDescriptor::new(spec.name, Layer::Norm(layer)))
        };
        let relu = |after: &str| LayerDescriptor::new(after, Layer::Activation(Activation::Relu));

        let mut layers = vec![
            CONV_1.build(params.conv_1)?,
            norm(NORM_1, params.norm_1)?,
            relu(NORM_1.name),
            CONV_2.build(params.conv_2)?,
            CONV_3.build(params.conv_3)?,
            norm(NORM_2, params.norm_2)?,
            relu(NORM_2.name),
            CONV_4.build(params.conv_4)?,
            CONV_5.build(params.conv_5)?,
            norm(NORM_3, params.norm_3)?,
            relu(NORM_3.name),
        ];

        let residual_config = Conv2dConfig {
            stride: 1,
            padding: 1,
        };
        for (index, block) in params.residual.into_iter().enumerate() {
            let p1 = block.norm_1;
            let p2 = block.norm_2;
            let block = ResidualBlock::new(
                Conv2d::new(block.conv_1.weight, Some(block.conv_1.bias), residual_config)?,
                BatchNorm2d::new(p1.scale, p1.shift, p1.running_mean, p1.running_var)?,
                Conv2d::new(block.conv_2.weight, Some(block.conv_2.bias), residual_config)?,
                BatchNorm2d::new(p2.scale, p2.shift, p2.running_mean, p2.running_var)?,
            )?;
            layers.push(LayerDescriptor::new(residual_name(index), Layer::Residual(block)));
        }

        layers.extend([
            CONV_6.build(params.conv_6)?,
            CONV_7.build(params.conv_7)?,
            norm(NORM_4, params.norm_4)?,
            relu(NORM_4.name),
            CONV_8.build(params.conv_8)?,
            CONV_9.build(params.conv_9)?,
            norm(NORM_5, params.norm_5)?,
            relu(NORM_5.name),
            CONV_10.build(params.conv_10)?,
            LayerDescriptor::new(CONV_10.name, Layer::Activation(Activation::Sigmoid)),
        ]);

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    pub fn residual_blocks(&self) -> impl Iterator<Item = &ResidualBlock> {
        self.layers.iter().filter_map(|d| match &d.layer {
            Layer::Residual(block) => Some(block),
            _ => None,
        })
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|d| d.layer.param_count()).sum()
    }

    /// Maps a (1, 3, 256, 256) tensor of [0, 1] values to a cartoonized
    /// tensor of the same shape with values in (0, 1).
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let expected = Shape::network_image();
        if input.shape() != expected {
            return Err(ToonError::shape_mismatch(
                "generator input",
                expected.to_vec(),
                input.shape().to_vec(),
            ));
        }
        let mut layers = self.layers.iter();
        let Some(first) = layers.next() else {
            return Ok(input.clone());
        };
        let mut x = first.layer.forward(input)?;
        for descriptor in layers {
            x = descriptor.layer.forward(&x)?;
        }
        Ok(x)
    }

    /// Output shape after every layer, for the given input shape.
    pub fn trace_shapes(&self, input: Shape) -> Result<Vec<(String, Shape)>> {
        let mut shape = input;
        self.layers
            .iter()
            .map(|descriptor| {
                shape = descriptor.layer.output_shape(shape)?;
                Ok((descriptor.name.clone(), shape))
            })
            .collect()
    }

    pub fn summary(&self) -> Result<Vec<LayerSummary>> {
        let shapes = self.trace_shapes(Shape::network_image())?;
        Ok(self
            .layers
            .iter()
            .zip(shapes)
            .map(|(descriptor, (name, output))| LayerSummary {
                name,
                kind: descriptor.layer.kind(),
                params: descriptor.layer.param_count(),
                output,
            })
            .collect())
    }
}
