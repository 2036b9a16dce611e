//! Layer primitives and the tagged descriptor the generator is built from.

pub mod conv;
pub mod norm;
pub mod residual;

use std::fmt;

use crate::error::{Result, ToonError};
use crate::tensor::{Shape, Tensor};

pub use conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
pub use norm::{BatchNorm2d, BATCH_NORM_EPSILON};
pub use residual::ResidualBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn apply(self, input: &Tensor) -> Tensor {
        match self {
            Self::Relu => input.relu(),
            Self::Sigmoid => input.sigmoid(),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relu => f.write_str("relu"),
            Self::Sigmoid => f.write_str("sigmoid"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    ConvTranspose(ConvTranspose2d),
    Norm(BatchNorm2d),
    Residual(ResidualBlock),
    Activation(Activation),
}

impl Layer {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::ConvTranspose(conv) => conv.forward(input),
            Self::Norm(norm) => norm.forward(input),
            Self::Residual(block) => block.forward(input),
            Self::Activation(activation) => Ok(activation.apply(input)),
        }
    }

    /// Shape this layer would produce for `input`, without computing it.
    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        match self {
            Self::Conv(conv) => conv.output_shape(input),
            Self::ConvTranspose(conv) => conv.output_shape(input),
            Self::Norm(norm) if norm.channels() != input.channels => Err(ToonError::shape_mismatch(
                "batch_norm input channels",
                vec![norm.channels()],
                vec![input.channels],
            )),
            Self::Residual(block) if block.channels() != input.channels => {
                Err(ToonError::shape_mismatch(
                    "residual input channels",
                    vec![block.channels()],
                    vec![input.channels],
                ))
            }
            Self::Norm(_) | Self::Residual(_) | Self::Activation(_) => Ok(input),
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            Self::Conv(conv) => conv.param_count(),
            Self::ConvTranspose(conv) => conv.param_count(),
            Self::Norm(norm) => norm.param_count(),
            Self::Residual(block) => block.param_count(),
            Self::Activation(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv(_) => "conv2d",
            Self::ConvTranspose(_) => "conv_transpose2d",
            Self::Norm(_) => "batch_norm2d",
            Self::Residual(_) => "residual",
            Self::Activation(Activation::Relu) => "relu",
            Self::Activation(Activation::Sigmoid) => "sigmoid",
        }
    }
}

/// A layer plus the checkpoint key prefix its parameters were read from.
/// Activations carry the name of the layer they follow.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub name: String,
    pub layer: Layer,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, layer: Layer) -> Self {
        Self {
            name: name.into(),
            layer,
        }
    }
}
