use crate::error::{Result, ToonError};
use crate::tensor::Tensor;

use super::conv::Conv2d;
use super::norm::BatchNorm2d;

/// `norm_2(conv_2(relu(norm_1(conv_1(x))))) + x`.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub conv_1: Conv2d,
    pub norm_1: BatchNorm2d,
    pub conv_2: Conv2d,
    pub norm_2: BatchNorm2d,
}

impl ResidualBlock {
    pub fn new(conv_1: Conv2d, norm_1: BatchNorm2d, conv_2: Conv2d, norm_2: BatchNorm2d) -> Result<Self> {
        let channels = conv_1.in_channels();
        let widths = [
            ("residual conv_1 output", conv_1.out_channels()),
            ("residual norm_1", norm_1.channels()),
            ("residual conv_2 input", conv_2.in_channels()),
            ("residual conv_2 output", conv_2.out_channels()),
            ("residual norm_2", norm_2.channels()),
        ];
        for (context, width) in widths {
            if width != channels {
                return Err(ToonError::shape_mismatch(context, vec![channels], vec![width]));
            }
        }
        Ok(Self {
            conv_1,
            norm_1,
            conv_2,
            norm_2,
        })
    }

    pub fn channels(&self) -> usize {
        self.conv_1.in_channels()
    }

    pub fn param_count(&self) -> usize {
        self.conv_1.param_count()
            + self.norm_1.param_count()
            + self.conv_2.param_count()
            + self.norm_2.param_count()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.norm_1.forward(&self.conv_1.forward(input)?)?.relu();
        let branch = self.norm_2.forward(&self.conv_2.forward(&hidden)?)?;
        // Spatial size must survive both convs for the skip-add.
        branch.add(input)
    }
}
