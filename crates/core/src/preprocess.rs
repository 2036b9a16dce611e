//! Conversion between display frames and network tensors.

use crate::error::{Result, ToonError};
use crate::frame::{ChannelOrder, Frame, ResizeAlgorithm};
use crate::tensor::{Shape, Tensor, IMAGE_CHANNELS, NETWORK_INPUT_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preprocessor {
    pub resize: ResizeAlgorithm,
}

impl Preprocessor {
    pub fn new(resize: ResizeAlgorithm) -> Self {
        Self { resize }
    }

    /// Resizes to 256x256, reorders to RGB and scales to [0, 1] in NCHW layout.
    pub fn to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        let size = NETWORK_INPUT_SIZE as u32;
        let rgb = frame
            .resized(size, size, self.resize)?
            .to_order(ChannelOrder::Rgb);

        let hw = NETWORK_INPUT_SIZE * NETWORK_INPUT_SIZE;
        let mut nchw = vec![0.0f32; IMAGE_CHANNELS * hw];
        for (i, pixel) in rgb.data.chunks_exact(IMAGE_CHANNELS).enumerate() {
            nchw[i] = pixel[0] as f32 / 255.0;
            nchw[hw + i] = pixel[1] as f32 / 255.0;
            nchw[2 * hw + i] = pixel[2] as f32 / 255.0;
        }
        Tensor::from_shape_vec(Shape::network_image(), nchw)
    }

    /// Scales by 255, clamps to [0, 255] and truncates to u8, then packs the
    /// channels in `order`.
    pub fn to_frame(&self, tensor: &Tensor, order: ChannelOrder) -> Result<Frame> {
        let shape = tensor.shape();
        if shape != Shape::network_image() {
            return Err(ToonError::shape_mismatch(
                "generator output",
                Shape::network_image().to_vec(),
                shape.to_vec(),
            ));
        }
        let hw = shape.plane_len();
        let values = tensor.as_slice();
        let quantize = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;

        let mut data = vec![0u8; hw * IMAGE_CHANNELS];
        for (i, pixel) in data.chunks_exact_mut(IMAGE_CHANNELS).enumerate() {
            pixel[0] = quantize(values[i]);
            pixel[1] = quantize(values[hw + i]);
            pixel[2] = quantize(values[2 * hw + i]);
        }
        let size = NETWORK_INPUT_SIZE as u32;
        Ok(Frame::new(data, size, size, ChannelOrder::Rgb)?.to_order(order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_tensor_scales_and_splits_planes() {
        let frame = Frame::solid(256, 256, ChannelOrder::Rgb, [255, 0, 51]);
        let tensor = Preprocessor::default().to_tensor(&frame).unwrap();
        assert_eq!(tensor.shape(), Shape::network_image());
        let view = tensor.view();
        assert_eq!(view[[0, 0, 10, 10]], 1.0);
        assert_eq!(view[[0, 1, 10, 10]], 0.0);
        assert!((view[[0, 2, 10, 10]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn bgr_frames_are_reordered_for_the_network() {
        let frame = Frame::solid(32, 16, ChannelOrder::Bgr, [10, 20, 30]);
        let tensor = Preprocessor::new(ResizeAlgorithm::Nearest)
            .to_tensor(&frame)
            .unwrap();
        let view = tensor.view();
        assert!((view[[0, 0, 0, 0]] - 30.0 / 255.0).abs() < 1e-6);
        assert!((view[[0, 2, 255, 255]] - 10.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn to_frame_truncates_and_clamps() {
        let mut values = vec![0.0f32; 3 * 256 * 256];
        values[0] = 0.5; // 127.5 truncates to 127
        values[1] = 1.7; // above range
        values[2] = -0.2; // below range
        values[256 * 256] = f32::NAN;
        let tensor = Tensor::from_shape_vec(Shape::network_image(), values).unwrap();
        let frame = Preprocessor::default()
            .to_frame(&tensor, ChannelOrder::Rgb)
            .unwrap();
        assert_eq!((frame.width, frame.height), (256, 256));
        assert_eq!(frame.data[0], 127);
        assert_eq!(frame.data[3], 255);
        assert_eq!(frame.data[6], 0);
        // NaN saturates to zero.
        assert_eq!(frame.data[1], 0);
    }

    #[test]
    fn to_frame_honours_requested_order() {
        let mut values = vec![0.0f32; 3 * 256 * 256];
        values[0] = 1.0;
        let tensor = Tensor::from_shape_vec(Shape::network_image(), values).unwrap();
        let frame = Preprocessor::default()
            .to_frame(&tensor, ChannelOrder::Bgr)
            .unwrap();
        assert_eq!(frame.order, ChannelOrder::Bgr);
        assert_eq!(&frame.data[..3], &[0, 0, 255]);
    }

    #[test]
    fn to_frame_rejects_non_network_shape() {
        let tensor = Tensor::zeros(Shape::new(1, 3, 64, 64));
        assert!(matches!(
            Preprocessor::default().to_frame(&tensor, ChannelOrder::Rgb),
            Err(ToonError::ShapeMismatch { .. })
        ));
    }
}
