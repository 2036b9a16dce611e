use ndarray::{Array1, Axis};

use crate::error::{Result, ToonError};
use crate::tensor::Tensor;

pub const BATCH_NORM_EPSILON: f32 = 1e-5;

/// Inference-mode batch normalization with frozen running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(
        scale: Array1<f32>,
        shift: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
    ) -> Result<Self> {
        let channels = scale.len();
        for (name, len) in [
            ("batch_norm shift", shift.len()),
            ("batch_norm running_mean", running_mean.len()),
            ("batch_norm running_var", running_var.len()),
        ] {
            if len != channels {
                return Err(ToonError::shape_mismatch(name, vec![channels], vec![len]));
            }
        }
        Ok(Self {
            scale,
            shift,
            running_mean,
            running_var,
        })
    }

    pub fn channels(&self) -> usize {
        self.scale.len()
    }

    pub fn param_count(&self) -> usize {
        self.channels() * 4
    }

    /// `(x - mean) / sqrt(var + eps) * scale + shift`, per channel.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let shape = input.shape();
        if shape.channels != self.channels() {
            return Err(ToonError::shape_mismatch(
                "batch_norm input channels",
                vec![self.channels()],
                vec![shape.channels],
            ));
        }

        let mut out = input.view().to_owned();
        for mut batch in out.axis_iter_mut(Axis(0)) {
            for (c, mut plane) in batch.axis_iter_mut(Axis(0)).enumerate() {
                let mean = self.running_mean[c];
                let denom = (self.running_var[c] + BATCH_NORM_EPSILON).sqrt();
                let scale = self.scale[c];
                let shift = self.shift[c];
                plane.mapv_inplace(|x| (x - mean) / denom * scale + shift);
            }
        }
        Ok(Tensor::from_array(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    fn identity(channels: usize) -> BatchNorm2d {
        BatchNorm2d::new(
            Array1::ones(channels),
            Array1::zeros(channels),
            Array1::zeros(channels),
            Array1::ones(channels),
        )
        .unwrap()
    }

    #[test]
    fn applies_per_channel_statistics() {
        let norm = BatchNorm2d::new(
            Array1::from(vec![2.0, 1.0]),
            Array1::from(vec![0.5, -1.0]),
            Array1::from(vec![1.0, 0.0]),
            Array1::from(vec![4.0 - BATCH_NORM_EPSILON, 1.0 - BATCH_NORM_EPSILON]),
        )
        .unwrap();
        let input = Tensor::from_shape_vec(Shape::new(1, 2, 1, 2), vec![3.0, 5.0, 2.0, -2.0]).unwrap();
        let out = norm.forward(&input).unwrap();
        let expected = [
            (3.0 - 1.0) / 2.0 * 2.0 + 0.5,
            (5.0 - 1.0) / 2.0 * 2.0 + 0.5,
            2.0 - 1.0,
            -2.0 - 1.0,
        ];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn zero_input_with_neutral_statistics_stays_zero() {
        let out = identity(64)
            .forward(&Tensor::zeros(Shape::new(1, 64, 8, 8)))
            .unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rejects_vectors_of_differing_length() {
        let result = BatchNorm2d::new(
            Array1::ones(4),
            Array1::zeros(4),
            Array1::zeros(3),
            Array1::ones(4),
        );
        assert!(matches!(result, Err(ToonError::ShapeMismatch { .. })));
    }

    #[test]
    fn rejects_channel_count_mismatch() {
        let err = identity(3)
            .forward(&Tensor::zeros(Shape::new(1, 4, 2, 2)))
            .unwrap_err();
        assert!(matches!(err, ToonError::ShapeMismatch { .. }));
    }
}
