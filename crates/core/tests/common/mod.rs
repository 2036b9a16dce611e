#![allow(dead_code)]

use std::path::Path;

use toonify_core::checkpoint::{ParamTensor, ParameterMap};
use toonify_core::generator::{parameter_specs, ParameterRole};
use toonify_core::tensor::{Shape, Tensor};

/// Deterministic linear congruential generator for reproducible weights.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Uniform in [-1, 1).
    pub fn next_signed(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }
}

/// Kernels and biases uniform in +-0.5/sqrt(fan_in); normalization neutral
/// except for a random shift.
pub fn random_checkpoint(seed: u64) -> ParameterMap {
    let mut rng = Lcg::new(seed);
    let mut map = ParameterMap::new();
    for spec in parameter_specs() {
        let len: usize = spec.shape.iter().product();
        let tensor = match spec.role {
            ParameterRole::Weight | ParameterRole::Bias => {
                let fan_in: usize = if spec.shape.len() == 4 {
                    spec.shape[1..].iter().product()
                } else {
                    spec.shape[0]
                };
                let bound = 0.5 / (fan_in as f32).sqrt();
                let data = (0..len).map(|_| rng.next_signed() * bound).collect();
                ParamTensor::new(&spec.key, spec.shape.clone(), data).unwrap()
            }
            ParameterRole::Shift => {
                let data = (0..len).map(|_| rng.next_signed() * 0.1).collect();
                ParamTensor::new(&spec.key, spec.shape.clone(), data).unwrap()
            }
            ParameterRole::Scale | ParameterRole::RunningVar => {
                ParamTensor::filled(spec.shape.clone(), 1.0)
            }
            ParameterRole::RunningMean => ParamTensor::filled(spec.shape.clone(), 0.0),
        };
        map.insert(spec.key, tensor);
    }
    map
}

/// A 256x256 [0, 1] gradient image tensor.
pub fn gradient_input() -> Tensor {
    let shape = Shape::network_image();
    let plane = shape.plane_len();
    let data = (0..shape.len())
        .map(|i| {
            let channel = i / plane;
            let pixel = i % plane;
            ((pixel % 256) as f32 + (pixel / 256) as f32 + channel as f32 * 37.0) % 256.0 / 255.0
        })
        .collect();
    Tensor::from_shape_vec(shape, data).unwrap()
}

/// Writes a small RGB test image with a diagonal gradient.
pub fn write_test_image(path: &Path, width: u32, height: u32) {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    });
    image.save(path).unwrap();
}
