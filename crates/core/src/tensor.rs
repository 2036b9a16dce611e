//! Dense NCHW `f32` tensors.

use std::fmt;

use ndarray::{Array4, ArrayView4, Zip};

use crate::error::{Result, ToonError};

/// Spatial size (both height and width) the generator consumes and produces.
pub const NETWORK_INPUT_SIZE: usize = 256;

/// Channel count of network input and output images (RGB).
pub const IMAGE_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Shape of one RGB image at network resolution.
    pub const fn network_image() -> Self {
        Self::new(1, IMAGE_CHANNELS, NETWORK_INPUT_SIZE, NETWORK_INPUT_SIZE)
    }

    pub fn len(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims().to_vec()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.channels, self.height, self.width
        )
    }
}

/// A (batch, channels, height, width) buffer in standard layout: width varies
/// fastest, then height, then channel, then batch.
///
/// Layers never mutate their input; every forward step allocates a new tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array4<f32>,
}

impl Tensor {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            data: Array4::zeros(shape.dims()),
        }
    }

    pub fn from_elem(shape: Shape, value: f32) -> Self {
        Self {
            data: Array4::from_elem(shape.dims(), value),
        }
    }

    pub fn from_shape_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(ToonError::shape_mismatch(
                "tensor storage",
                vec![shape.len()],
                vec![data.len()],
            ));
        }
        let data = Array4::from_shape_vec(shape.dims(), data).map_err(|error| {
            ToonError::shape_mismatch(format!("tensor storage ({error})"), shape.to_vec(), vec![])
        })?;
        Ok(Self { data })
    }

    pub(crate) fn from_array(data: Array4<f32>) -> Self {
        if data.is_standard_layout() {
            Self { data }
        } else {
            Self {
                data: data.as_standard_layout().into_owned(),
            }
        }
    }

    pub fn shape(&self) -> Shape {
        let (batch, channels, height, width) = self.data.dim();
        Shape::new(batch, channels, height, width)
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn as_slice(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("tensor storage is always in standard layout")
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data.into_raw_vec_and_offset().0
    }

    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.as_slice().iter()
    }

    /// Elementwise `max(x, 0)`. NaN passes through unchanged.
    pub fn relu(&self) -> Tensor {
        Self::from_array(self.data.mapv(|v| if v < 0.0 { 0.0 } else { v }))
    }

    /// Elementwise logistic function `1 / (1 + e^-x)`.
    pub fn sigmoid(&self) -> Tensor {
        Self::from_array(self.data.mapv(|v| 1.0 / (1.0 + (-v).exp())))
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape() != other.shape() {
            return Err(ToonError::shape_mismatch(
                "elementwise add",
                self.shape().to_vec(),
                other.shape().to_vec(),
            ));
        }
        let mut out = self.data.clone();
        Zip::from(&mut out)
            .and(&other.data)
            .for_each(|a, &b| *a += b);
        Ok(Self::from_array(out))
    }
}
