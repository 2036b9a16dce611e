//! Standard and transposed 2-D convolutions.
//!
//! Both lower to matrix products over bands of rows: a standard convolution
//! unfolds input windows into columns (im2col) and multiplies by the
//! flattened kernel; a transposed convolution multiplies first and then
//! scatter-adds the columns into the output (col2im). Bands keep the unfolded
//! matrix near `TILE_ELEMENTS` values regardless of image size. The gather
//! and scatter loops run in parallel over disjoint output rows or planes, so
//! the accumulation order is fixed and results do not depend on thread count.

use ndarray::{s, Array1, Array2, Array4, ArrayView2};
use rayon::prelude::*;

use crate::error::{Result, ToonError};
use crate::tensor::{Shape, Tensor};

/// Upper bound on the values held by one unfolded band (16 MiB of f32).
const TILE_ELEMENTS: usize = 1 << 22;

/// `floor((in + 2*padding - kernel) / stride) + 1`, or `None` when the padded
/// input is smaller than the kernel.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// `(in - 1)*stride - 2*padding + kernel + output_padding`, or `None` when the
/// padding would crop the whole output.
pub fn conv_transpose_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    output_padding: usize,
) -> Option<usize> {
    if input == 0 || stride == 0 {
        return None;
    }
    let full = (input - 1) * stride + kernel + output_padding;
    full.checked_sub(2 * padding).filter(|&size| size > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub stride: usize,
    pub padding: usize,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTranspose2dConfig {
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
}

impl Default for ConvTranspose2dConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            output_padding: 0,
        }
    }
}

/// Convolution with kernel layout (out_channels, in_channels, kH, kW).
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Kernel flattened to (out_channels, in_channels * kH * kW).
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(weight: Array4<f32>, bias: Option<Array1<f32>>, config: Conv2dConfig) -> Result<Self> {
        let (out_channels, in_channels, k_h, k_w) = weight.dim();
        validate_common("conv2d", out_channels, k_h, k_w, config.stride, bias.as_ref())?;

        let weight = flatten_kernel(weight, out_channels, in_channels * k_h * k_w)?;
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel: (k_h, k_w),
            config,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn config(&self) -> Conv2dConfig {
        self.config
    }

    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels,
            self.kernel.0,
            self.kernel.1,
        ]
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, Array1::len)
    }

    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        if input.channels != self.in_channels {
            return Err(ToonError::shape_mismatch(
                "conv2d input channels",
                vec![self.in_channels],
                vec![input.channels],
            ));
        }
        let Conv2dConfig { stride, padding } = self.config;
        let out_h = conv_output_size(input.height, self.kernel.0, stride, padding);
        let out_w = conv_output_size(input.width, self.kernel.1, stride, padding);
        match (out_h, out_w) {
            (Some(h), Some(w)) => Ok(Shape::new(input.batch, self.out_channels, h, w)),
            _ => Err(ToonError::shape_mismatch(
                "conv2d input smaller than kernel",
                vec![self.kernel.0, self.kernel.1],
                vec![input.height, input.width],
            )),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_tiled(input, TILE_ELEMENTS)
    }

    /// Unfolds and multiplies one band of output rows at a time, sized so the
    /// unfolded band holds at most `tile_elements` values.
    fn forward_tiled(&self, input: &Tensor, tile_elements: usize) -> Result<Tensor> {
        let in_shape = input.shape();
        let out_shape = self.output_shape(in_shape)?;
        let (k_h, k_w) = self.kernel;
        let Conv2dConfig { stride, padding } = self.config;

        let rows = self.in_channels * k_h * k_w;
        let out_w = out_shape.width;
        let out_plane = out_shape.plane_len();
        let in_len = in_shape.channels * in_shape.plane_len();
        let out_len = out_shape.channels * out_plane;
        let band_rows = band_height(tile_elements, rows * out_w, out_shape.height);

        let src = input.as_slice();
        let mut output = vec![0.0f32; out_shape.len()];
        let mut unfolded = vec![0.0f32; rows * band_rows * out_w];

        for (b, dst) in output.chunks_exact_mut(out_len).enumerate() {
            let image = &src[b * in_len..(b + 1) * in_len];

            for oy0 in (0..out_shape.height).step_by(band_rows) {
                let oy1 = (oy0 + band_rows).min(out_shape.height);
                let cols = (oy1 - oy0) * out_w;
                let band = &mut unfolded[..rows * cols];
                band.fill(0.0);
                band.par_chunks_mut(cols).enumerate().for_each(|(row, column)| {
                    let ic = row / (k_h * k_w);
                    let ki = (row / k_w) % k_h;
                    let kj = row % k_w;
                    let plane = &image[ic * in_shape.plane_len()..(ic + 1) * in_shape.plane_len()];
                    for oy in oy0..oy1 {
                        let Some(iy) = (oy * stride + ki).checked_sub(padding) else {
                            continue;
                        };
                        if iy >= in_shape.height {
                            continue;
                        }
                        let src_row = &plane[iy * in_shape.width..(iy + 1) * in_shape.width];
                        let dst_row = &mut column[(oy - oy0) * out_w..(oy - oy0 + 1) * out_w];
                        for (ox, value) in dst_row.iter_mut().enumerate() {
                            let Some(ix) = (ox * stride + kj).checked_sub(padding) else {
                                continue;
                            };
                            if ix < in_shape.width {
                                *value = src_row[ix];
                            }
                        }
                    }
                });

                let band = ArrayView2::from_shape((rows, cols), &*band).map_err(|error| {
                    ToonError::shape_mismatch(format!("conv2d im2col ({error})"), vec![rows, cols], vec![])
                })?;
                let product = self.weight.dot(&band);
                write_band_with_bias(&product, self.bias.as_ref(), dst, out_plane, oy0 * out_w);
            }
        }

        Tensor::from_shape_vec(out_shape, output)
    }
}

/// Transposed convolution with kernel layout (in_channels, out_channels, kH, kW),
/// the layout PyTorch checkpoints store for `ConvTranspose2d`.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// Kernel flattened to (in_channels, out_channels * kH * kW).
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    config: ConvTranspose2dConfig,
}

impl ConvTranspose2d {
    pub fn new(
        weight: Array4<f32>,
        bias: Option<Array1<f32>>,
        config: ConvTranspose2dConfig,
    ) -> Result<Self> {
        let (in_channels, out_channels, k_h, k_w) = weight.dim();
        validate_common(
            "conv_transpose2d",
            out_channels,
            k_h,
            k_w,
            config.stride,
            bias.as_ref(),
        )?;
        if config.output_padding >= config.stride {
            return Err(ToonError::shape_mismatch(
                "conv_transpose2d output padding must be smaller than stride",
                vec![config.stride.saturating_sub(1)],
                vec![config.output_padding],
            ));
        }

        let weight = flatten_kernel(weight, in_channels, out_channels * k_h * k_w)?;
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel: (k_h, k_w),
            config,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn config(&self) -> ConvTranspose2dConfig {
        self.config
    }

    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.in_channels,
            self.out_channels,
            self.kernel.0,
            self.kernel.1,
        ]
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, Array1::len)
    }

    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        if input.channels != self.in_channels {
            return Err(ToonError::shape_mismatch(
                "conv_transpose2d input channels",
                vec![self.in_channels],
                vec![input.channels],
            ));
        }
        let ConvTranspose2dConfig {
            stride,
            padding,
            output_padding,
        } = self.config;
        let out_h =
            conv_transpose_output_size(input.height, self.kernel.0, stride, padding, output_padding);
        let out_w =
            conv_transpose_output_size(input.width, self.kernel.1, stride, padding, output_padding);
        match (out_h, out_w) {
            (Some(h), Some(w)) => Ok(Shape::new(input.batch, self.out_channels, h, w)),
            _ => Err(ToonError::shape_mismatch(
                "conv_transpose2d output would be empty",
                vec![self.kernel.0, self.kernel.1],
                vec![input.height, input.width],
            )),
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_tiled(input, TILE_ELEMENTS)
    }

    /// Multiplies one band of input rows at a time and scatter-adds its
    /// columns, keeping each band's column matrix under `tile_elements`.
    fn forward_tiled(&self, input: &Tensor, tile_elements: usize) -> Result<Tensor> {
        let in_shape = input.shape();
        let out_shape = self.output_shape(in_shape)?;
        let (k_h, k_w) = self.kernel;
        let ConvTranspose2dConfig { stride, padding, .. } = self.config;

        let in_w = in_shape.width;
        let in_plane = in_shape.plane_len();
        let out_plane = out_shape.plane_len();
        let in_len = in_shape.channels * in_plane;
        let out_len = out_shape.channels * out_plane;
        let taps = k_h * k_w;
        let band_rows = band_height(tile_elements, self.weight.ncols() * in_w, in_shape.height);

        let src = input.as_slice();
        let mut output = vec![0.0f32; out_shape.len()];

        for (b, dst) in output.chunks_exact_mut(out_len).enumerate() {
            let image = ArrayView2::from_shape((self.in_channels, in_plane), &src[b * in_len..(b + 1) * in_len])
                .map_err(|error| {
                    ToonError::shape_mismatch(
                        format!("conv_transpose2d input ({error})"),
                        vec![self.in_channels, in_plane],
                        vec![],
                    )
                })?;

            for iy0 in (0..in_shape.height).step_by(band_rows) {
                let iy1 = (iy0 + band_rows).min(in_shape.height);
                let band = image.slice(s![.., iy0 * in_w..iy1 * in_w]);
                // (out_channels * kH * kW, band rows * W)
                let columns = self.weight.t().dot(&band);

                dst.par_chunks_mut(out_plane).enumerate().for_each(|(oc, plane)| {
                    for ki in 0..k_h {
                        for kj in 0..k_w {
                            let column = columns.row(oc * taps + ki * k_w + kj);
                            for iy in iy0..iy1 {
                                let Some(oy) = (iy * stride + ki).checked_sub(padding) else {
                                    continue;
                                };
                                if oy >= out_shape.height {
                                    continue;
                                }
                                for ix in 0..in_w {
                                    let Some(ox) = (ix * stride + kj).checked_sub(padding) else {
                                        continue;
                                    };
                                    if ox < out_shape.width {
                                        plane[oy * out_shape.width + ox] += column[(iy - iy0) * in_w + ix];
                                    }
                                }
                            }
                        }
                    }
                });
            }

            if let Some(bias) = self.bias.as_ref() {
                dst.par_chunks_mut(out_plane).enumerate().for_each(|(oc, plane)| {
                    let bias = bias[oc];
                    plane.iter_mut().for_each(|v| *v += bias);
                });
            }
        }

        Tensor::from_shape_vec(out_shape, output)
    }
}

/// Number of spatial rows per band so that `band_rows * elements_per_row`
/// stays within `tile_elements`, at least one row.
fn band_height(tile_elements: usize, elements_per_row: usize, total_rows: usize) -> usize {
    (tile_elements / elements_per_row.max(1)).clamp(1, total_rows.max(1))
}

fn validate_common(
    context: &str,
    out_channels: usize,
    k_h: usize,
    k_w: usize,
    stride: usize,
    bias: Option<&Array1<f32>>,
) -> Result<()> {
    if k_h == 0 || k_w == 0 {
        return Err(ToonError::shape_mismatch(
            format!("{context} kernel must be non-empty"),
            vec![1, 1],
            vec![k_h, k_w],
        ));
    }
    if stride == 0 {
        return Err(ToonError::shape_mismatch(
            format!("{context} stride must be positive"),
            vec![1],
            vec![0],
        ));
    }
    if let Some(bias) = bias {
        if bias.len() != out_channels {
            return Err(ToonError::shape_mismatch(
                format!("{context} bias"),
                vec![out_channels],
                vec![bias.len()],
            ));
        }
    }
    Ok(())
}

fn flatten_kernel(weight: Array4<f32>, rows: usize, cols: usize) -> Result<Array2<f32>> {
    let shape = weight.shape().to_vec();
    let standard = if weight.is_standard_layout() {
        weight
    } else {
        weight.as_standard_layout().into_owned()
    };
    standard
        .into_shape_with_order((rows, cols))
        .map_err(|error| ToonError::shape_mismatch(format!("kernel flatten ({error})"), vec![rows, cols], shape))
}

/// Copies a (out_channels, band) product into each output plane starting at
/// `offset`, adding the channel bias.
fn write_band_with_bias(
    product: &Array2<f32>,
    bias: Option<&Array1<f32>>,
    dst: &mut [f32],
    plane_len: usize,
    offset: usize,
) {
    let band = product.ncols();
    for (oc, (row, plane)) in product
        .rows()
        .into_iter()
        .zip(dst.chunks_exact_mut(plane_len))
        .enumerate()
    {
        let bias = bias.map_or(0.0, |b| b[oc]);
        for (o, &v) in plane[offset..offset + band].iter_mut().zip(row.iter()) {
            *o = v + bias;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: Shape, values: Vec<f32>) -> Tensor {
        Tensor::from_shape_vec(shape, values).expect("valid test tensor")
    }

    /// Direct-loop reference, the textbook definition.
    fn reference_conv(
        input: &Tensor,
        weight: &Array4<f32>,
        bias: &[f32],
        stride: usize,
        padding: usize,
    ) -> Vec<f32> {
        let s = input.shape();
        let (oc_n, ic_n, k_h, k_w) = weight.dim();
        let oh = conv_output_size(s.height, k_h, stride, padding).unwrap();
        let ow = conv_output_size(s.width, k_w, stride, padding).unwrap();
        let x = input.view();
        let mut out = Vec::new();
        for oc in 0..oc_n {
            for y in 0..oh {
                for xx in 0..ow {
                    let mut sum = 0.0f32;
                    for ic in 0..ic_n {
                        for ki in 0..k_h {
                            for kj in 0..k_w {
                                let iy = (y * stride + ki) as isize - padding as isize;
                                let ix = (xx * stride + kj) as isize - padding as isize;
                                if iy >= 0 && ix >= 0 && (iy as usize) < s.height && (ix as usize) < s.width {
                                    sum += x[[0, ic, iy as usize, ix as usize]] * weight[[oc, ic, ki, kj]];
                                }
                            }
                        }
                    }
                    out.push(sum + bias[oc]);
                }
            }
        }
        out
    }

    fn pattern(len: usize, seed: f32) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.37 + seed).sin() * 0.5).collect()
    }

    #[test]
    fn output_size_formulas() {
        assert_eq!(conv_output_size(256, 7, 1, 3), Some(256));
        assert_eq!(conv_output_size(256, 3, 2, 1), Some(128));
        assert_eq!(conv_output_size(5, 3, 2, 1), Some(3));
        assert_eq!(conv_output_size(1, 7, 1, 0), None);

        assert_eq!(conv_transpose_output_size(64, 3, 2, 1, 1), Some(128));
        assert_eq!(conv_transpose_output_size(128, 3, 1, 1, 0), Some(128));
        assert_eq!(conv_transpose_output_size(3, 3, 2, 1, 0), Some(5));
    }

    #[test]
    fn conv_matches_direct_reference_with_stride_and_padding() {
        let input = tensor(Shape::new(1, 2, 5, 6), pattern(60, 0.1));
        let weight = Array4::from_shape_vec((3, 2, 3, 3), pattern(54, 1.3)).unwrap();
        let bias = vec![0.25, -0.5, 1.0];

        let conv = Conv2d::new(
            weight.clone(),
            Some(Array1::from(bias.clone())),
            Conv2dConfig {
                stride: 2,
                padding: 1,
            },
        )
        .unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape(), Shape::new(1, 3, 3, 3));

        let expected = reference_conv(&input, &weight, &bias, 2, 1);
        for (got, want) in out.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn banded_conv_matches_reference_across_band_sizes() {
        let input = tensor(Shape::new(1, 2, 9, 7), pattern(126, 0.4));
        let weight = Array4::from_shape_vec((3, 2, 3, 3), pattern(54, 0.9)).unwrap();
        let bias = vec![0.1, 0.0, -0.3];
        let conv = Conv2d::new(
            weight.clone(),
            Some(Array1::from(bias.clone())),
            Conv2dConfig {
                stride: 1,
                padding: 1,
            },
        )
        .unwrap();
        let expected = reference_conv(&input, &weight, &bias, 1, 1);

        // 18 unfolded rows * 7 columns per output row: one, two and all rows per band.
        for tile in [1, 2 * 18 * 7, usize::MAX] {
            let out = conv.forward_tiled(&input, tile).unwrap();
            assert_eq!(out.shape(), Shape::new(1, 3, 9, 7));
            for (got, want) in out.iter().zip(expected.iter()) {
                assert!((got - want).abs() < 1e-5, "tile {tile}: got {got}, want {want}");
            }
        }
    }

    #[test]
    fn banded_conv_transpose_matches_single_band() {
        let input = tensor(Shape::new(1, 3, 5, 4), pattern(60, 1.7));
        let weight = Array4::from_shape_vec((3, 2, 3, 3), pattern(54, 0.2)).unwrap();
        let deconv = ConvTranspose2d::new(
            weight,
            Some(Array1::from(vec![0.5, -0.25])),
            ConvTranspose2dConfig {
                stride: 2,
                padding: 1,
                output_padding: 1,
            },
        )
        .unwrap();

        let whole = deconv.forward_tiled(&input, usize::MAX).unwrap();
        assert_eq!(whole.shape(), Shape::new(1, 2, 10, 8));
        for tile in [1, 18 * 4 * 2] {
            let banded = deconv.forward_tiled(&input, tile).unwrap();
            for (got, want) in banded.iter().zip(whole.iter()) {
                assert!((got - want).abs() < 1e-5, "tile {tile}: got {got}, want {want}");
            }
        }
    }

    #[test]
    fn band_height_stays_within_bounds() {
        assert_eq!(band_height(1 << 22, 3136 * 256, 256), 5);
        assert_eq!(band_height(1, 1000, 256), 1);
        assert_eq!(band_height(usize::MAX, 10, 8), 8);
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let conv = Conv2d::new(Array4::zeros((4, 3, 3, 3)), None, Conv2dConfig::default()).unwrap();
        let input = Tensor::zeros(Shape::new(1, 2, 8, 8));
        assert!(matches!(
            conv.forward(&input),
            Err(ToonError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn conv_rejects_bias_of_wrong_length() {
        let result = Conv2d::new(
            Array4::zeros((4, 3, 3, 3)),
            Some(Array1::zeros(3)),
            Conv2dConfig::default(),
        );
        assert!(matches!(result, Err(ToonError::ShapeMismatch { .. })));
    }

    #[test]
    fn zero_kernel_and_bias_give_zero_output() {
        let conv = Conv2d::new(
            Array4::zeros((64, 3, 7, 7)),
            Some(Array1::zeros(64)),
            Conv2dConfig {
                stride: 1,
                padding: 3,
            },
        )
        .unwrap();
        let out = conv.forward(&Tensor::zeros(Shape::network_image())).unwrap();
        assert_eq!(out.shape(), Shape::new(1, 64, 256, 256));
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn conv_transpose_single_pixel_spreads_kernel() {
        // One input pixel at stride 2 places a copy of the kernel into the output.
        let input = tensor(Shape::new(1, 1, 1, 1), vec![2.0]);
        let weight = Array4::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f32).collect()).unwrap();
        let deconv = ConvTranspose2d::new(weight, None, ConvTranspose2dConfig::default()).unwrap();
        let out = deconv.forward(&input).unwrap();
        assert_eq!(out.shape(), Shape::new(1, 1, 3, 3));
        let expected: Vec<f32> = (1..=9).map(|v| 2.0 * v as f32).collect();
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    fn conv_transpose_is_adjoint_of_conv() {
        // <conv(x), y> == <conv_transpose(y), x> for a shared kernel, no bias.
        let x = tensor(Shape::new(1, 2, 6, 6), pattern(72, 0.7));
        let kernel = Array4::from_shape_vec((3, 2, 3, 3), pattern(54, 2.1)).unwrap();

        let conv = Conv2d::new(
            kernel.clone(),
            None,
            Conv2dConfig {
                stride: 2,
                padding: 1,
            },
        )
        .unwrap();
        let cx = conv.forward(&x).unwrap();
        let y = tensor(cx.shape(), pattern(cx.shape().len(), 4.2));

        // Conv kernel (out=3, in=2) is the transposed kernel with (in=3, out=2).
        let deconv = ConvTranspose2d::new(
            kernel,
            None,
            ConvTranspose2dConfig {
                stride: 2,
                padding: 1,
                output_padding: 1,
            },
        )
        .unwrap();
        let ty = deconv.forward(&y).unwrap();
        assert_eq!(ty.shape(), x.shape());

        let lhs: f32 = cx.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
        let rhs: f32 = ty.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-4, "lhs {lhs}, rhs {rhs}");
    }

    #[test]
    fn conv_transpose_bias_fills_output_padding_region() {
        let deconv = ConvTranspose2d::new(
            Array4::zeros((2, 1, 3, 3)),
            Some(Array1::from(vec![0.75])),
            ConvTranspose2dConfig {
                stride: 2,
                padding: 1,
                output_padding: 1,
            },
        )
        .unwrap();
        let out = deconv.forward(&Tensor::zeros(Shape::new(1, 2, 4, 4))).unwrap();
        assert_eq!(out.shape(), Shape::new(1, 1, 8, 8));
        assert!(out.iter().all(|&v| v == 0.75));
    }

    #[test]
    fn conv_transpose_rejects_output_padding_not_below_stride() {
        let result = ConvTranspose2d::new(
            Array4::zeros((2, 2, 3, 3)),
            None,
            ConvTranspose2dConfig {
                stride: 1,
                padding: 1,
                output_padding: 1,
            },
        );
        assert!(matches!(result, Err(ToonError::ShapeMismatch { .. })));
    }

    #[test]
    fn nan_input_propagates() {
        let conv = Conv2d::new(
            Array4::from_elem((1, 1, 1, 1), 1.0),
            None,
            Conv2dConfig::default(),
        )
        .unwrap();
        let input = tensor(Shape::new(1, 1, 1, 2), vec![f32::NAN, 1.0]);
        let out = conv.forward(&input).unwrap();
        assert!(out.as_slice()[0].is_nan());
        assert_eq!(out.as_slice()[1], 1.0);
    }
}
