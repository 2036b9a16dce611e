//! Interleaved 8-bit three-channel frames and pure-Rust resizing.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, order: ChannelOrder) -> Result<Self> {
        let expected = frame_len(width, height);
        if data.len() != expected {
            return Err(ToonError::shape_mismatch(
                format!("frame data length for {width}x{height}x3"),
                vec![expected],
                vec![data.len()],
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            order,
        })
    }

    pub fn solid(width: u32, height: u32, order: ChannelOrder, pixel: [u8; 3]) -> Self {
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(frame_len(width, height))
            .collect();
        Self {
            data,
            width,
            height,
            order,
        }
    }

    pub fn from_rgb_image(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            order: ChannelOrder::Rgb,
        }
    }

    pub fn into_rgb_image(self) -> Result<image::RgbImage> {
        let frame = self.to_order(ChannelOrder::Rgb);
        let (width, height) = (frame.width, frame.height);
        let len = frame.data.len();
        image::RgbImage::from_raw(width, height, frame.data).ok_or_else(|| {
            ToonError::shape_mismatch(
                format!("frame buffer for {width}x{height} image"),
                vec![frame_len(width, height)],
                vec![len],
            )
        })
    }

    /// Returns the frame with its channels in `order`, swapping R and B if needed.
    pub fn to_order(mut self, order: ChannelOrder) -> Self {
        if self.order != order {
            for pixel in self.data.chunks_exact_mut(3) {
                pixel.swap(0, 2);
            }
            self.order = order;
        }
        self
    }

    pub fn resized(&self, width: u32, height: u32, algorithm: ResizeAlgorithm) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ToonError::shape_mismatch(
                "resize target must be non-empty",
                vec![1, 1],
                vec![height as usize, width as usize],
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ToonError::shape_mismatch(
                "resize source must be non-empty",
                vec![1, 1],
                vec![self.height as usize, self.width as usize],
            ));
        }
        if self.data.len() != frame_len(self.width, self.height) {
            return Err(ToonError::shape_mismatch(
                "frame data length",
                vec![frame_len(self.width, self.height)],
                vec![self.data.len()],
            ));
        }
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let (src_w, src_h) = (self.width as usize, self.height as usize);
        let (dst_w, dst_h) = (width as usize, height as usize);
        let data = match algorithm {
            ResizeAlgorithm::Bilinear => resize_bilinear(&self.data, src_w, src_h, dst_w, dst_h),
            ResizeAlgorithm::Nearest => resize_nearest(&self.data, src_w, src_h, dst_w, dst_h),
        };
        Ok(Self {
            data,
            width,
            height,
            order: self.order,
        })
    }
}

pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

/// Nearest-neighbor resize of interleaved 3-channel 8-bit data.
pub(crate) fn resize_nearest(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];
    let src_xs: Vec<usize> = (0..dst_w)
        .map(|x| (((x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize).min(src_w - 1))
        .collect();

    for (dst_y, row) in dst.chunks_exact_mut(dst_w * 3).enumerate() {
        let src_y = (((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize).min(src_h - 1);
        let src_row = &src[src_y * src_w * 3..(src_y + 1) * src_w * 3];
        for (pixel, &src_x) in row.chunks_exact_mut(3).zip(&src_xs) {
            pixel.copy_from_slice(&src_row[src_x * 3..src_x * 3 + 3]);
        }
    }

    dst
}

/// Bilinear resize sampling at pixel centers, edges clamped.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dst_y in 0..dst_h {
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y0 = src_y0.min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * 3;
            for c in 0..3 {
                let p00 = src[(src_y0 * src_w + src_x0) * 3 + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * 3 + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * 3 + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * 3 + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bottom = p01 * (1.0 - fx) + p11 * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                dst[di + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
