//! Contextual composite images for verification.
//!
//! The satellite canvas is dimmed everywhere except around the predicted
//! shape: the thresholded prediction is dilated with a square kernel of about
//! 1/16 of the image width, then feathered with a Gaussian about 2.5 times that
//! size, and the result is used as an alpha matte between the original and the
//! dimmed image.


use common::Buffer2;
use image::DynamicImage;
use image::imageops::FilterType;
use rayon::prelude::*;

use crate::config::VerificationConfig;
use crate::raster::Rgb;

/// Fixed kernels used for small apertures when no sigma is given.
const SMALL_GAUSSIAN_KERNELS: [&[f32]; 4] = [
    &[1.0],
    &[0.25, 0.5, 0.25],
    &[0.0625, 0.25, 0.375, 0.25, 0.0625],
    &[0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125],
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextualCompositor {
    pub darken_factor: f32,
    /// Prediction levels strictly above this are highlighted.
    pub mask_threshold: u8,
}

impl From<&VerificationConfig> for ContextualCompositor {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            darken_factor: config.darken_factor,
            mask_threshold: config.mask_threshold,
        }
    }
}

impl ContextualCompositor {
    /// Spotlights `prediction` (8-bit probabilities) on `satellite`.
    ///
    /// Both rasters cover the same canvas.
    pub fn compose(&self, satellite: &Buffer2<Rgb>, prediction: &Buffer2<u8>) -> Buffer2<Rgb> {
        assert_eq!(
            (satellite.width(), satellite.height()),
            (prediction.width(), prediction.height()),
            "satellite and prediction canvases differ in size"
        );

        let dilate_size = odd(satellite.width() / 16);
        let blur_size = odd(dilate_size * 5 / 2);

        let binary = prediction.map(|&v| if v > self.mask_threshold { 255u8 } else { 0 });
        let dilated = dilate_square(&binary, dilate_size);
        let matte = gaussian_blur(&dilated, blur_size);

        let factor = self.darken_factor;
        let pixels = satellite
            .pixels()
            .par_iter()
            .zip(matte.pixels().par_iter())
            .map(|(px, &m)| {
                let alpha = m as f32 / 255.0;
                px.map(|c| {
                    let dark = darken(c, factor) as f32;
                    (c as f32 * alpha + dark * (1.0 - alpha)) as u8
                })
            })
            .collect();

        Buffer2::new(satellite.width(), satellite.height(), pixels)
    }
}

/// `|value * factor|`, rounded half to even and saturated.
#[inline]
fn darken(value: u8, factor: f32) -> u8 {
    (value as f32 * factor).abs().round_ties_even().min(255.0) as u8
}

/// Rounds an even size up to the next odd one; never below 1.
#[inline]
fn odd(size: usize) -> usize {
    if size % 2 == 0 { size + 1 } else { size }
}

/// Reflect-101 border: `gfedcb|abcdefgh|gfedcba`.
fn reflect_101(mut i: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

/// Dilation with a `size x size` square; pixels outside the image are ignored.
pub fn dilate_square(mask: &Buffer2<u8>, size: usize) -> Buffer2<u8> {
    let radius = size / 2;
    if radius == 0 || mask.is_empty() {
        return mask.clone();
    }
    let (width, height) = (mask.width(), mask.height());

    // horizontal pass
    let mut horizontal = Buffer2::new_default(width, height);
    horizontal
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out)| {
            let row = mask.row(y);
            for (x, v) in out.iter_mut().enumerate() {
                let lo = x.saturating_sub(radius);
                let hi = (x + radius).min(width - 1);
                *v = row[lo..=hi].iter().copied().max().unwrap_or(0);
            }
        });

    // vertical pass
    let mut out = Buffer2::new_default(width, height);
    out.pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(height - 1);
            out_row.copy_from_slice(horizontal.row(lo));
            for yy in lo + 1..=hi {
                for (o, &v) in out_row.iter_mut().zip(horizontal.row(yy)) {
                    *o = (*o).max(v);
                }
            }
        });

    out
}

/// Taps of a normalized Gaussian of odd `size`, with sigma derived from the
/// size as `0.3 * ((size - 1) / 2 - 1) + 0.8`.
pub fn gaussian_taps(size: usize) -> Vec<f32> {
    debug_assert!(size % 2 == 1);
    if let Some(fixed) = SMALL_GAUSSIAN_KERNELS.get(size / 2) {
        return fixed.to_vec();
    }

    let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (size / 2) as f64;
    let scale = -0.5 / (sigma * sigma);
    let taps: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - center;
            (scale * x * x).exp()
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter().map(|&t| (t / sum) as f32).collect()
}

/// Separable Gaussian blur of odd `size` with reflect-101 borders.
pub fn gaussian_blur(mask: &Buffer2<u8>, size: usize) -> Buffer2<u8> {
    if size <= 1 || mask.is_empty() {
        return mask.clone();
    }
    let (width, height) = (mask.width(), mask.height());
    let taps = gaussian_taps(size);
    let radius = (size / 2) as isize;

    let mut horizontal: Buffer2<f32> = Buffer2::new_default(width, height);
    horizontal
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out)| {
            let row = mask.row(y);
            for (x, v) in out.iter_mut().enumerate() {
                *v = taps
                    .iter()
                    .enumerate()
                    .map(|(k, &t)| {
                        let sx = reflect_101(x as isize + k as isize - radius, width);
                        t * row[sx] as f32
                    })
                    .sum();
            }
        });

    let mut out = Buffer2::new_default(width, height);
    out.pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            for (x, v) in out_row.iter_mut().enumerate() {
                let sum: f32 = taps
                    .iter()
                    .enumerate()
                    .map(|(k, &t)| {
                        let sy = reflect_101(y as isize + k as isize - radius, height);
                        t * horizontal[(x, sy)]
                    })
                    .sum();
                *v = sum.round().clamp(0.0, 255.0) as u8;
            }
        });

    out
}

/// Downscales `image` with Lanczos resampling so neither side exceeds
/// `max_side`, keeping the aspect ratio. Smaller images are returned as is.
pub fn fit_within(image: DynamicImage, max_side: u32) -> DynamicImage {
    if image.width() <= max_side && image.height() <= max_side {
        return image;
    }
    tracing::info!(
        width = image.width(),
        height = image.height(),
        max_side,
        "Resizing verification image"
    );
    image.resize(max_side, max_side, FilterType::Lanczos3)
}
