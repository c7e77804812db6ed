//! Conversions between [`Buffer2`] rasters, probabilities and encoded images.

use std::io::Cursor;
use std::path::Path;

use common::Buffer2;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};

use crate::error::{Error, Result};

/// 8-bit RGB pixel.
pub type Rgb = [u8; 3];

#[inline]
pub fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

/// Maps a probability to its 8-bit storage level, `round(p * 255)`.
#[inline]
pub fn quantize(probability: f32) -> u8 {
    (probability * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
pub fn dequantize(level: u8) -> f32 {
    level as f32 / 255.0
}

pub fn rgb_from_image(image: &RgbImage) -> Buffer2<Rgb> {
    Buffer2::new(
        image.width() as usize,
        image.height() as usize,
        image.pixels().map(|p| p.0).collect(),
    )
}

pub fn rgb_to_image(buffer: &Buffer2<Rgb>) -> RgbImage {
    RgbImage::from_fn(buffer.width() as u32, buffer.height() as u32, |x, y| {
        image::Rgb(buffer[(x as usize, y as usize)])
    })
}

pub fn gray_from_image(image: &GrayImage) -> Buffer2<u8> {
    Buffer2::new(
        image.width() as usize,
        image.height() as usize,
        image.pixels().map(|p| p.0[0]).collect(),
    )
}

pub fn gray_to_image(buffer: &Buffer2<u8>) -> GrayImage {
    GrayImage::from_fn(buffer.width() as u32, buffer.height() as u32, |x, y| {
        Luma([buffer[(x as usize, y as usize)]])
    })
}

/// Decodes an image file to RGB, resampled to `side x side` if it is not already.
pub fn load_rgb(path: &Path, side: usize) -> Result<Buffer2<Rgb>> {
    let image = open(path)?.to_rgb8();
    let image = fit_square(image, side);
    Ok(rgb_from_image(&image))
}

/// Decodes an image file to 8-bit grayscale, resampled to `side x side` if needed.
pub fn load_gray(path: &Path, side: usize) -> Result<Buffer2<u8>> {
    let image = open(path)?.to_luma8();
    let image = fit_square(image, side);
    Ok(gray_from_image(&image))
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .map_err(Error::Encode)?;
    Ok(bytes.into_inner())
}

pub fn encode_gray_png(buffer: &Buffer2<u8>) -> Result<Vec<u8>> {
    encode_png(&DynamicImage::ImageLuma8(gray_to_image(buffer)))
}

pub fn encode_rgb_png(buffer: &Buffer2<Rgb>) -> Result<Vec<u8>> {
    encode_png(&DynamicImage::ImageRgb8(rgb_to_image(buffer)))
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn fit_square<P>(
    image: image::ImageBuffer<P, Vec<P::Subpixel>>,
    side: usize,
) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel + 'static,
{
    let side = side as u32;
    if image.width() == side && image.height() == side {
        image
    } else {
        imageops::resize(&image, side, side, FilterType::Triangle)
    }
}
