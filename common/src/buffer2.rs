//! Owned row-major 2D buffer.
//!
//! Used for every raster in the pipeline: RGB tiles, stitched canvases, logit
//! mosaics and probability masks. Operations are the ones a tile mosaic needs:
//! pasting a tile into a canvas, cutting a tile back out, mirroring for test-time
//! augmentation and bilinear resampling between model and tile resolution.

use std::ops::{Index, IndexMut};
use std::slice;

use rayon::prelude::*;

/// Rows resampled per parallel work item.
const ROWS_PER_CHUNK: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "buffer of {}x{} needs {} pixels, got {}",
            width,
            height,
            width * height,
            pixels.len()
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.pixels
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<&T> {
        (x < self.width && y < self.height).then(|| &self.pixels[y * self.width + x])
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        &mut self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn rows(&self) -> slice::ChunksExact<'_, T> {
        self.pixels.chunks_exact(self.width.max(1))
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.pixels.iter()
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Buffer2<U> {
        Buffer2 {
            pixels: self.pixels.iter().map(f).collect(),
            width: self.width,
            height: self.height,
        }
    }
}

impl<T: Clone + Default> Buffer2<T> {
    pub fn new_default(width: usize, height: usize) -> Self {
        Self::new_filled(width, height, T::default())
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }

    /// Copies `src` so that its top-left corner lands at `(x, y)`.
    ///
    /// Panics if `src` does not fit inside `self` at that offset.
    pub fn blit(&mut self, src: &Buffer2<T>, x: usize, y: usize) {
        assert!(
            x + src.width <= self.width && y + src.height <= self.height,
            "{}x{} blit at ({}, {}) exceeds {}x{} buffer",
            src.width,
            src.height,
            x,
            y,
            self.width,
            self.height
        );
        for (sy, src_row) in src.rows().enumerate() {
            let start = (y + sy) * self.width + x;
            self.pixels[start..start + src.width].clone_from_slice(src_row);
        }
    }

    /// Copies the `width x height` rectangle at `(x, y)`.
    ///
    /// Panics if the rectangle is not fully inside the buffer.
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Buffer2<T> {
        assert!(
            x + width <= self.width && y + height <= self.height,
            "crop {}x{} at ({}, {}) exceeds {}x{} buffer",
            width,
            height,
            x,
            y,
            self.width,
            self.height
        );
        let mut pixels = Vec::with_capacity(width * height);
        for row in y..y + height {
            let start = row * self.width + x;
            pixels.extend_from_slice(&self.pixels[start..start + width]);
        }
        Buffer2 {
            pixels,
            width,
            height,
        }
    }

    /// Like [`crop`](Self::crop), but the rectangle may extend past the right and
    /// bottom edges; the part outside the buffer is filled with `pad`.
    pub fn crop_padded(&self, x: usize, y: usize, width: usize, height: usize, pad: T) -> Buffer2<T> {
        let mut out = Buffer2::new_filled(width, height, pad);
        if x >= self.width || y >= self.height {
            return out;
        }
        let inside_w = width.min(self.width - x);
        let inside_h = height.min(self.height - y);
        for row in 0..inside_h {
            let src_start = (y + row) * self.width + x;
            let dst_start = row * width;
            out.pixels[dst_start..dst_start + inside_w]
                .clone_from_slice(&self.pixels[src_start..src_start + inside_w]);
        }
        out
    }

    pub fn flip_horizontal(&mut self) {
        if self.width == 0 {
            return;
        }
        for row in self.pixels.chunks_exact_mut(self.width) {
            row.reverse();
        }
    }

    pub fn flipped_horizontal(&self) -> Buffer2<T> {
        let mut out = self.clone();
        out.flip_horizontal();
        out
    }
}

impl Buffer2<f32> {
    /// Bilinear resampling with pixel centers at half-integer coordinates.
    ///
    /// Source coordinates are clamped at the borders, so a constant buffer stays
    /// constant at any output size. Weights are not renormalized.
    pub fn resize_bilinear(&self, width: usize, height: usize) -> Buffer2<f32> {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut out = Buffer2::new_default(width, height);
        if width == 0 || height == 0 || self.is_empty() {
            return out;
        }

        let scale_x = self.width as f32 / width as f32;
        let scale_y = self.height as f32 / height as f32;
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;

        let columns: Vec<(usize, usize, f32)> = (0..width)
            .map(|dx| {
                let sx = ((dx as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                (x0, x1, sx - x0 as f32)
            })
            .collect();

        out.pixels
            .par_chunks_mut(width * ROWS_PER_CHUNK)
            .enumerate()
            .for_each(|(chunk_idx, chunk)| {
                for (local_y, out_row) in chunk.chunks_exact_mut(width).enumerate() {
                    let dy = chunk_idx * ROWS_PER_CHUNK + local_y;
                    let sy = ((dy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
                    let y0 = sy.floor() as usize;
                    let y1 = (y0 + 1).min(self.height - 1);
                    let fy = sy - y0 as f32;
                    let top = self.row(y0);
                    let bottom = self.row(y1);

                    for (value, &(x0, x1, fx)) in out_row.iter_mut().zip(&columns) {
                        let t = top[x0] + (top[x1] - top[x0]) * fx;
                        let b = bottom[x0] + (bottom[x1] - bottom[x0]) * fx;
                        *value = t + (b - t) * fy;
                    }
                }
            });

        out
    }

    pub fn mean(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.pixels.iter().map(|&v| v as f64).sum();
        (sum / self.pixels.len() as f64) as f32
    }

    pub fn max(&self) -> f32 {
        self.pixels.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.pixels[y * self.width + x]
    }
}
