//! Sliding-window segmentation over a stitched canvas.
//!
//! Square patches are cut on a regular `stride` grid (zero-padded at the right
//! and bottom edges), pushed through the model in mini-batches and blended back
//! into one logit mosaic with Gaussian weights. With TTA each batch is also run
//! mirrored and the two logit maps are averaged before blending.
//!
//! Batches of one canvas are processed in order against a single pair of
//! accumulators; parallelism lives across canvases and inside patch assembly.

mod kernel;
#[cfg(test)]
mod tests;

use std::time::Instant;

use common::Buffer2;
use rayon::prelude::*;
use tracing::debug;

use crate::canvas;
use crate::config::InferenceParams;
use crate::error::{Error, Result};
use crate::model::{LogitBatch, PATCH_CHANNELS, PatchBatch, SegmentationModel};
use crate::raster::{Rgb, sigmoid};
use crate::tile::{TileCoord, TileGroup};

pub use kernel::{blend_weights, gaussian_1d, gaussian_2d};

/// Guards the final division where no patch contributed.
const EPSILON: f32 = 1e-8;

/// Blended model output for one canvas at `1 / scale` resolution.
#[derive(Debug, Clone)]
pub struct Mosaic {
    /// Weighted mean of patch logits.
    pub logits: Buffer2<f32>,
    /// Sum of blending weights per pixel.
    pub coverage: Buffer2<f32>,
    pub scale: usize,
}

/// Per-tile probability mask at full tile resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePrediction {
    pub coord: TileCoord,
    pub mask: Buffer2<f32>,
}

impl TilePrediction {
    pub fn mean(&self) -> f32 {
        self.mask.mean()
    }

    /// Highest probability in the mask.
    pub fn peak(&self) -> f32 {
        if self.mask.is_empty() { 0.0 } else { self.mask.max() }
    }
}

/// Top-left corners of all patches covering a `width x height` canvas.
pub fn patch_origins(width: usize, height: usize, stride: usize) -> Vec<(usize, usize)> {
    (0..height)
        .step_by(stride)
        .flat_map(|y| (0..width).step_by(stride).map(move |x| (x, y)))
        .collect()
}

/// Runs `model` over `canvas` and blends the patch outputs.
///
/// Canvas, patch size and stride must be multiples of the model scale. A
/// forward failure or a logit batch of the wrong shape aborts the whole canvas.
pub fn infer(
    canvas: &Buffer2<Rgb>,
    model: &dyn SegmentationModel,
    params: &InferenceParams,
) -> Result<Mosaic> {
    let scale = model.scale_factor();
    params.check_scale(scale)?;
    if canvas.width() % scale != 0 || canvas.height() % scale != 0 {
        return Err(Error::invalid_config(format!(
            "{}x{} canvas is not a multiple of the model scale factor {}",
            canvas.width(),
            canvas.height(),
            scale
        )));
    }

    let started = Instant::now();
    let patch = params.patch_size;
    let out_patch = patch / scale;
    let (out_w, out_h) = (canvas.width() / scale, canvas.height() / scale);

    let weights = kernel::blend_weights(patch, params.sigma, out_patch);
    let mut weighted_sum: Buffer2<f32> = Buffer2::new_default(out_w, out_h);
    let mut coverage: Buffer2<f32> = Buffer2::new_default(out_w, out_h);

    let origins = patch_origins(canvas.width(), canvas.height(), params.stride);
    let expected = |len| [len, out_patch, out_patch];

    for (batch_index, batch_origins) in origins.chunks(params.batch_size).enumerate() {
        let batch = assemble_batch(canvas, batch_origins, patch);

        let mut logits = model.forward(&batch)?;
        check_shape(&logits, expected(batch.len()))?;

        if params.use_tta {
            let mirrored = model.forward(&batch.flipped_horizontal())?;
            check_shape(&mirrored, expected(batch.len()))?;
            logits = logits.average(&mirrored.flipped_horizontal());
        }

        for (i, &(x, y)) in batch_origins.iter().enumerate() {
            // crop away the padded part of edge patches
            let valid_h = (patch.min(canvas.height() - y) / scale).min(out_h - y / scale);
            let valid_w = (patch.min(canvas.width() - x) / scale).min(out_w - x / scale);
            let item = logits.item(i);

            for row in 0..valid_h {
                let oy = y / scale + row;
                let src = &item[row * out_patch..row * out_patch + valid_w];
                let w = &weights.row(row)[..valid_w];
                let sum_row = &mut weighted_sum.row_mut(oy)[x / scale..x / scale + valid_w];
                for ((acc, &logit), &wt) in sum_row.iter_mut().zip(src).zip(w) {
                    *acc += logit * wt;
                }
                let cov_row = &mut coverage.row_mut(oy)[x / scale..x / scale + valid_w];
                for (acc, &wt) in cov_row.iter_mut().zip(w) {
                    *acc += wt;
                }
            }
        }

        debug!(batch = batch_index, patches = batch.len(), "Blended batch");
    }

    let logits_pixels: Vec<f32> = weighted_sum
        .iter()
        .zip(coverage.iter())
        .map(|(&sum, &norm)| sum / (norm + EPSILON))
        .collect();

    debug!(
        width = canvas.width(),
        height = canvas.height(),
        patches = origins.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Sliding-window inference finished"
    );

    Ok(Mosaic {
        logits: Buffer2::new(out_w, out_h, logits_pixels),
        coverage,
        scale,
    })
}

/// Cuts per-tile logits out of `mosaic`, upsamples them to `tile_size` and
/// applies the sigmoid.
pub fn tile_probabilities(mosaic: &Mosaic, group: &TileGroup, tile_size: usize) -> Vec<TilePrediction> {
    canvas::slice(&mosaic.logits, group)
        .into_par_iter()
        .map(|(coord, low_res)| {
            let mut mask = low_res.resize_bilinear(tile_size, tile_size);
            for v in mask.pixels_mut() {
                *v = sigmoid(*v);
            }
            TilePrediction { coord, mask }
        })
        .collect()
}

fn assemble_batch(canvas: &Buffer2<Rgb>, origins: &[(usize, usize)], patch: usize) -> PatchBatch {
    let mut batch = PatchBatch::zeros(origins.len(), patch);
    let plane = patch * patch;

    batch
        .data_mut()
        .par_chunks_exact_mut(PATCH_CHANNELS * plane)
        .zip(origins.par_iter())
        .for_each(|(dst, &(x, y))| {
            let h = patch.min(canvas.height() - y);
            let w = patch.min(canvas.width() - x);
            for row in 0..h {
                let src = &canvas.row(y + row)[x..x + w];
                for (col, px) in src.iter().enumerate() {
                    for (c, &value) in px.iter().enumerate() {
                        dst[c * plane + row * patch + col] = value as f32 / 255.0;
                    }
                }
            }
        });

    batch
}

fn check_shape(logits: &LogitBatch, expected: [usize; 3]) -> Result<()> {
    if logits.shape() != expected {
        return Err(Error::ModelOutputShape {
            expected,
            actual: logits.shape(),
        });
    }
    Ok(())
}
