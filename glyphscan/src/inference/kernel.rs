//! Gaussian blending weights for overlapping patches.

use common::Buffer2;

/// Normalized 1D Gaussian of `size` taps centered on `(size - 1) / 2`.
pub fn gaussian_1d(size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "Sigma must be positive");

    let center = (size as f32 - 1.0) * 0.5;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let x = i as f32 - center;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// `size x size` Gaussian summing to 1 over its support.
pub fn gaussian_2d(size: usize, sigma: f32) -> Buffer2<f32> {
    // outer product of two normalized 1D kernels is itself normalized
    let g = gaussian_1d(size, sigma);
    Buffer2::from_fn(size, size, |x, y| g[x] * g[y])
}

/// Patch weights at model output resolution.
///
/// The kernel is built at patch resolution and resampled to `output_side`
/// without renormalizing, so only relative weights carry over.
pub fn blend_weights(patch_size: usize, sigma: f32, output_side: usize) -> Buffer2<f32> {
    gaussian_2d(patch_size, sigma).resize_bilinear(output_side, output_side)
}
