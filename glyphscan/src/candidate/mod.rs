//! Selection of tiles worth sending for verification.
//!
//! A tile qualifies when its mean probability is strictly above
//! `mean_threshold` and its largest blob of pixels strictly above
//! `blob_threshold` has strictly more than `min_blob_pixels` pixels.

mod labeling;

use rayon::prelude::*;
use tracing::debug;

use crate::config::CandidateConfig;
use crate::inference::TilePrediction;

pub use labeling::{Connectivity, blob_sizes, largest_blob};

pub fn is_candidate(prediction: &TilePrediction, config: &CandidateConfig) -> bool {
    let mean = prediction.mean();
    if mean <= config.mean_threshold {
        return false;
    }
    let blob = largest_blob(&prediction.mask, config.blob_threshold, config.connectivity);
    debug!(tile = %prediction.coord, mean, largest_blob = blob, "Candidate check");
    blob > config.min_blob_pixels
}

/// Candidates among `predictions`, in input order.
pub fn select<'a>(predictions: &'a [TilePrediction], config: &CandidateConfig) -> Vec<&'a TilePrediction> {
    let keep: Vec<bool> = predictions
        .par_iter()
        .map(|p| is_candidate(p, config))
        .collect();

    predictions
        .iter()
        .zip(keep)
        .filter_map(|(p, keep)| keep.then_some(p))
        .collect()
}
