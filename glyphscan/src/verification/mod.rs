//! Verification of candidate groups by an external judge.
//!
//! Every candidate group gets a contextual composite and its stitched
//! prediction, both sent in one request. Requests run concurrently behind a
//! semaphore; each is bounded by a timeout. A failed, timed-out or rejected call
//! drops only its own group. Accepted judgments are fused with each tile's local
//! certainty into per-tile records.

mod client;
mod fusion;
mod response;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Buffer2;
use hashbrown::HashMap;
use image::DynamicImage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::canvas;
use crate::compositor::{ContextualCompositor, fit_within};
use crate::config::VerificationConfig;
use crate::error::Result;
use crate::raster::{Rgb, encode_png, gray_to_image, rgb_to_image};
use crate::source::TileSource;
use crate::tile::{TileCoord, TileGroup};

pub use client::{
    API_KEY_VAR, BASE_URL_VAR, MAX_TOKENS, OPENAI_BASE_URL, OpenAiVerifier, VerificationRequest,
    Verifier, chat_body, png_data_url,
};
pub use fusion::{MAX_LOCAL_WEIGHT, MIN_LOCAL_WEIGHT, TileVerification, fuse, local_weight};
pub use response::{Judgment, RejectedPayload, parse_judgment};

/// A connected set of candidate tiles ready to be judged.
#[derive(Debug, Clone)]
pub struct CandidateGroup {
    pub index: usize,
    pub label: String,
    pub group: TileGroup,
    /// Local certainty of each tile, in group order.
    pub certainty: Vec<f32>,
    pub context_png: Vec<u8>,
    pub prediction_png: Vec<u8>,
}

impl CandidateGroup {
    /// Stitches the satellite and prediction canvases of `group` and renders
    /// both verifier images.
    ///
    /// Tiles without a certainty entry count as 0.
    pub fn prepare(
        index: usize,
        group: TileGroup,
        certainty: &HashMap<TileCoord, f32>,
        satellite: &dyn TileSource<Rgb>,
        predictions: &dyn TileSource<u8>,
        tile_size: usize,
        config: &VerificationConfig,
    ) -> Result<Self> {
        let label = group.label(index);

        let satellite_canvas = canvas::build(&group, satellite, tile_size);
        let prediction_canvas: Buffer2<u8> = canvas::build(&group, predictions, tile_size);
        let contextual = ContextualCompositor::from(config).compose(&satellite_canvas, &prediction_canvas);

        let context_image = fit_within(
            DynamicImage::ImageRgb8(rgb_to_image(&contextual)),
            config.max_image_side,
        );
        let prediction_image = fit_within(
            DynamicImage::ImageLuma8(gray_to_image(&prediction_canvas)),
            config.max_image_side,
        );

        if let Some(dir) = &config.debug_image_dir {
            save_debug_image(dir, &format!("{label}_contextual.png"), &context_image);
            save_debug_image(dir, &format!("{label}_prediction.png"), &prediction_image);
        }

        let certainty = group
            .tiles()
            .iter()
            .map(|coord| certainty.get(coord).copied().unwrap_or(0.0))
            .collect();

        Ok(Self {
            index,
            label,
            group,
            certainty,
            context_png: encode_png(&context_image)?,
            prediction_png: encode_png(&prediction_image)?,
        })
    }
}

fn save_debug_image(dir: &Path, file_name: &str, image: &DynamicImage) {
    let path = dir.join(file_name);
    let saved = std::fs::create_dir_all(dir)
        .map_err(anyhow::Error::from)
        .and_then(|_| image.save(&path).map_err(anyhow::Error::from));
    match saved {
        Ok(()) => info!(path = %path.display(), "Saved debug image"),
        Err(err) => error!(path = %path.display(), error = %err, "Failed to save debug image"),
    }
}

/// Sends candidate groups to a [`Verifier`] with bounded concurrency.
pub struct VerificationDispatcher {
    verifier: Arc<dyn Verifier>,
    config: VerificationConfig,
    timeout: Duration,
}

impl VerificationDispatcher {
    pub fn new(verifier: Arc<dyn Verifier>, config: VerificationConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self {
            verifier,
            config,
            timeout,
        }
    }

    /// Overrides the per-call timeout taken from the configuration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Judges every group and returns the fused records of the accepted ones,
    /// ordered by group index.
    ///
    /// Waits for all calls; at most `max_concurrent` are in flight at a time.
    pub async fn dispatch(&self, groups: Vec<CandidateGroup>, verifier_model: &str) -> Vec<TileVerification> {
        if groups.is_empty() {
            info!("No verification tasks to perform");
            return Vec::new();
        }

        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let (min_confidence, full_confidence) = (self.config.min_confidence, self.config.full_confidence);
        let mut tasks = JoinSet::new();

        info!(
            groups = groups.len(),
            max_concurrent = self.config.max_concurrent,
            model = verifier_model,
            "Dispatching verification requests"
        );

        for candidate in groups {
            let CandidateGroup {
                index,
                label,
                group,
                certainty,
                context_png,
                prediction_png,
            } = candidate;
            let semaphore = Arc::clone(&semaphore);
            let verifier = Arc::clone(&self.verifier);
            let timeout = self.timeout;
            let request = VerificationRequest {
                group_label: label,
                verifier_model: verifier_model.to_string(),
                system_prompt: self.config.system_prompt.clone(),
                task_instructions: self.config.task_instructions.clone(),
                context_png,
                prediction_png,
            };

            tasks.spawn(async move {
                let payload = {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    match tokio::time::timeout(timeout, verifier.verify(&request)).await {
                        Ok(Ok(payload)) => payload,
                        Ok(Err(err)) => {
                            let err = format!("{err:#}");
                            error!(group = %request.group_label, error = %err, "Verification call failed");
                            return None;
                        }
                        Err(_) => {
                            error!(group = %request.group_label, timeout = ?timeout, "Verification call timed out");
                            return None;
                        }
                    }
                };

                let judgment = match parse_judgment(&payload) {
                    Ok(judgment) => judgment,
                    Err(err) => {
                        warn!(group = %request.group_label, error = %err, "Rejected verifier payload");
                        return None;
                    }
                };
                info!(
                    group = %request.group_label,
                    p_glyph = judgment.p_glyph,
                    structure = %judgment.structure.trim(),
                    "Verifier judgment accepted"
                );

                let tiles = group.tiles().iter().copied().zip(certainty);
                Some((index, fuse(&judgment, tiles, min_confidence, full_confidence)))
            });
        }

        let mut accepted = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => accepted.push(result),
                Ok(None) => {}
                Err(err) => error!(error = %err, "Verification task aborted"),
            }
        }
        accepted.sort_by_key(|(index, _)| *index);

        let records: Vec<TileVerification> = accepted.into_iter().flat_map(|(_, records)| records).collect();
        info!(
            records = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished verification"
        );
        records
    }
}
