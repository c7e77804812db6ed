//! Request-level orchestration.
//!
//! A request's tiles are grouped and chunked, each chunk is stitched, run
//! through the model and cut back into per-tile predictions which are persisted
//! as 8-bit rasters. Chunks run in parallel on the blocking pool. Optionally the
//! candidates among the predictions are then verified.


use std::sync::Arc;
use std::time::Instant;

use base64::{Engine, engine::general_purpose};
use common::Buffer2;
use hashbrown::HashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::candidate;
use crate::canvas;
use crate::config::{InferenceOverrides, InferenceParams, PipelineConfig};
use crate::error::{Error, Result};
use crate::inference::{self, TilePrediction};
use crate::model::{ModelCache, SegmentationModel, short_model_name};
use crate::raster::{Rgb, dequantize, encode_gray_png, quantize};
use crate::source::{DirectoryTileSource, TileSource};
use crate::store::PredictionStore;
use crate::tile::{self, TileCoord, TileGroup};
use crate::verification::{CandidateGroup, TileVerification, VerificationDispatcher, Verifier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub tiles: Vec<TileCoord>,
    #[serde(alias = "model_name")]
    pub model_id: String,
    #[serde(flatten)]
    pub overrides: InferenceOverrides,
    /// Run the verification pass after inference.
    #[serde(default, alias = "use_oai")]
    pub verify: bool,
    #[serde(default, alias = "oai_model_name")]
    pub verifier_model: String,
}

/// One tile's probability raster, PNG encoded as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPayload {
    #[serde(flatten)]
    pub coord: TileCoord,
    pub prob_png_b64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub message: String,
    pub predictions: Vec<PredictionPayload>,
    #[serde(rename = "oai_predictions", alias = "verifications")]
    pub verifications: Vec<TileVerification>,
}

/// A tile's prediction as persisted: 8-bit levels plus their PNG encoding.
#[derive(Debug, Clone)]
struct StoredPrediction {
    coord: TileCoord,
    levels: Buffer2<u8>,
    png: Vec<u8>,
}

impl StoredPrediction {
    /// Probabilities as read back from storage.
    fn to_prediction(&self) -> TilePrediction {
        TilePrediction {
            coord: self.coord,
            mask: self.levels.map(|&level| dequantize(level)),
        }
    }
}

/// Inference and verification service over one tile store.
pub struct GlyphPipeline {
    config: Arc<PipelineConfig>,
    models: Arc<ModelCache>,
    satellite: Arc<dyn TileSource<Rgb>>,
    verifier: Option<Arc<dyn Verifier>>,
}

impl GlyphPipeline {
    /// Validates `config` and reads satellite tiles from its tile root.
    pub fn new(config: PipelineConfig, models: Arc<ModelCache>) -> Result<Self> {
        config.validate()?;
        let satellite = Arc::new(DirectoryTileSource::new(
            config.paths.tile_root.clone(),
            config.tile_size,
        ));
        Ok(Self {
            config: Arc::new(config),
            models,
            satellite,
            verifier: None,
        })
    }

    pub fn with_tile_source(mut self, satellite: Arc<dyn TileSource<Rgb>>) -> Self {
        self.satellite = satellite;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelCache {
        &self.models
    }

    /// Checkpoint ids the model loader can serve.
    pub fn available_models(&self) -> Result<Vec<String>> {
        self.models.list()
    }

    pub async fn run(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let started = Instant::now();
        info!(
            tiles = request.tiles.len(),
            model = %request.model_id,
            "Received inference request"
        );

        self.check_zoom(&request.tiles)?;
        if request.verify {
            self.verification_target(&request.verifier_model)?;
        }
        let params = InferenceParams::resolve(&self.config.inference, &request.overrides)?;

        let model = self.models.get_or_load(&request.model_id).await?;
        self.check_model_scale(&params, model.scale_factor())?;
        info!(
            patch_size = params.patch_size,
            stride = params.stride,
            use_tta = params.use_tta,
            "Resolved inference parameters"
        );

        let short_name = short_model_name(&request.model_id);
        info!(short_name = %short_name, "Derived short name for storage");
        let store = Arc::new(PredictionStore::new(
            &self.config.paths,
            &short_name,
            self.config.tile_size,
        )?);

        let chunks = tile::plan_chunks(
            &request.tiles,
            self.config.max_group_tile_count,
            self.config.chunk_side,
        )?;
        let stored = self.infer_chunks(chunks, model, params, Arc::clone(&store)).await?;

        let elapsed = started.elapsed().as_secs_f64();
        info!(tiles = stored.len(), elapsed_s = elapsed, "Finished processing all chunks");

        let verifications = if request.verify {
            let predictions: Vec<TilePrediction> = stored.iter().map(StoredPrediction::to_prediction).collect();
            let levels: HashMap<TileCoord, Buffer2<u8>> =
                stored.iter().map(|p| (p.coord, p.levels.clone())).collect();
            self.verify_predictions(
                &request.tiles,
                predictions,
                levels,
                &store,
                &request.verifier_model,
            )
            .await?
        } else {
            Vec::new()
        };

        let predictions = stored
            .into_iter()
            .map(|p| PredictionPayload {
                coord: p.coord,
                prob_png_b64: general_purpose::STANDARD.encode(&p.png),
            })
            .collect::<Vec<_>>();

        Ok(InferenceResponse {
            message: format!("Processed {} tiles in {:.2}s.", predictions.len(), elapsed),
            predictions,
            verifications,
        })
    }

    /// Verifies the persisted predictions of `tiles` without running the model.
    ///
    /// Tiles without a stored prediction are skipped.
    pub async fn verify_stored(
        &self,
        tiles: &[TileCoord],
        model_id: &str,
        verifier_model: &str,
    ) -> Result<Vec<TileVerification>> {
        self.check_zoom(tiles)?;
        self.verification_target(verifier_model)?;

        let short_name = short_model_name(model_id);
        let store = Arc::new(PredictionStore::new(
            &self.config.paths,
            &short_name,
            self.config.tile_size,
        )?);

        let loader = Arc::clone(&store);
        let requested = tiles.to_vec();
        let loaded: Vec<(TileCoord, Buffer2<u8>)> = tokio::task::spawn_blocking(move || {
            requested
                .par_iter()
                .filter_map(|&coord| match loader.load_prediction(coord) {
                    Ok(Some(levels)) => Some((coord, levels)),
                    Ok(None) => {
                        debug!(tile = %coord, "No stored prediction, skipping");
                        None
                    }
                    Err(err) => {
                        warn!(tile = %coord, error = %err, "Failed to read stored prediction, skipping");
                        None
                    }
                })
                .collect()
        })
        .await?;
        info!(requested = tiles.len(), loaded = loaded.len(), "Loaded stored predictions");

        let predictions = loaded
            .iter()
            .map(|(coord, levels)| TilePrediction {
                coord: *coord,
                mask: levels.map(|&level| dequantize(level)),
            })
            .collect();
        let levels = loaded.into_iter().collect();

        self.verify_predictions(tiles, predictions, levels, &store, verifier_model)
            .await
    }

    // ========== Inference ==========

    async fn infer_chunks(
        &self,
        chunks: Vec<TileGroup>,
        model: Arc<dyn SegmentationModel>,
        params: InferenceParams,
        store: Arc<PredictionStore>,
    ) -> Result<Vec<StoredPrediction>> {
        let total = chunks.len();
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let model = Arc::clone(&model);
            let satellite = Arc::clone(&self.satellite);
            let store = Arc::clone(&store);
            let tile_size = self.config.tile_size;

            tasks.spawn_blocking(move || {
                info!("Processing chunk {}/{} with {} tiles", index + 1, total, chunk.len());
                let result = process_chunk(&chunk, model.as_ref(), satellite.as_ref(), &store, &params, tile_size);
                (index, result)
            });
        }

        let mut finished = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            finished.push(joined?);
        }
        finished.sort_by_key(|(index, _)| *index);

        let mut first_error = None;
        let mut stored = Vec::new();
        for (index, result) in finished {
            match result {
                Ok(predictions) => stored.extend(predictions),
                Err(err) => {
                    error!(chunk = index + 1, error = %err, "Chunk failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(stored),
        }
    }

    // ========== Verification ==========

    async fn verify_predictions(
        &self,
        requested: &[TileCoord],
        predictions: Vec<TilePrediction>,
        levels: HashMap<TileCoord, Buffer2<u8>>,
        store: &Arc<PredictionStore>,
        verifier_model: &str,
    ) -> Result<Vec<TileVerification>> {
        let verifier = self.verification_target(verifier_model)?;

        info!(tiles = requested.len(), "Deleting existing verification records");
        for &coord in requested {
            if let Err(err) = store.remove_verification(coord) {
                warn!(tile = %coord, error = %err, "Could not delete old verification record");
            }
        }

        let candidates = candidate::select(&predictions, &self.config.candidate);
        info!(
            predictions = predictions.len(),
            candidates = candidates.len(),
            "Selected verification candidates"
        );
        let certainty: HashMap<TileCoord, f32> = candidates.iter().map(|p| (p.coord, p.peak())).collect();
        let candidate_coords: Vec<TileCoord> = candidates.iter().map(|p| p.coord).collect();
        let groups = tile::group_tiles(&candidate_coords);
        info!(groups = groups.len(), "Grouped candidates into connected groups");

        let config = Arc::clone(&self.config);
        let satellite = Arc::clone(&self.satellite);
        let prepared: Vec<CandidateGroup> = tokio::task::spawn_blocking(move || {
            groups
                .into_par_iter()
                .enumerate()
                .filter_map(|(index, group)| {
                    let label = group.label(index);
                    match CandidateGroup::prepare(
                        index,
                        group,
                        &certainty,
                        satellite.as_ref(),
                        &levels,
                        config.tile_size,
                        &config.verification,
                    ) {
                        Ok(prepared) => Some(prepared),
                        Err(err) => {
                            error!(group = %label, error = %err, "Failed to render verification images");
                            None
                        }
                    }
                })
                .collect()
        })
        .await?;

        let dispatcher = VerificationDispatcher::new(verifier, self.config.verification.clone());
        let records = dispatcher.dispatch(prepared, verifier_model).await;

        for record in &records {
            if let Err(err) = store.save_verification(record) {
                error!(tile = %record.coord, error = %err, "Failed to persist verification record");
            }
        }
        info!(records = records.len(), "Verification records produced");

        Ok(records)
    }

    // ========== Checks ==========

    fn check_zoom(&self, tiles: &[TileCoord]) -> Result<()> {
        match tiles.iter().find(|t| t.z != self.config.zoom) {
            Some(tile) => Err(Error::invalid_config(format!(
                "tile {tile} is not at the configured zoom level {}",
                self.config.zoom
            ))),
            None => Ok(()),
        }
    }

    fn check_model_scale(&self, params: &InferenceParams, scale_factor: usize) -> Result<()> {
        params.check_scale(scale_factor)?;
        if self.config.tile_size % scale_factor != 0 {
            return Err(Error::invalid_config(format!(
                "tile size {} is not a multiple of the model scale factor {scale_factor}",
                self.config.tile_size
            )));
        }
        Ok(())
    }

    fn verification_target(&self, verifier_model: &str) -> Result<Arc<dyn Verifier>> {
        let verifier = self
            .verifier
            .clone()
            .ok_or_else(|| Error::invalid_config("verification requested but no verifier is configured"))?;
        if verifier_model.trim().is_empty() {
            return Err(Error::invalid_config("verification requested without a verifier model"));
        }
        Ok(verifier)
    }
}

/// Stitches, infers and persists one chunk.
fn process_chunk(
    chunk: &TileGroup,
    model: &dyn SegmentationModel,
    satellite: &dyn TileSource<Rgb>,
    store: &PredictionStore,
    params: &InferenceParams,
    tile_size: usize,
) -> Result<Vec<StoredPrediction>> {
    let canvas = canvas::build(chunk, satellite, tile_size);
    let mosaic = inference::infer(&canvas, model, params)?;

    inference::tile_probabilities(&mosaic, chunk, tile_size)
        .into_par_iter()
        .map(|prediction| {
            let levels = prediction.mask.map(|&p| quantize(p));
            let png = encode_gray_png(&levels)?;
            if let Err(err) = store.save_prediction_png(prediction.coord, &png) {
                error!(tile = %prediction.coord, error = %err, "Failed to persist prediction");
            }
            Ok::<_, Error>(StoredPrediction {
                coord: prediction.coord,
                levels,
                png,
            })
        })
        .collect()
}
