//! Glyphscan - geoglyph detection over slippy-map tile mosaics.
//!
//! Requested tiles are grouped into connected mosaics, run through a
//! segmentation model with overlapping Gaussian-blended patches and cut back
//! into per-tile probability masks. Tiles with strong, coherent detections can
//! then be judged by an external vision verifier, whose group-level verdicts
//! are fused with each tile's own certainty.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use glyphscan::prelude::*;
//!
//! let mut config = PipelineConfig::default();
//! config.apply_env()?;
//!
//! let loader = CheckpointLoader::new(&config.paths.models_dir, load_checkpoint);
//! let pipeline = GlyphPipeline::new(config, Arc::new(ModelCache::new(Arc::new(loader))))?
//!     .with_verifier(Arc::new(OpenAiVerifier::from_env(Duration::from_secs(120))?));
//!
//! let response = pipeline.run(request).await?;
//! println!("{}", response.message);
//! ```

pub mod candidate;
pub mod canvas;
pub mod compositor;
mod config;
mod error;
pub mod inference;
pub mod model;
mod pipeline;
pub mod raster;
mod source;
mod store;
pub mod tile;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude;

// ============================================================================
// Errors and configuration
// ============================================================================

pub use config::{
    CANONICAL_PATCH_SIZE, CandidateConfig, DEFAULT_SYSTEM_PROMPT, DEFAULT_TASK_INSTRUCTIONS,
    InferenceDefaults, InferenceOverrides, InferenceParams, PipelineConfig, StoragePaths,
    VerificationConfig,
};
pub use error::{Error, Result};

// ============================================================================
// Tiles, sources and storage
// ============================================================================

pub use source::{DirectoryTileSource, TILE_EXTENSIONS, TileSource};
pub use store::PredictionStore;
pub use tile::{TileBounds, TileCoord, TileGroup, group_tiles, split_if_oversized};

// ============================================================================
// Models and inference
// ============================================================================

pub use inference::{Mosaic, TilePrediction, infer};
pub use model::{
    CheckpointLoader, LogitBatch, ModelCache, ModelHandle, ModelLoader, PatchBatch,
    SegmentationModel, short_model_name,
};

// ============================================================================
// Candidates and verification
// ============================================================================

pub use candidate::Connectivity;
pub use compositor::ContextualCompositor;
pub use verification::{
    CandidateGroup, Judgment, OpenAiVerifier, TileVerification, VerificationDispatcher,
    VerificationRequest, Verifier,
};

// ============================================================================
// Request surface
// ============================================================================

pub use pipeline::{GlyphPipeline, InferenceRequest, InferenceResponse, PredictionPayload};
