//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use glyphscan::prelude::*;
//! ```

// Configuration and errors
pub use crate::{Error, InferenceOverrides, PipelineConfig, Result};

// Tiles and models
pub use crate::{CheckpointLoader, ModelCache, SegmentationModel, TileCoord, TileSource};

// Request surface
pub use crate::{GlyphPipeline, InferenceRequest, InferenceResponse, TileVerification};

// Verification
pub use crate::{OpenAiVerifier, Verifier};
