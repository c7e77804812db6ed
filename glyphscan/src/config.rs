//! Pipeline configuration.
//!
//! [`PipelineConfig`] is resolved once at process start (defaults, then
//! environment overrides) and validated before any request runs. Per-request
//! inference overrides are folded into an [`InferenceParams`] at request entry.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::candidate::Connectivity;
use crate::error::{Error, Result};

/// Patch size the default Gaussian sigma was tuned for.
pub const CANONICAL_PATCH_SIZE: usize = 512;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert in detecting ancient Amazonian geoglyphs.";

pub const DEFAULT_TASK_INSTRUCTIONS: &str = concat!(
    "You are an expert in detecting ancient Amazonian geoglyphs. Your task is to determine if the ",
    "highlighted shape in the prediction image is a geoglyph.",
    "\n\n--- ANALYSIS STEPS ---",
    "\n1.  **Analyze the Prediction Mask FIRST:** In isolation, describe the shape highlighted in white. ",
    "Is it a simple line, or a complex geometric form (e.g., square, circle, rectangle)?",
    "\n2.  **Examine the Satellite Image:** Look at the corresponding area in the satellite image. ",
    "Can you see faint traces, earthworks, or changes in vegetation that match the shape from the prediction mask?",
    "\n3.  **CRITICAL - Identify Distractors:** Explicitly identify prominent MODERN features like roads, ",
    "vehicle tracks, or buildings. Acknowledge them as separate from the prediction. The prediction highlights ",
    "faint, ancient earthworks, NOT modern, high-contrast roads.",
    "\n4.  **Final Assessment:** Based on the *shape from the prediction mask* and the *faint corresponding ",
    "traces in the satellite image*, provide your final JSON judgment. Do not classify the highlighted shape ",
    "as a 'road' simply because a modern road is also visible elsewhere in the image.",
    "\n\nReturn only a JSON object with exactly the keys 'description' (your step-by-step reasoning), ",
    "'p_glyph' (number, 0-1), and 'structure' (string, e.g., 'road', 'mountain', 'river', or empty if geoglyph)."
);

/// Sliding-window defaults used when a request does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceDefaults {
    pub patch_size: usize,
    pub stride: usize,
    pub use_tta: bool,
    /// Patches per forward pass.
    pub batch_size: usize,
    /// Gaussian sigma for [`CANONICAL_PATCH_SIZE`]; other sizes use `patch / 6`.
    pub canonical_sigma: f32,
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self {
            patch_size: 512,
            stride: 256,
            use_tta: false,
            batch_size: 8,
            canonical_sigma: 170.0,
        }
    }
}

/// Optional per-request overrides of [`InferenceDefaults`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOverrides {
    pub patch_size: Option<usize>,
    pub stride: Option<usize>,
    pub use_tta: Option<bool>,
}

/// Fully resolved sliding-window parameters for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub patch_size: usize,
    pub stride: usize,
    pub use_tta: bool,
    pub batch_size: usize,
    pub sigma: f32,
}

impl InferenceParams {
    pub fn resolve(defaults: &InferenceDefaults, overrides: &InferenceOverrides) -> Result<Self> {
        let patch_size = overrides.patch_size.unwrap_or(defaults.patch_size);
        let stride = overrides.stride.unwrap_or(defaults.stride);
        let use_tta = overrides.use_tta.unwrap_or(defaults.use_tta);

        if patch_size == 0 {
            return Err(Error::invalid_config("patch size must be positive"));
        }
        if stride == 0 {
            return Err(Error::invalid_config("stride must be positive"));
        }
        if defaults.batch_size == 0 {
            return Err(Error::invalid_config("batch size must be positive"));
        }

        let sigma = if patch_size == CANONICAL_PATCH_SIZE {
            defaults.canonical_sigma
        } else {
            patch_size as f32 / 6.0
        };

        Ok(Self {
            patch_size,
            stride,
            use_tta,
            batch_size: defaults.batch_size,
            sigma,
        })
    }

    /// Checks that every size is positive and that patch and stride map onto
    /// whole output pixels.
    pub fn check_scale(&self, scale_factor: usize) -> Result<()> {
        let positive = [
            ("patch size", self.patch_size),
            ("stride", self.stride),
            ("batch size", self.batch_size),
            ("model scale factor", scale_factor),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }
        if !(self.sigma > 0.0) {
            return Err(Error::invalid_config("kernel sigma must be positive"));
        }
        for (name, value) in [("patch size", self.patch_size), ("stride", self.stride)] {
            if value % scale_factor != 0 {
                return Err(Error::invalid_config(format!(
                    "{name} {value} is not a multiple of the model scale factor {scale_factor}"
                )));
            }
        }
        Ok(())
    }
}

/// Thresholds deciding which tiles are sent for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Tile mean probability must be strictly above this.
    pub mean_threshold: f32,
    /// Pixels strictly above this are foreground for blob labeling.
    pub blob_threshold: f32,
    /// Largest blob must have strictly more pixels than this.
    pub min_blob_pixels: usize,
    pub connectivity: Connectivity,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            mean_threshold: 0.01,
            blob_threshold: 0.5,
            min_blob_pixels: 150,
            connectivity: Connectivity::Eight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Upper bound on verifier calls in flight.
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    /// Local certainty at which a tile's weight starts rising above 0.3.
    pub min_confidence: f32,
    /// Local certainty at which a tile's weight reaches 1.0.
    pub full_confidence: f32,
    /// Verifier images are downscaled to fit this side length.
    pub max_image_side: u32,
    pub darken_factor: f32,
    /// 8-bit mask level above which a prediction pixel is highlighted.
    pub mask_threshold: u8,
    pub system_prompt: String,
    pub task_instructions: String,
    /// Where contextual and prediction images are dumped for inspection.
    pub debug_image_dir: Option<PathBuf>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_secs: 120,
            min_confidence: 0.60,
            full_confidence: 0.90,
            max_image_side: 2048,
            darken_factor: 0.3,
            mask_threshold: 80,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            task_instructions: DEFAULT_TASK_INSTRUCTIONS.to_string(),
            debug_image_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePaths {
    /// Satellite tiles laid out as `{z}/{x}/{y}.{ext}`.
    pub tile_root: PathBuf,
    pub predictions_root: PathBuf,
    pub verifications_root: PathBuf,
    pub models_dir: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            tile_root: PathBuf::from("data/tiles"),
            predictions_root: PathBuf::from("data/preds"),
            verifications_root: PathBuf::from("data/oai_preds"),
            models_dir: PathBuf::from("models"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pixel side of one tile.
    pub tile_size: usize,
    pub zoom: u32,
    pub inference: InferenceDefaults,
    /// Groups with more tiles than this are chunked.
    pub max_group_tile_count: usize,
    /// Chunk side in tiles.
    pub chunk_side: usize,
    pub candidate: CandidateConfig,
    pub verification: VerificationConfig,
    pub paths: StoragePaths,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: 512,
            zoom: 17,
            inference: InferenceDefaults::default(),
            max_group_tile_count: 900,
            chunk_side: 20,
            candidate: CandidateConfig::default(),
            verification: VerificationConfig::default(),
            paths: StoragePaths::default(),
        }
    }
}

impl PipelineConfig {
    // ========== Environment ==========

    /// Overrides fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overrides fields from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("TILE_DATA_PATH") {
            self.paths.tile_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PREDS_PATH") {
            self.paths.predictions_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("OAI_PREDS_PATH") {
            self.paths.verifications_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODELS_DIR") {
            self.paths.models_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("INFERENCE_PATCH_SIZE") {
            self.inference.patch_size = parse_var("INFERENCE_PATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("INFERENCE_STRIDE") {
            self.inference.stride = parse_var("INFERENCE_STRIDE", &v)?;
        }
        if let Some(v) = lookup("USE_TTA") {
            self.inference.use_tta = matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "t");
        }
        if let Some(v) = lookup("MAX_GROUP_TILE_COUNT") {
            self.max_group_tile_count = parse_var("MAX_GROUP_TILE_COUNT", &v)?;
        }
        if let Some(v) = lookup("CHUNK_SIZE_IN_TILES") {
            self.chunk_side = parse_var("CHUNK_SIZE_IN_TILES", &v)?;
        }
        Ok(())
    }

    // ========== Validation ==========

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("tile size", self.tile_size),
            ("patch size", self.inference.patch_size),
            ("stride", self.inference.stride),
            ("batch size", self.inference.batch_size),
            ("chunk side", self.chunk_side),
            ("verification concurrency", self.verification.max_concurrent),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }

        let unit = [
            ("mean threshold", self.candidate.mean_threshold),
            ("blob threshold", self.candidate.blob_threshold),
            ("min confidence", self.verification.min_confidence),
            ("full confidence", self.verification.full_confidence),
            ("darken factor", self.verification.darken_factor),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::invalid_config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.verification.min_confidence >= self.verification.full_confidence {
            return Err(Error::invalid_config(
                "min confidence must be below full confidence",
            ));
        }
        if self.verification.max_image_side == 0 {
            return Err(Error::invalid_config("max image side must be positive"));
        }
        if self.verification.timeout_secs == 0 {
            return Err(Error::invalid_config("verifier timeout must be positive"));
        }
        if !(self.inference.canonical_sigma > 0.0) {
            return Err(Error::invalid_config("canonical sigma must be positive"));
        }

        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("{name}={value:?} is not a valid number")))
}
