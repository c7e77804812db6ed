//! On-disk persistence of predictions and verification records.
//!
//! Both live under a per-model directory keyed by the short model name:
//! `{predictions_root}/{short}/{z}/{x}/{y}.png` holds the 8-bit probability
//! raster and `{verifications_root}/{short}/{z}/{x}/{y}.json` the fused record.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use common::Buffer2;
use serde::{Deserialize, Serialize};

use crate::config::StoragePaths;
use crate::error::{Error, Result};
use crate::raster;
use crate::source::TileSource;
use crate::tile::TileCoord;
use crate::verification::TileVerification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VerificationRecord {
    prob: f64,
    label: String,
    description: String,
}

/// Prediction and verification files of one model.
#[derive(Debug, Clone)]
pub struct PredictionStore {
    predictions_dir: PathBuf,
    verifications_dir: PathBuf,
    tile_size: usize,
}

impl PredictionStore {
    /// Fails with `InvalidConfig` unless `short_model_name` is a single plain
    /// path component, so the store never reaches outside its roots.
    pub fn new(paths: &StoragePaths, short_model_name: &str, tile_size: usize) -> Result<Self> {
        let mut components = Path::new(short_model_name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || short_model_name.contains(['/', '\\']) {
            return Err(Error::invalid_config(format!(
                "model name {short_model_name:?} is not a valid storage directory"
            )));
        }

        Ok(Self {
            predictions_dir: paths.predictions_root.join(short_model_name),
            verifications_dir: paths.verifications_root.join(short_model_name),
            tile_size,
        })
    }

    pub fn prediction_path(&self, coord: TileCoord) -> PathBuf {
        tile_path(&self.predictions_dir, coord, "png")
    }

    pub fn verification_path(&self, coord: TileCoord) -> PathBuf {
        tile_path(&self.verifications_dir, coord, "json")
    }

    // ========== Predictions ==========

    pub fn save_prediction(&self, coord: TileCoord, levels: &Buffer2<u8>) -> Result<()> {
        self.save_prediction_png(coord, &raster::encode_gray_png(levels)?)
    }

    /// Writes an already encoded prediction PNG.
    pub fn save_prediction_png(&self, coord: TileCoord, png: &[u8]) -> Result<()> {
        let path = self.prediction_path(coord);
        create_parent(&path)?;
        fs::write(&path, png).map_err(|e| Error::io(path, e))
    }

    /// Stored 8-bit raster of `coord`, `None` if it was never written.
    pub fn load_prediction(&self, coord: TileCoord) -> Result<Option<Buffer2<u8>>> {
        let path = self.prediction_path(coord);
        if !path.is_file() {
            return Ok(None);
        }
        raster::load_gray(&path, self.tile_size).map(Some)
    }

    // ========== Verifications ==========

    pub fn save_verification(&self, record: &TileVerification) -> Result<()> {
        let path = self.verification_path(record.coord);
        create_parent(&path)?;
        let json = serde_json::to_vec(&VerificationRecord {
            prob: record.prob,
            label: record.label.clone(),
            description: record.description.clone(),
        })?;
        fs::write(&path, json).map_err(|e| Error::io(path, e))
    }

    pub fn load_verification(&self, coord: TileCoord) -> Result<Option<TileVerification>> {
        let path = self.verification_path(coord);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        let record: VerificationRecord = serde_json::from_slice(&bytes)?;
        Ok(Some(TileVerification {
            coord,
            prob: record.prob,
            label: record.label,
            description: record.description,
        }))
    }

    /// Deletes the record of `coord`. Returns whether one existed.
    pub fn remove_verification(&self, coord: TileCoord) -> Result<bool> {
        let path = self.verification_path(coord);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

impl TileSource<u8> for PredictionStore {
    fn lookup(&self, coord: TileCoord) -> Result<Option<Buffer2<u8>>> {
        self.load_prediction(coord)
    }
}

fn tile_path(root: &Path, coord: TileCoord, extension: &str) -> PathBuf {
    root.join(coord.z.to_string())
        .join(coord.x.to_string())
        .join(format!("{}.{extension}", coord.y))
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) => fs::create_dir_all(dir).map_err(|e| Error::io(dir, e)),
        None => Ok(()),
    }
}
