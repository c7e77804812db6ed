//! Segmentation model seam, checkpoint loading and the process-wide model cache.


use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use common::SingleFlight;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const PATCH_CHANNELS: usize = 3;

/// Storage key used when a model id yields nothing usable.
pub const UNKNOWN_MODEL: &str = "unknown_model";

/// Dense `[B, 3, P, P]` batch of RGB patches scaled to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchBatch {
    data: Vec<f32>,
    len: usize,
    side: usize,
}

impl PatchBatch {
    pub fn zeros(len: usize, side: usize) -> Self {
        Self {
            data: vec![0.0; len * PATCH_CHANNELS * side * side],
            len,
            side,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn side(&self) -> usize {
        self.side
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.len, PATCH_CHANNELS, self.side, self.side]
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Planar `[3, P, P]` data of patch `index`.
    pub fn patch(&self, index: usize) -> &[f32] {
        let size = PATCH_CHANNELS * self.side * self.side;
        &self.data[index * size..(index + 1) * size]
    }

    pub fn patch_mut(&mut self, index: usize) -> &mut [f32] {
        let size = PATCH_CHANNELS * self.side * self.side;
        &mut self.data[index * size..(index + 1) * size]
    }

    /// Mirrors every plane left to right.
    pub fn flipped_horizontal(&self) -> PatchBatch {
        let mut out = self.clone();
        if self.side > 0 {
            for row in out.data.chunks_exact_mut(self.side) {
                row.reverse();
            }
        }
        out
    }
}

/// Dense `[B, H, W]` batch of logits produced by a model.
#[derive(Debug, Clone, PartialEq)]
pub struct LogitBatch {
    data: Vec<f32>,
    shape: [usize; 3],
}

impl LogitBatch {
    pub fn new(len: usize, height: usize, width: usize, data: Vec<f32>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.len() == len * height * width,
            "logit buffer holds {} values, shape [{}, {}, {}] needs {}",
            data.len(),
            len,
            height,
            width,
            len * height * width
        );
        Ok(Self {
            data,
            shape: [len, height, width],
        })
    }

    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Row-major `H x W` logits of item `index`.
    pub fn item(&self, index: usize) -> &[f32] {
        let size = self.shape[1] * self.shape[2];
        &self.data[index * size..(index + 1) * size]
    }

    pub fn flipped_horizontal(&self) -> LogitBatch {
        let mut out = self.clone();
        if self.shape[2] > 0 {
            for row in out.data.chunks_exact_mut(self.shape[2]) {
                row.reverse();
            }
        }
        out
    }

    /// Element-wise mean of two batches of identical shape.
    pub fn average(&self, other: &LogitBatch) -> LogitBatch {
        debug_assert_eq!(self.shape, other.shape);
        LogitBatch {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a + b) * 0.5)
                .collect(),
            shape: self.shape,
        }
    }
}

/// A loaded segmentation network.
///
/// `forward` maps a `[B, 3, P, P]` batch to `[B, P / s, P / s]` logits where `s`
/// is [`scale_factor`](Self::scale_factor). It must be deterministic for fixed
/// weights and input.
pub trait SegmentationModel: Send + Sync {
    fn scale_factor(&self) -> usize;

    fn forward(&self, batch: &PatchBatch) -> anyhow::Result<LogitBatch>;
}

pub type ModelHandle = Arc<dyn SegmentationModel>;

pub trait ModelLoader: Send + Sync {
    /// Blocking load of `model_id`.
    fn load(&self, model_id: &str) -> Result<ModelHandle>;

    /// Identifiers `load` accepts, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

type ModelFactory = dyn Fn(&Path) -> anyhow::Result<ModelHandle> + Send + Sync;

/// Loads `*.ckpt` files found under a models directory.
///
/// Ids are paths relative to the directory. Turning a checkpoint file into a
/// runnable model is delegated to the factory.
pub struct CheckpointLoader {
    models_dir: PathBuf,
    factory: Box<ModelFactory>,
}

impl fmt::Debug for CheckpointLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointLoader")
            .field("models_dir", &self.models_dir)
            .finish_non_exhaustive()
    }
}

impl CheckpointLoader {
    pub const EXTENSION: &'static str = "ckpt";

    pub fn new<F>(models_dir: impl Into<PathBuf>, factory: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<ModelHandle> + Send + Sync + 'static,
    {
        Self {
            models_dir: models_dir.into(),
            factory: Box::new(factory),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn resolve(&self, model_id: &str) -> Option<PathBuf> {
        let relative = Path::new(model_id);
        let is_plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if model_id.is_empty() || !is_plain {
            return None;
        }
        let path = self.models_dir.join(relative);
        path.is_file().then_some(path)
    }
}

impl ModelLoader for CheckpointLoader {
    fn load(&self, model_id: &str) -> Result<ModelHandle> {
        let path = self.resolve(model_id).ok_or_else(|| Error::ModelNotFound {
            model: model_id.to_string(),
        })?;
        debug!(path = %path.display(), "Deserializing checkpoint");

        let model = (self.factory)(&path).map_err(|err| Error::ModelLoad {
            model: model_id.to_string(),
            message: format!("{err:#}"),
        })?;
        if model.scale_factor() == 0 {
            return Err(Error::ModelLoad {
                model: model_id.to_string(),
                message: "model reports a zero scale factor".to_string(),
            });
        }
        Ok(model)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        if self.models_dir.is_dir() {
            collect_checkpoints(&self.models_dir, &self.models_dir, &mut found)?;
        }
        found.sort();
        Ok(found)
    }
}

fn collect_checkpoints(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_checkpoints(root, &path, found)?;
        } else if path.extension().is_some_and(|ext| ext == CheckpointLoader::EXTENSION) {
            if let Ok(relative) = path.strip_prefix(root) {
                let id: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                found.push(id.join("/"));
            }
        }
    }
    Ok(())
}

/// Loaded models keyed by id, loaded at most once each.
///
/// Concurrent first requests for one id share a single load; a failed load is
/// not remembered, so a later request tries again.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    models: SingleFlight<String, ModelHandle>,
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("loaded", &self.models.len())
            .finish_non_exhaustive()
    }
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            models: SingleFlight::new(),
        }
    }

    pub async fn get_or_load(&self, model_id: &str) -> Result<ModelHandle> {
        let key = model_id.to_string();
        self.models
            .get_or_try_init(&key, || async {
                info!(model = model_id, "Loading model");
                let started = Instant::now();

                let loader = Arc::clone(&self.loader);
                let id = key.clone();
                let model = tokio::task::spawn_blocking(move || loader.load(&id)).await??;

                info!(
                    model = model_id,
                    scale = model.scale_factor(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok::<_, Error>(model)
            })
            .await
    }

    pub fn loaded_count(&self) -> usize {
        self.models.len()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.loader.list()
    }
}

/// Storage key for a model id: the first three `-`-separated parts of its
/// first path component, e.g. `dazzling-plasma-63-sf-b5/best.ckpt` becomes
/// `dazzling-plasma-63`.
pub fn short_model_name(model_id: &str) -> String {
    let normalized = model_id.replace('\\', "/");
    let first = normalized
        .split('/')
        .find(|part| !part.is_empty())
        .unwrap_or_default();
    let short = first.split('-').take(3).collect::<Vec<_>>().join("-");
    if short.is_empty() {
        UNKNOWN_MODEL.to_string()
    } else {
        short
    }
}
