//! Shared helpers for unit tests: tracing setup, stub collaborators and synthetic tiles.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::Buffer2;
use image::RgbImage;

use crate::error::{Error, Result};
use crate::model::{LogitBatch, ModelHandle, ModelLoader, PatchBatch, SegmentationModel};
use crate::raster::Rgb;
use crate::tile::TileCoord;
use crate::verification::{VerificationRequest, Verifier};

/// Initialize tracing subscriber for tests.
/// Safe to call multiple times - will only initialize once.
/// Respects RUST_LOG env var, defaults to "info".
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ========== Models ==========

/// Outputs the same logit everywhere.
pub struct ConstantModel {
    pub logit: f32,
    pub scale: usize,
}

impl SegmentationModel for ConstantModel {
    fn scale_factor(&self) -> usize {
        self.scale
    }

    fn forward(&self, batch: &PatchBatch) -> anyhow::Result<LogitBatch> {
        let side = batch.side() / self.scale;
        LogitBatch::new(
            batch.len(),
            side,
            side,
            vec![self.logit; batch.len() * side * side],
        )
    }
}

/// Mean of the three input channels over each `scale x scale` block.
///
/// Commutes with horizontal mirroring, so TTA must not change its output.
pub struct IdentityModel {
    pub scale: usize,
}

impl SegmentationModel for IdentityModel {
    fn scale_factor(&self) -> usize {
        self.scale
    }

    fn forward(&self, batch: &PatchBatch) -> anyhow::Result<LogitBatch> {
        let p = batch.side();
        let s = self.scale;
        let out = p / s;
        let plane = p * p;
        let norm = (3 * s * s) as f32;

        let mut data = Vec::with_capacity(batch.len() * out * out);
        for i in 0..batch.len() {
            let patch = batch.patch(i);
            for oy in 0..out {
                for ox in 0..out {
                    let mut sum = 0.0;
                    for c in 0..3 {
                        for y in oy * s..(oy + 1) * s {
                            for x in ox * s..(ox + 1) * s {
                                sum += patch[c * plane + y * p + x];
                            }
                        }
                    }
                    data.push(sum / norm);
                }
            }
        }
        LogitBatch::new(batch.len(), out, out, data)
    }
}

/// Fails every forward pass.
pub struct FailingModel {
    pub scale: usize,
}

impl SegmentationModel for FailingModel {
    fn scale_factor(&self) -> usize {
        self.scale
    }

    fn forward(&self, _batch: &PatchBatch) -> anyhow::Result<LogitBatch> {
        anyhow::bail!("device lost")
    }
}

/// Returns logits of the wrong spatial size.
pub struct MisshapenModel;

impl SegmentationModel for MisshapenModel {
    fn scale_factor(&self) -> usize {
        1
    }

    fn forward(&self, batch: &PatchBatch) -> anyhow::Result<LogitBatch> {
        LogitBatch::new(batch.len(), 1, 1, vec![0.0; batch.len()])
    }
}

/// Loader serving a fixed set of ids, counting and optionally slowing each load.
pub struct StubLoader {
    models: Vec<(String, ModelHandle)>,
    delay: Duration,
    loads: AtomicUsize,
}

impl StubLoader {
    pub fn new() -> Self {
        Self {
            models: Vec::new(),
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, id: &str, model: impl SegmentationModel + 'static) -> Self {
        self.models.push((id.to_string(), Arc::new(model)));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, model_id: &str) -> Result<ModelHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.models
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, model)| Arc::clone(model))
            .ok_or_else(|| Error::ModelNotFound {
                model: model_id.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.models.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

// ========== Verifiers ==========

type Responder = dyn Fn(&VerificationRequest) -> anyhow::Result<String> + Send + Sync;

/// Verifier answering through a closure, tracking calls and peak concurrency.
pub struct StubVerifier {
    respond: Box<Responder>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StubVerifier {
    pub fn new(
        respond: impl Fn(&VerificationRequest) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always answers with `payload`.
    pub fn fixed(payload: &str) -> Self {
        let payload = payload.to_string();
        Self::new(move |_| Ok(payload.clone()))
    }

    /// Always answers with a well-formed judgment of `p_glyph`.
    pub fn judging(p_glyph: f64) -> Self {
        Self::fixed(&format!(
            r#"{{"p_glyph": {p_glyph}, "structure": " ring ditch ", "description": " circular enclosure "}}"#
        ))
    }

    pub fn failing() -> Self {
        Self::new(|_| Err(anyhow::anyhow!("connection reset")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for StubVerifier {
    async fn verify(&self, request: &VerificationRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.respond)(request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ========== Rasters ==========

pub fn solid_tile(side: usize, color: Rgb) -> Buffer2<Rgb> {
    Buffer2::new_filled(side, side, color)
}

/// Writes a solid PNG tile under `root` in the `{z}/{x}/{y}.png` layout.
pub fn write_tile(root: &Path, coord: TileCoord, side: u32, color: Rgb) {
    let dir = root.join(coord.z.to_string()).join(coord.x.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    RgbImage::from_pixel(side, side, image::Rgb(color))
        .save(dir.join(format!("{}.png", coord.y)))
        .unwrap();
}
