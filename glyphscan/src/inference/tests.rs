use std::sync::Mutex;

use common::Buffer2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::config::{InferenceDefaults, InferenceOverrides};
use crate::testing::{ConstantModel, FailingModel, IdentityModel, MisshapenModel};

fn params(patch: usize, stride: usize, tta: bool, batch: usize) -> InferenceParams {
    let defaults = InferenceDefaults {
        batch_size: batch,
        ..Default::default()
    };
    InferenceParams::resolve(
        &defaults,
        &InferenceOverrides {
            patch_size: Some(patch),
            stride: Some(stride),
            use_tta: Some(tta),
        },
    )
    .unwrap()
}

fn random_canvas(width: usize, height: usize, seed: u64) -> Buffer2<Rgb> {
    let mut rng = StdRng::seed_from_u64(seed);
    Buffer2::from_fn(width, height, |_, _| [rng.random(), rng.random(), rng.random()])
}

/// Records the batch sizes it is called with.
struct RecordingModel {
    batches: Mutex<Vec<usize>>,
}

impl SegmentationModel for RecordingModel {
    fn scale_factor(&self) -> usize {
        2
    }

    fn forward(&self, batch: &PatchBatch) -> anyhow::Result<LogitBatch> {
        self.batches.lock().unwrap().push(batch.len());
        let side = batch.side() / 2;
        LogitBatch::new(batch.len(), side, side, vec![0.0; batch.len() * side * side])
    }
}

#[test]
fn origins_cover_canvas_on_stride_grid() {
    assert_eq!(
        patch_origins(10, 6, 4),
        vec![(0, 0), (4, 0), (8, 0), (0, 4), (4, 4), (8, 4)]
    );
    assert_eq!(patch_origins(3, 3, 8), vec![(0, 0)]);
}

#[test]
fn mosaic_is_downscaled_by_model_factor() {
    let canvas = random_canvas(64, 32, 1);
    let model = ConstantModel {
        logit: 0.9,
        scale: 4,
    };
    let mosaic = infer(&canvas, &model, &params(32, 16, false, 8)).unwrap();

    assert_eq!((mosaic.logits.width(), mosaic.logits.height()), (16, 8));
    assert_eq!(mosaic.scale, 4);
}

#[test]
fn coverage_is_positive_when_stride_within_patch() {
    let canvas = random_canvas(96, 64, 2);
    let model = ConstantModel {
        logit: 0.0,
        scale: 2,
    };
    for (patch, stride) in [(32, 32), (32, 16), (32, 10), (16, 16)] {
        let mosaic = infer(&canvas, &model, &params(patch, stride, false, 3)).unwrap();
        assert!(
            mosaic.coverage.iter().all(|&w| w > 0.0),
            "patch {patch} stride {stride}"
        );
    }
}

#[test]
fn constant_logits_blend_to_the_same_constant() {
    let canvas = random_canvas(80, 48, 3);
    let model = ConstantModel {
        logit: 0.9,
        scale: 4,
    };
    let mosaic = infer(&canvas, &model, &params(32, 8, false, 5)).unwrap();
    // the epsilon in the normalization only shows where coverage is tiny
    assert!(mosaic.logits.iter().all(|&v| (v - 0.9).abs() < 1e-2));
    assert!((mosaic.logits[(10, 6)] - 0.9).abs() < 1e-5);
}

#[test]
fn blended_output_stays_within_patch_outputs() {
    let canvas = random_canvas(64, 64, 4);
    let model = IdentityModel { scale: 2 };
    let mosaic = infer(&canvas, &model, &params(32, 12, false, 4)).unwrap();

    // every patch output is a block mean of the canvas, so it lies within the
    // canvas channel range; a weighted average of those cannot leave it
    let (lo, hi) = canvas.iter().flatten().fold((1.0f32, 0.0f32), |(lo, hi), &v| {
        let v = v as f32 / 255.0;
        (lo.min(v), hi.max(v))
    });
    assert!(
        mosaic
            .logits
            .iter()
            .all(|&v| v >= lo - 1e-2 && v <= hi + 1e-5)
    );
}

#[test]
fn tta_is_a_no_op_for_mirror_equivariant_model_on_symmetric_canvas() {
    let half = random_canvas(24, 40, 5);
    let canvas = Buffer2::from_fn(48, 40, |x, y| {
        if x < 24 { half[(x, y)] } else { half[(47 - x, y)] }
    });
    assert_eq!(canvas, canvas.flipped_horizontal());

    let model = IdentityModel { scale: 4 };
    let plain = infer(&canvas, &model, &params(16, 8, false, 4)).unwrap();
    let tta = infer(&canvas, &model, &params(16, 8, true, 4)).unwrap();

    for (a, b) in plain.logits.iter().zip(tta.logits.iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn canvas_smaller_than_patch_uses_one_padded_patch() {
    let canvas = Buffer2::new_filled(8, 8, [255u8, 255, 255]);
    let model = RecordingModel {
        batches: Mutex::new(Vec::new()),
    };
    let mosaic = infer(&canvas, &model, &params(16, 8, false, 8)).unwrap();

    assert_eq!(*model.batches.lock().unwrap(), vec![1]);
    assert_eq!((mosaic.logits.width(), mosaic.logits.height()), (4, 4));
    assert!(mosaic.coverage.iter().all(|&w| w > 0.0));
}

#[test]
fn padding_is_zero_beyond_canvas_edge() {
    // white canvas: the padded half of the patch must read as black
    let canvas = Buffer2::new_filled(8, 16, [255u8, 255, 255]);
    let model = IdentityModel { scale: 1 };
    let batch = assemble_batch(&canvas, &[(0, 0)], 16);

    let red = &batch.patch(0)[..16 * 16];
    assert_eq!(red[0], 1.0);
    assert_eq!(red[7], 1.0);
    assert_eq!(red[8], 0.0);
    assert_eq!(red[15 * 16 + 15], 0.0);

    // and the cropped output only covers the canvas
    let mosaic = infer(&canvas, &model, &params(16, 16, false, 1)).unwrap();
    assert!(mosaic.logits.iter().all(|&v| (v - 1.0).abs() < 1e-2));
}

#[test]
fn origins_are_batched_in_order() {
    let canvas = random_canvas(40, 20, 6);
    let model = RecordingModel {
        batches: Mutex::new(Vec::new()),
    };
    // 5 x 3 origins = 15 patches
    infer(&canvas, &model, &params(8, 8, false, 4)).unwrap();
    assert_eq!(*model.batches.lock().unwrap(), vec![4, 4, 4, 3]);

    model.batches.lock().unwrap().clear();
    infer(&canvas, &model, &params(8, 8, true, 4)).unwrap();
    assert_eq!(model.batches.lock().unwrap().len(), 8);
}

#[test]
fn forward_error_fails_the_canvas() {
    let canvas = random_canvas(16, 16, 7);
    let err = infer(&canvas, &FailingModel { scale: 2 }, &params(8, 8, false, 2)).unwrap_err();
    assert!(matches!(err, Error::Forward(_)));
    assert!(err.to_string().contains("device lost"));
}

#[test]
fn wrong_output_shape_is_rejected() {
    let canvas = random_canvas(16, 16, 8);
    let err = infer(&canvas, &MisshapenModel, &params(8, 8, false, 2)).unwrap_err();
    assert!(matches!(
        err,
        Error::ModelOutputShape {
            expected: [2, 8, 8],
            actual: [2, 1, 1]
        }
    ));
}

#[test]
fn stride_must_match_model_scale() {
    let canvas = random_canvas(16, 16, 9);
    let model = ConstantModel {
        logit: 0.0,
        scale: 4,
    };
    let err = infer(&canvas, &model, &params(16, 6, false, 2)).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn zero_batch_or_stride_is_rejected_before_running() {
    let canvas = random_canvas(8, 8, 10);
    let model = ConstantModel {
        logit: 0.0,
        scale: 2,
    };
    let valid = params(8, 4, false, 2);

    for broken in [
        InferenceParams { batch_size: 0, ..valid },
        InferenceParams { stride: 0, ..valid },
        InferenceParams { patch_size: 0, ..valid },
    ] {
        let err = infer(&canvas, &model, &broken).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{broken:?}");
    }
}

#[test]
fn tile_probabilities_upsample_and_squash() {
    let group = TileGroup::new(vec![TileCoord::new(10, 20, 17), TileCoord::new(11, 20, 17)]);
    let logits = Buffer2::from_fn(4, 2, |x, _| if x < 2 { 0.0 } else { 0.9 });
    let mosaic = Mosaic {
        coverage: Buffer2::new_filled(4, 2, 1.0),
        logits,
        scale: 4,
    };

    let predictions = tile_probabilities(&mosaic, &group, 8);
    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[0].coord, TileCoord::new(10, 20, 17));
    assert_eq!((predictions[0].mask.width(), predictions[0].mask.height()), (8, 8));
    assert!(predictions[0].mask.iter().all(|&p| p == 0.5));
    let expected = sigmoid(0.9);
    assert!(predictions[1].mask.iter().all(|&p| (p - expected).abs() < 1e-6));
    assert!((predictions[1].peak() - expected).abs() < 1e-6);
}
