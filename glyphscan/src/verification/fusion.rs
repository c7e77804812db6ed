//! Fusion of a group judgment with per-tile certainty.

use serde::{Deserialize, Serialize};

use super::response::Judgment;
use crate::tile::TileCoord;

/// Weight given to tiles at or below the minimum confidence.
pub const MIN_LOCAL_WEIGHT: f64 = 0.3;
pub const MAX_LOCAL_WEIGHT: f64 = 1.0;

/// Final verification result of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileVerification {
    #[serde(flatten)]
    pub coord: TileCoord,
    pub prob: f64,
    pub label: String,
    pub description: String,
}

/// Maps a tile's local certainty linearly from `[min_confidence, full_confidence]`
/// onto `[0.3, 1.0]`, clamping outside the range.
pub fn local_weight(certainty: f64, min_confidence: f64, full_confidence: f64) -> f64 {
    if certainty <= min_confidence {
        return MIN_LOCAL_WEIGHT;
    }
    if certainty >= full_confidence {
        return MAX_LOCAL_WEIGHT;
    }
    let t = (certainty - min_confidence) / (full_confidence - min_confidence);
    MIN_LOCAL_WEIGHT + t * (MAX_LOCAL_WEIGHT - MIN_LOCAL_WEIGHT)
}

/// Produces one record per tile of a verified group.
///
/// `tiles` pairs each tile with its local certainty.
pub fn fuse(
    judgment: &Judgment,
    tiles: impl IntoIterator<Item = (TileCoord, f32)>,
    min_confidence: f32,
    full_confidence: f32,
) -> Vec<TileVerification> {
    let group = judgment.p_glyph;
    let label = judgment.structure.trim();
    let description = judgment.description.trim();

    tiles
        .into_iter()
        .map(|(coord, certainty)| {
            let weight = local_weight(
                certainty as f64,
                min_confidence as f64,
                full_confidence as f64,
            );
            TileVerification {
                coord,
                prob: group * weight,
                label: label.to_string(),
                description: format!(
                    "[Group Certainty: {group:.2} | Local Weight: {weight:.2}] {description}"
                ),
            }
        })
        .collect()
}
