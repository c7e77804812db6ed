//! Strict schema for verifier payloads.

use serde::Deserialize;
use thiserror::Error;

/// A verifier's judgment of one candidate group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Judgment {
    /// Probability that the highlighted shape is a geoglyph.
    pub p_glyph: f64,
    /// Category of the shape, empty when it is a geoglyph.
    pub structure: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum RejectedPayload {
    #[error("payload is not a valid judgment object: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("p_glyph {0} is outside [0, 1]")]
    ProbabilityOutOfRange(f64),
}

/// Parses `payload` as a [`Judgment`].
///
/// The payload must be exactly one JSON object with the three judgment keys,
/// `p_glyph` being a JSON number. No repair is attempted: surrounding prose,
/// code fences, string-typed numbers and extra keys are all rejected.
pub fn parse_judgment(payload: &str) -> Result<Judgment, RejectedPayload> {
    let judgment: Judgment = serde_json::from_str(payload)?;
    if !(0.0..=1.0).contains(&judgment.p_glyph) {
        return Err(RejectedPayload::ProbabilityOutOfRange(judgment.p_glyph));
    }
    Ok(judgment)
}
