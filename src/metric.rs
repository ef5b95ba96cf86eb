//! Scoring functions the optimizer maximizes.

use crate::example::{Example, Prediction};

/// Scores one prediction against its gold example, in `[0, 1]`.
pub type Metric = fn(&Example, &Prediction) -> f64;

/// 1.0 when the predicted label is the gold label, else 0.0.
pub fn exact_match(gold: &Example, prediction: &Prediction) -> f64 {
    if gold.label == prediction.label {
        1.0
    } else {
        0.0
    }
}

/// Mean of per-example scores; an empty evaluation scores 0.
pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}
