//! Advantage standardization over active agents.

use ndarray::{Array, ArrayView, Dimension, Zip};
use tracing::warn;

/// Added to the standard deviation before dividing.
pub const ADVANTAGE_EPS: f64 = 1e-5;

/// Standardizes `advantages` with the mean and population standard deviation
/// of the entries whose `active_masks` value is non-zero.
///
/// Every entry, active or not, is shifted and scaled by the same statistics.
/// If no entry is active the statistics are taken over all entries.
///
/// # Panics
///
/// Panics if the two arrays do not have the same shape.
pub fn standardize_advantages<D: Dimension>(
    advantages: ArrayView<'_, f32, D>,
    active_masks: ArrayView<'_, f32, D>,
) -> Array<f32, D> {
    assert_eq!(
        advantages.shape(),
        active_masks.shape(),
        "advantages and active masks must share a shape"
    );

    let (mut sum, mut count) = (0.0f64, 0usize);
    Zip::from(&advantages).and(&active_masks).for_each(|&a, &m| {
        if m != 0.0 {
            sum += a as f64;
            count += 1;
        }
    });

    let use_all = count == 0;
    if use_all {
        if !advantages.is_empty() {
            warn!("no active entries in rollout, standardizing advantages over all entries");
        }
        sum = advantages.iter().map(|&a| a as f64).sum();
        count = advantages.len();
    }
    if count == 0 {
        return advantages.to_owned();
    }

    let mean = sum / count as f64;
    let mut sq = 0.0f64;
    Zip::from(&advantages).and(&active_masks).for_each(|&a, &m| {
        if use_all || m != 0.0 {
            let d = a as f64 - mean;
            sq += d * d;
        }
    });
    let std = (sq / count as f64).sqrt();
    let denom = std + ADVANTAGE_EPS;

    advantages.mapv(|a| ((a as f64 - mean) / denom) as f32)
}
