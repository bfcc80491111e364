//! Generalized Advantage Estimation (GAE-λ).
//!
//! Works on time-major rollout arrays `[T(+1), threads, agents]` where
//! `masks[t + 1] == 0` marks that the episode ended after step `t`.

use ndarray::{Array3, ArrayView3, Axis, Zip};

/// Computes GAE-λ discounted returns.
///
/// # Arguments
///
/// * `rewards` - `[T, threads, agents]` per-step rewards
/// * `values` - `[T + 1, threads, agents]` value estimates, last step bootstraps
/// * `masks` - `[T + 1, threads, agents]` continuation masks
/// * `gamma` - Discount factor
/// * `gae_lambda` - GAE λ parameter (0 = TD(0), 1 = Monte Carlo)
///
/// # Returns
///
/// `[T + 1, threads, agents]` returns where `returns[t] = advantage[t] +
/// values[t]` and the last step equals the bootstrap value.
///
/// # Panics
///
/// Panics if the arrays disagree on shape.
pub fn compute_gae(
    rewards: ArrayView3<'_, f32>,
    values: ArrayView3<'_, f32>,
    masks: ArrayView3<'_, f32>,
    gamma: f64,
    gae_lambda: f64,
) -> Array3<f32> {
    let (t_len, threads, agents) = rewards.dim();
    assert_eq!(values.dim(), (t_len + 1, threads, agents));
    assert_eq!(masks.dim(), (t_len + 1, threads, agents));

    let mut returns = Array3::<f32>::zeros((t_len + 1, threads, agents));
    returns
        .index_axis_mut(Axis(0), t_len)
        .assign(&values.index_axis(Axis(0), t_len));

    let mut gae = ndarray::Array2::<f64>::zeros((threads, agents));
    for t in (0..t_len).rev() {
        Zip::from(&mut gae)
            .and(returns.index_axis_mut(Axis(0), t))
            .and(rewards.index_axis(Axis(0), t))
            .and(values.index_axis(Axis(0), t))
            .and(values.index_axis(Axis(0), t + 1))
            .and(masks.index_axis(Axis(0), t + 1))
            .for_each(|gae, ret, &r, &v, &v_next, &m_next| {
                let (v, m_next) = (v as f64, m_next as f64);
                let delta = r as f64 + gamma * v_next as f64 * m_next - v;
                *gae = delta + gamma * gae_lambda * m_next * *gae;
                *ret = (*gae + v) as f32;
            });
    }

    returns
}
