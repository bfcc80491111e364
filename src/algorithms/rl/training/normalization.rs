//! Running normalization of value targets.
//!
//! [`ValueNorm`] is owned by the trainer. [`PopArt`] is a critic output layer
//! that additionally rescales its weights on every update so that its
//! denormalized outputs are preserved.

use ndarray::{Array3, ArrayView3};
use tch::{nn, nn::Module, Kind, Tensor};

use crate::algorithms::rl::error::TrainingError;

/// Debiased exponential running mean and mean-square of a scalar stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMoments {
    running_mean: f64,
    running_mean_sq: f64,
    debiasing_term: f64,
    beta: f64,
    epsilon: f64,
}

impl Default for RunningMoments {
    fn default() -> Self {
        Self::new(0.99999, 1e-5)
    }
}

impl RunningMoments {
    /// Smallest variance reported by [`mean_var`](Self::mean_var).
    pub const MIN_VAR: f64 = 1e-2;

    pub fn new(beta: f64, epsilon: f64) -> Self {
        Self {
            running_mean: 0.0,
            running_mean_sq: 0.0,
            debiasing_term: 0.0,
            beta,
            epsilon,
        }
    }

    /// Folds one batch into the running statistics.
    pub fn update(&mut self, batch: &Tensor) -> Result<(), TrainingError> {
        let (batch_mean, batch_sq_mean) = tch::no_grad(|| {
            let x = batch.detach().to_kind(Kind::Double);
            let mean = f64::try_from(&x.mean(Kind::Double))?;
            let sq = f64::try_from(&x.square().mean(Kind::Double))?;
            Ok::<_, TrainingError>((mean, sq))
        })?;
        self.push(batch_mean, batch_sq_mean);
        Ok(())
    }

    fn push(&mut self, batch_mean: f64, batch_sq_mean: f64) {
        let w = self.beta;
        self.running_mean = self.running_mean * w + batch_mean * (1.0 - w);
        self.running_mean_sq = self.running_mean_sq * w + batch_sq_mean * (1.0 - w);
        self.debiasing_term = self.debiasing_term * w + (1.0 - w);
    }

    /// Debiased `(mean, variance)`.
    pub fn mean_var(&self) -> (f64, f64) {
        let debias = self.debiasing_term.max(self.epsilon);
        let mean = self.running_mean / debias;
        let mean_sq = self.running_mean_sq / debias;
        let var = (mean_sq - mean * mean).max(Self::MIN_VAR);
        (mean, var)
    }

    pub fn std(&self) -> f64 {
        self.mean_var().1.sqrt()
    }
}

/// Running normalizer of value targets.
pub trait ValueNormalizer {
    /// Updates the statistics with a batch of raw returns.
    fn update(&mut self, batch: &Tensor) -> Result<(), TrainingError>;

    fn moments(&self) -> &RunningMoments;

    fn normalize(&self, x: &Tensor) -> Tensor {
        let (mean, var) = self.moments().mean_var();
        (x - mean) / var.sqrt()
    }

    fn denormalize(&self, x: &Tensor) -> Tensor {
        let (mean, var) = self.moments().mean_var();
        x * var.sqrt() + mean
    }

    /// Denormalizes a time-major rollout array.
    fn denormalize_array(&self, x: ArrayView3<'_, f32>) -> Array3<f32> {
        let (mean, var) = self.moments().mean_var();
        let std = var.sqrt();
        x.mapv(|v| (v as f64 * std + mean) as f32)
    }
}

/// Standalone running normalizer owned by the trainer.
#[derive(Debug, Clone, Default)]
pub struct ValueNorm {
    moments: RunningMoments,
}

impl ValueNorm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueNormalizer for ValueNorm {
    fn update(&mut self, batch: &Tensor) -> Result<(), TrainingError> {
        self.moments.update(batch)
    }

    fn moments(&self) -> &RunningMoments {
        &self.moments
    }
}

/// Scalar value head with PopArt output preservation.
#[derive(Debug)]
pub struct PopArt {
    linear: nn::Linear,
    moments: RunningMoments,
}

impl PopArt {
    pub fn new(path: nn::Path<'_>, input_dim: i64) -> Self {
        Self {
            linear: nn::linear(path, input_dim, 1, Default::default()),
            moments: RunningMoments::default(),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.linear.ws
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.linear.bs.as_ref()
    }
}

impl Module for PopArt {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.linear.forward(xs)
    }
}

impl ValueNormalizer for PopArt {
    fn update(&mut self, batch: &Tensor) -> Result<(), TrainingError> {
        let (old_mean, old_var) = self.moments.mean_var();
        self.moments.update(batch)?;
        let (new_mean, new_var) = self.moments.mean_var();
        let (old_std, new_std) = (old_var.sqrt(), new_var.sqrt());

        tch::no_grad(|| {
            let _ = self.linear.ws.data().f_mul_scalar_(old_std / new_std)?;
            if let Some(bs) = &self.linear.bs {
                let _ = bs
                    .data()
                    .f_mul_scalar_(old_std)?
                    .f_add_scalar_(old_mean - new_mean)?
                    .f_div_scalar_(new_std)?;
            }
            Ok::<_, TrainingError>(())
        })
    }

    fn moments(&self) -> &RunningMoments {
        &self.moments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tch::Device;

    #[test]
    fn fresh_moments_are_centered_with_floor_variance() {
        let m = RunningMoments::default();
        let (mean, var) = m.mean_var();
        assert_eq!(mean, 0.0);
        assert_eq!(var, RunningMoments::MIN_VAR);
    }

    #[test]
    fn single_update_is_debiased() {
        let mut m = RunningMoments::default();
        m.update(&Tensor::from_slice(&[2.0f32, 4.0, 6.0])).unwrap();
        let (mean, var) = m.mean_var();
        assert!((mean - 4.0).abs() < 1e-6);
        // E[x²] = 56/3, mean² = 16
        assert!((var - (56.0 / 3.0 - 16.0)).abs() < 1e-4);
    }

    #[test]
    fn normalize_round_trips() {
        let mut vn = ValueNorm::new();
        vn.update(&Tensor::from_slice(&[10.0f32, 20.0, 30.0])).unwrap();
        let x = Tensor::from_slice(&[5.0f32, 25.0]);
        let back = vn.denormalize(&vn.normalize(&x));
        let diff = f64::try_from(&(back - &x).abs().max()).unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn denormalize_array_matches_tensor() {
        let mut vn = ValueNorm::new();
        vn.update(&Tensor::from_slice(&[1.0f32, 3.0])).unwrap();
        let a = Array3::from_elem((1, 1, 1), 0.5f32);
        let out = vn.denormalize_array(a.view());
        let t = f64::try_from(&vn.denormalize(&Tensor::from_slice(&[0.5f32])).sum(Kind::Float))
            .unwrap();
        assert!((out[[0, 0, 0]] as f64 - t).abs() < 1e-5);
    }

    #[test]
    fn popart_update_preserves_denormalized_outputs() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = PopArt::new(vs.root() / "v_out", 3);
        let x = Tensor::randn([4, 3], (Kind::Float, Device::Cpu));

        head.update(&Tensor::from_slice(&[1.0f32, 2.0, 3.0])).unwrap();
        let before = tch::no_grad(|| head.denormalize(&head.forward(&x)));
        head.update(&Tensor::from_slice(&[50.0f32, 80.0, 120.0])).unwrap();
        let after = tch::no_grad(|| head.denormalize(&head.forward(&x)));

        let diff = f64::try_from(&(after - before).abs().max()).unwrap();
        assert!(diff < 1e-2, "outputs drifted by {diff}");
    }
}
