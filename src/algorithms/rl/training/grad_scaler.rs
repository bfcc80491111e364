//! Dynamic loss scaling for mixed-precision training.
//!
//! One [`GradScaler`] serves both the actor and the critic optimizer. Each
//! minibatch opens a [`ScaledStep`] with [`GradScaler::begin`]; per optimizer
//! the calls go `backward` → `unscale_and_clip` → `step` (or `skip`), and
//! [`ScaledStep::end`] performs the single scale update for the minibatch.

use tch::{nn, Tensor};
use tracing::{debug, warn};

use crate::algorithms::rl::error::TrainingError;

/// Global L2 norm of the gradients of `vars`. Variables without a gradient
/// are skipped.
pub fn grad_norm(vars: &[Tensor]) -> Result<f64, TrainingError> {
    tch::no_grad(|| {
        let mut total = 0.0f64;
        for var in vars {
            let grad = var.grad();
            if grad.defined() {
                let n = f64::try_from(&grad.norm())?;
                total += n * n;
            }
        }
        Ok(total.sqrt())
    })
}

/// Rescales gradients so their global norm is at most `max_norm` and returns
/// the norm measured before clipping.
pub fn clip_grad_norm(vars: &[Tensor], max_norm: f64) -> Result<f64, TrainingError> {
    let total = grad_norm(vars)?;
    let coef = max_norm / (total + 1e-6);
    if total.is_finite() && coef < 1.0 {
        scale_grads(vars, coef)?;
    }
    Ok(total)
}

fn scale_grads(vars: &[Tensor], factor: f64) -> Result<(), TrainingError> {
    tch::no_grad(|| {
        for var in vars {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.f_mul_scalar_(factor)?;
            }
        }
        Ok(())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Backward,
    Unscaled { found_inf: bool },
}

/// Loss scaler with PyTorch `GradScaler` dynamics.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u32,
    growth_tracker: u32,
}

impl GradScaler {
    pub const INIT_SCALE: f64 = 65536.0;

    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: Self::INIT_SCALE,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    /// A scaler that leaves losses and gradients untouched.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn with_growth_interval(mut self, interval: u32) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current loss scale (1 when disabled).
    pub fn scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Opens the scaled step of one minibatch.
    pub fn begin(&mut self) -> ScaledStep<'_> {
        ScaledStep {
            scaler: self,
            stage: Stage::Idle,
            found_inf: false,
        }
    }

    fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            warn!(scale = self.scale, "non-finite gradients, backing off loss scale");
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
                debug!(scale = self.scale, "growing loss scale");
            }
        }
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Ordered scaling protocol for one minibatch.
///
/// Consuming the step through [`end`](Self::end) is the only way to update
/// the scale, so it happens exactly once per minibatch.
#[derive(Debug)]
pub struct ScaledStep<'a> {
    scaler: &'a mut GradScaler,
    stage: Stage,
    found_inf: bool,
}

impl ScaledStep<'_> {
    /// Back-propagates `loss` multiplied by the current scale.
    pub fn backward(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        if self.stage != Stage::Idle {
            return Err(TrainingError::ScalerOrder(
                "backward called while a previous optimizer stage is pending",
            ));
        }
        if self.scaler.enabled {
            (loss * self.scaler.scale).backward();
        } else {
            loss.backward();
        }
        self.stage = Stage::Backward;
        Ok(())
    }

    /// Unscales the gradients of `vars`, optionally clips them, and returns
    /// their pre-clip global norm.
    ///
    /// Also valid without a preceding [`backward`](Self::backward), in which
    /// case it only measures the (zeroed) gradients.
    pub fn unscale_and_clip(
        &mut self,
        vars: &[Tensor],
        max_norm: Option<f64>,
    ) -> Result<f64, TrainingError> {
        if matches!(self.stage, Stage::Unscaled { .. }) {
            return Err(TrainingError::ScalerOrder(
                "unscale_and_clip called twice for the same optimizer",
            ));
        }
        if self.scaler.enabled {
            scale_grads(vars, 1.0 / self.scaler.scale)?;
        }
        let norm = match max_norm {
            Some(max_norm) => clip_grad_norm(vars, max_norm)?,
            None => grad_norm(vars)?,
        };
        let found_inf = self.scaler.enabled && !norm.is_finite();
        self.found_inf |= found_inf;
        self.stage = Stage::Unscaled { found_inf };
        Ok(norm)
    }

    /// Steps `optimizer` unless its unscaled gradients were non-finite.
    /// Returns whether the step was taken.
    pub fn step(&mut self, optimizer: &mut nn::Optimizer) -> Result<bool, TrainingError> {
        let Stage::Unscaled { found_inf } = self.stage else {
            return Err(TrainingError::ScalerOrder(
                "step called before unscale_and_clip",
            ));
        };
        self.stage = Stage::Idle;
        if found_inf {
            warn!(scale = self.scaler.scale, "skipping optimizer step on non-finite gradients");
            return Ok(false);
        }
        optimizer.step();
        Ok(true)
    }

    /// Leaves the current optimizer untouched for this minibatch.
    pub fn skip(&mut self) {
        self.stage = Stage::Idle;
    }

    /// Whether any unscale in this step saw non-finite gradients.
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }

    /// Closes the minibatch and updates the scale once.
    pub fn end(self) -> Result<(), TrainingError> {
        if self.stage != Stage::Idle {
            return Err(TrainingError::ScalerOrder(
                "end called with an optimizer stage still pending",
            ));
        }
        self.scaler.update(self.found_inf);
        Ok(())
    }
}
