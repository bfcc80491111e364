//! Clipped value regression loss.

use tch::{Kind, Tensor};

use super::normalization::ValueNormalizer;
use crate::algorithms::rl::config::{TrainerSettings, ValueLossKind};
use crate::algorithms::rl::error::TrainingError;

/// Huber loss, quadratic for `|e| ≤ delta` and linear beyond on both sides.
pub fn huber_loss(e: &Tensor, delta: f64) -> Tensor {
    let abs = e.abs();
    let quadratic = abs.le(delta).to_kind(Kind::Float);
    let linear = abs.gt(delta).to_kind(Kind::Float);
    &quadratic * e.square() / 2.0 + &linear * ((&abs - delta / 2.0) * delta)
}

pub fn mse_loss(e: &Tensor) -> Tensor {
    e.square() / 2.0
}

/// Averages `loss` over entries whose mask is 1.
///
/// The denominator is clamped to 1, so a batch without active entries yields
/// zero.
pub fn masked_mean(loss: &Tensor, active_masks: &Tensor) -> Tensor {
    (loss * active_masks).sum(Kind::Float) / active_masks.sum(Kind::Float).clamp_min(1.0)
}

/// Value loss with the clipping, robust-loss and masking options of a
/// [`TrainerSettings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueLossCalculator {
    pub clip_param: f64,
    pub kind: ValueLossKind,
    pub use_clipped_value_loss: bool,
    pub use_value_active_masks: bool,
}

impl ValueLossCalculator {
    pub fn from_settings(settings: &TrainerSettings) -> Self {
        Self {
            clip_param: settings.clip_param,
            kind: settings.value_loss,
            use_clipped_value_loss: settings.use_clipped_value_loss,
            use_value_active_masks: settings.use_value_active_masks,
        }
    }

    fn elementwise(&self, error: &Tensor) -> Tensor {
        match self.kind {
            ValueLossKind::Huber { delta } => huber_loss(error, delta),
            ValueLossKind::Mse => mse_loss(error),
        }
    }

    /// Scalar value loss.
    ///
    /// When `normalizer` is given it is first updated with the raw `returns`
    /// and both errors are measured against the normalized returns. All four
    /// tensors share shape `[B, 1]`.
    pub fn compute(
        &self,
        values: &Tensor,
        value_preds: &Tensor,
        returns: &Tensor,
        active_masks: &Tensor,
        normalizer: Option<&mut dyn ValueNormalizer>,
    ) -> Result<Tensor, TrainingError> {
        let value_pred_clipped =
            value_preds + (values - value_preds).clamp(-self.clip_param, self.clip_param);

        let targets = match normalizer {
            Some(normalizer) => {
                normalizer.update(returns)?;
                normalizer.normalize(returns)
            }
            None => returns.shallow_clone(),
        };
        let error_clipped = &targets - &value_pred_clipped;
        let error_original = &targets - values;

        let loss_original = self.elementwise(&error_original);
        let value_loss = if self.use_clipped_value_loss {
            loss_original.max_other(&self.elementwise(&error_clipped))
        } else {
            loss_original
        };

        Ok(if self.use_value_active_masks {
            masked_mean(&value_loss, active_masks)
        } else {
            value_loss.mean(Kind::Float)
        })
    }
}
