//! Configuration for MAPPO training.
//!
//! [`MappoConfig`] is the flat option surface; [`MappoConfig::resolve`]
//! validates it once and produces [`TrainerSettings`], where the flag
//! combinations are collapsed into tagged enums used on the update path.

use tracing::warn;

use super::error::ConfigError;

/// Training hyperparameters for MAPPO.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MappoConfig {
    /// PPO clip parameter ε, shared by the surrogate and the value clip.
    pub clip_param: f64,
    /// Number of passes over the rollout per `train` call.
    pub ppo_epoch: usize,
    /// Minibatches drawn per epoch.
    pub num_mini_batch: usize,
    /// Chunk length for recurrent minibatches.
    pub data_chunk_length: usize,
    pub value_loss_coef: f64,
    pub entropy_coef: f64,
    pub max_grad_norm: f64,
    pub huber_delta: f64,

    pub use_recurrent_policy: bool,
    pub use_naive_recurrent_policy: bool,
    pub use_max_grad_norm: bool,
    pub use_clipped_value_loss: bool,
    pub use_huber_loss: bool,
    pub use_popart: bool,
    pub use_valuenorm: bool,
    pub use_value_active_masks: bool,
    pub use_policy_active_masks: bool,

    /// Discount factor γ.
    pub gamma: f64,
    /// GAE λ parameter.
    pub gae_lambda: f64,

    /// Actor learning rate.
    pub lr: f64,
    /// Critic learning rate.
    pub critic_lr: f64,
    /// Adam ε.
    pub opti_eps: f64,
    pub weight_decay: f64,

    /// Enables dynamic loss scaling (only takes effect on CUDA devices).
    pub mixed_precision: bool,
    /// Seed for minibatch shuffling.
    pub seed: u64,
}

impl Default for MappoConfig {
    fn default() -> Self {
        Self {
            clip_param: 0.2,
            ppo_epoch: 15,
            num_mini_batch: 1,
            data_chunk_length: 10,
            value_loss_coef: 1.0,
            entropy_coef: 0.01,
            max_grad_norm: 10.0,
            huber_delta: 10.0,
            use_recurrent_policy: true,
            use_naive_recurrent_policy: false,
            use_max_grad_norm: true,
            use_clipped_value_loss: true,
            use_huber_loss: true,
            use_popart: false,
            use_valuenorm: true,
            use_value_active_masks: true,
            use_policy_active_masks: true,
            gamma: 0.99,
            gae_lambda: 0.95,
            lr: 5e-4,
            critic_lr: 5e-4,
            opti_eps: 1e-5,
            weight_decay: 0.0,
            mixed_precision: false,
            seed: 1,
        }
    }
}

/// How minibatches are drawn from the rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiniBatchMode {
    /// Sequences split into chunks of `chunk_length` steps.
    Recurrent { chunk_length: usize },
    /// Whole (thread, agent) sequences.
    NaiveRecurrent,
    /// Independent shuffled timesteps.
    FeedForward,
}

/// Elementwise value regression loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueLossKind {
    Huber { delta: f64 },
    Mse,
}

/// Which running normalizer, if any, is applied to return targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMode {
    Disabled,
    /// Normalizer owned by the trainer.
    ValueNorm,
    /// Normalizer living in the critic's output layer.
    PopArt,
}

impl NormalizationMode {
    pub fn is_active(&self) -> bool {
        !matches!(self, NormalizationMode::Disabled)
    }
}

/// Validated settings consumed by the trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerSettings {
    pub clip_param: f64,
    pub ppo_epoch: usize,
    pub num_mini_batch: usize,
    pub mini_batch_mode: MiniBatchMode,
    pub value_loss: ValueLossKind,
    pub normalization: NormalizationMode,
    pub use_clipped_value_loss: bool,
    /// `Some(max_norm)` clips the global gradient norm; `None` only reports it.
    pub max_grad_norm: Option<f64>,
    pub value_loss_coef: f64,
    pub entropy_coef: f64,
    pub use_value_active_masks: bool,
    pub use_policy_active_masks: bool,
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be finite and positive, got {value}"),
        })
    }
}

fn require_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: "must be at least 1".into(),
        })
    }
}

impl MappoConfig {
    /// Validates the option set and resolves it into [`TrainerSettings`].
    ///
    /// Fails with [`ConfigError::ConflictingNormalizers`] when both PopArt and
    /// ValueNorm are requested. When both recurrent flags are set, chunked
    /// recurrent minibatches take precedence.
    pub fn resolve(&self) -> Result<TrainerSettings, ConfigError> {
        if self.use_popart && self.use_valuenorm {
            return Err(ConfigError::ConflictingNormalizers);
        }

        require_nonzero("ppo_epoch", self.ppo_epoch)?;
        require_nonzero("num_mini_batch", self.num_mini_batch)?;
        require_positive("clip_param", self.clip_param)?;
        require_positive("lr", self.lr)?;
        require_positive("critic_lr", self.critic_lr)?;
        if self.use_recurrent_policy {
            require_nonzero("data_chunk_length", self.data_chunk_length)?;
        }
        if self.use_huber_loss {
            require_positive("huber_delta", self.huber_delta)?;
        }
        if self.use_max_grad_norm {
            require_positive("max_grad_norm", self.max_grad_norm)?;
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ConfigError::InvalidValue {
                field: "gamma",
                reason: format!("must lie in [0, 1], got {}", self.gamma),
            });
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(ConfigError::InvalidValue {
                field: "gae_lambda",
                reason: format!("must lie in [0, 1], got {}", self.gae_lambda),
            });
        }

        let mini_batch_mode = match (self.use_recurrent_policy, self.use_naive_recurrent_policy) {
            (true, naive) => {
                if naive {
                    warn!("both recurrent modes requested, using chunked recurrent minibatches");
                }
                MiniBatchMode::Recurrent {
                    chunk_length: self.data_chunk_length,
                }
            }
            (false, true) => MiniBatchMode::NaiveRecurrent,
            (false, false) => MiniBatchMode::FeedForward,
        };

        let value_loss = if self.use_huber_loss {
            ValueLossKind::Huber {
                delta: self.huber_delta,
            }
        } else {
            ValueLossKind::Mse
        };

        let normalization = if self.use_popart {
            NormalizationMode::PopArt
        } else if self.use_valuenorm {
            NormalizationMode::ValueNorm
        } else {
            NormalizationMode::Disabled
        };

        Ok(TrainerSettings {
            clip_param: self.clip_param,
            ppo_epoch: self.ppo_epoch,
            num_mini_batch: self.num_mini_batch,
            mini_batch_mode,
            value_loss,
            normalization,
            use_clipped_value_loss: self.use_clipped_value_loss,
            max_grad_norm: self.use_max_grad_norm.then_some(self.max_grad_norm),
            value_loss_coef: self.value_loss_coef,
            entropy_coef: self.entropy_coef,
            use_value_active_masks: self.use_value_active_masks,
            use_policy_active_masks: self.use_policy_active_masks,
        })
    }

    /// Number of PPO updates per `train` call.
    pub fn updates_per_train(&self) -> usize {
        self.ppo_epoch * self.num_mini_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves() {
        let settings = MappoConfig::default().resolve().unwrap();
        assert_eq!(
            settings.mini_batch_mode,
            MiniBatchMode::Recurrent { chunk_length: 10 }
        );
        assert_eq!(settings.value_loss, ValueLossKind::Huber { delta: 10.0 });
        assert_eq!(settings.normalization, NormalizationMode::ValueNorm);
        assert_eq!(settings.max_grad_norm, Some(10.0));
    }

    #[test]
    fn popart_and_valuenorm_conflict() {
        let cfg = MappoConfig {
            use_popart: true,
            use_valuenorm: true,
            ..MappoConfig::default()
        };
        assert_eq!(cfg.resolve(), Err(ConfigError::ConflictingNormalizers));
    }

    #[test]
    fn recurrent_takes_precedence_over_naive() {
        let cfg = MappoConfig {
            use_recurrent_policy: true,
            use_naive_recurrent_policy: true,
            data_chunk_length: 4,
            ..MappoConfig::default()
        };
        assert_eq!(
            cfg.resolve().unwrap().mini_batch_mode,
            MiniBatchMode::Recurrent { chunk_length: 4 }
        );
    }

    #[test]
    fn flags_select_feed_forward_and_mse() {
        let cfg = MappoConfig {
            use_recurrent_policy: false,
            use_huber_loss: false,
            use_max_grad_norm: false,
            use_valuenorm: false,
            ..MappoConfig::default()
        };
        let settings = cfg.resolve().unwrap();
        assert_eq!(settings.mini_batch_mode, MiniBatchMode::FeedForward);
        assert_eq!(settings.value_loss, ValueLossKind::Mse);
        assert_eq!(settings.max_grad_norm, None);
        assert!(!settings.normalization.is_active());
    }

    #[test]
    fn naive_mode_and_popart() {
        let cfg = MappoConfig {
            use_recurrent_policy: false,
            use_naive_recurrent_policy: true,
            use_valuenorm: false,
            use_popart: true,
            ..MappoConfig::default()
        };
        let settings = cfg.resolve().unwrap();
        assert_eq!(settings.mini_batch_mode, MiniBatchMode::NaiveRecurrent);
        assert_eq!(settings.normalization, NormalizationMode::PopArt);
    }

    #[test]
    fn rejects_zero_epochs() {
        let cfg = MappoConfig {
            ppo_epoch: 0,
            ..MappoConfig::default()
        };
        assert!(matches!(
            cfg.resolve(),
            Err(ConfigError::InvalidValue {
                field: "ppo_epoch",
                ..
            })
        ));
    }

    #[test]
    fn zero_chunk_length_only_matters_when_recurrent() {
        let cfg = MappoConfig {
            data_chunk_length: 0,
            ..MappoConfig::default()
        };
        assert!(cfg.resolve().is_err());

        let cfg = MappoConfig {
            use_recurrent_policy: false,
            ..cfg
        };
        assert!(cfg.resolve().is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let cfg = MappoConfig {
            num_mini_batch: 4,
            use_huber_loss: false,
            ..MappoConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MappoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);

        let partial: MappoConfig = serde_json::from_str(r#"{"ppo_epoch": 3}"#).unwrap();
        assert_eq!(partial.ppo_epoch, 3);
        assert_eq!(partial.clip_param, 0.2);
    }
}
