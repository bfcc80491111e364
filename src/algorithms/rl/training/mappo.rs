//! MAPPO (Multi-Agent PPO) trainer.
//!
//! Implements Centralized Training, Decentralized Execution (CTDE):
//! - The actor scores each agent's action from its node of the UE-AP graph.
//! - The critic sees the pooled graph and is trained on clipped value loss.
//!
//! Both optimizers share one [`GradScaler`]; every minibatch runs one
//! [`ScaledStep`](super::grad_scaler::ScaledStep) so the scale is updated
//! exactly once after the actor and critic steps.

use std::time::{Duration, Instant};

use ndarray::s;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{debug, info, warn};

use super::buffer::SampleSource;
use super::grad_scaler::GradScaler;
use super::normalization::{ValueNorm, ValueNormalizer};
use super::value_loss::{masked_mean, ValueLossCalculator};
use crate::algorithms::rl::advantages::standardize_advantages;
use crate::algorithms::rl::config::{MappoConfig, MiniBatchMode, NormalizationMode, TrainerSettings};
use crate::algorithms::rl::error::TrainingError;
use crate::algorithms::rl::metrics::{TrainInfo, UpdateStats};
use crate::algorithms::rl::policy::GraphPolicy;
use crate::algorithms::rl::types::MiniBatchSample;

/// Callback receiving the statistics of every minibatch update.
pub type UpdateHook = Box<dyn FnMut(&UpdateStats)>;

/// Result of one [`MappoTrainer::ppo_update`].
#[derive(Debug)]
pub struct PpoUpdate {
    pub stats: UpdateStats,
    /// `[B, 1]` importance weights `exp(new_log_prob - old_log_prob)`.
    pub imp_weights: Tensor,
    pub actor_backward_time: Duration,
    pub critic_backward_time: Duration,
}

/// Selects the normalizer the configuration asks for.
fn active_normalizer<'a, P: GraphPolicy>(
    mode: NormalizationMode,
    value_norm: &'a mut Option<ValueNorm>,
    policy: &'a mut P,
) -> Option<&'a mut dyn ValueNormalizer> {
    match mode {
        NormalizationMode::Disabled => None,
        NormalizationMode::ValueNorm => value_norm
            .as_mut()
            .map(|n| n as &mut dyn ValueNormalizer),
        NormalizationMode::PopArt => policy
            .popart_mut()
            .map(|p| p as &mut dyn ValueNormalizer),
    }
}

/// Negated PPO clipped surrogate.
///
/// `min(r·A, clip(r, 1 - clip_param, 1 + clip_param)·A)` is summed over the
/// last axis, then averaged over active samples when `masked` is set or over
/// all samples otherwise.
pub fn clipped_surrogate_loss(
    imp_weights: &Tensor,
    advantages: &Tensor,
    active_masks: &Tensor,
    clip_param: f64,
    masked: bool,
) -> Tensor {
    let surr1 = imp_weights * advantages;
    let surr2 = imp_weights.clamp(1.0 - clip_param, 1.0 + clip_param) * advantages;
    let objective = surr1
        .min_other(&surr2)
        .sum_dim_intlist([-1i64].as_slice(), true, Kind::Float);
    if masked {
        -masked_mean(&objective, active_masks)
    } else {
        -objective.mean(Kind::Float)
    }
}

/// Rejects empty minibatches and graph batches that do not line up with
/// the per-sample tensors.
fn check_sample(sample: &MiniBatchSample) -> Result<(), TrainingError> {
    if sample.is_empty() {
        return Err(TrainingError::InsufficientData {
            what: "minibatch samples",
            needed: 1,
            available: 0,
        });
    }
    let graphs = sample.graphs.batch_size();
    if graphs != sample.len() {
        return Err(TrainingError::ShapeMismatch {
            what: "graph batch",
            expected: vec![sample.len() as usize],
            found: vec![graphs as usize],
        });
    }
    Ok(())
}

fn scalar(t: &Tensor) -> Result<f64, TrainingError> {
    Ok(f64::try_from(t)?)
}

/// MAPPO trainer over a [`GraphPolicy`].
///
/// Owns the actor and critic optimizers, the gradient scaler, the optional
/// standalone value normalizer and the minibatch shuffling RNG.
pub struct MappoTrainer<P: GraphPolicy> {
    /// Policy being trained.
    pub policy: P,
    config: MappoConfig,
    settings: TrainerSettings,
    value_loss: ValueLossCalculator,
    value_norm: Option<ValueNorm>,
    actor_opt: nn::Optimizer,
    critic_opt: nn::Optimizer,
    scaler: GradScaler,
    rng: StdRng,
    device: Device,
    update_hook: Option<UpdateHook>,
}

impl<P: GraphPolicy> MappoTrainer<P> {
    /// Creates a new MAPPO trainer.
    ///
    /// Fails before any training when the configuration is invalid (for
    /// example PopArt and ValueNorm both enabled) or when PopArt is requested
    /// for a policy without a PopArt value head.
    pub fn new(config: MappoConfig, mut policy: P) -> Result<Self, TrainingError> {
        let settings = config.resolve()?;
        if settings.normalization == NormalizationMode::PopArt && policy.popart_mut().is_none() {
            return Err(TrainingError::MissingPopArt);
        }
        policy.set_policy_active_masks(settings.use_policy_active_masks);

        let device = policy.device();
        let adam = nn::Adam {
            eps: config.opti_eps,
            wd: config.weight_decay,
            ..Default::default()
        };
        let actor_opt = adam.build(policy.actor_var_store(), config.lr)?;
        let critic_opt = adam.build(policy.critic_var_store(), config.critic_lr)?;
        let scaler = GradScaler::new(config.mixed_precision && device.is_cuda());

        debug!(
            mode = ?settings.mini_batch_mode,
            normalization = ?settings.normalization,
            scaler = scaler.is_enabled(),
            "MAPPO trainer created"
        );

        Ok(Self {
            value_loss: ValueLossCalculator::from_settings(&settings),
            value_norm: (settings.normalization == NormalizationMode::ValueNorm)
                .then(ValueNorm::new),
            rng: StdRng::seed_from_u64(config.seed),
            policy,
            config,
            settings,
            actor_opt,
            critic_opt,
            scaler,
            device,
            update_hook: None,
        })
    }

    pub fn config(&self) -> &MappoConfig {
        &self.config
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// The active value normalizer, if any.
    pub fn value_normalizer(&mut self) -> Option<&mut dyn ValueNormalizer> {
        active_normalizer(
            self.settings.normalization,
            &mut self.value_norm,
            &mut self.policy,
        )
    }

    /// Installs a callback invoked with each minibatch's statistics.
    pub fn set_update_hook(&mut self, hook: impl FnMut(&UpdateStats) + 'static) {
        self.update_hook = Some(Box::new(hook));
    }

    /// Switches the policy to training mode.
    pub fn prep_training(&mut self) {
        self.policy.set_train_mode(true);
    }

    /// Switches the policy to evaluation mode for rollouts.
    pub fn prep_rollout(&mut self) {
        self.policy.set_train_mode(false);
    }

    /// Performs one PPO update of actor and critic on `sample`.
    ///
    /// The sample is moved to the policy's device first. With
    /// `update_actor = false` the actor gradients are still zeroed and
    /// measured but neither back-propagated nor stepped.
    pub fn ppo_update(
        &mut self,
        sample: MiniBatchSample,
        update_actor: bool,
    ) -> Result<PpoUpdate, TrainingError> {
        let sample = sample.to_device(self.device);
        check_sample(&sample)?;

        let eval = self.policy.evaluate_actions(&sample)?;

        let imp_weights = (&eval.action_log_probs - &sample.old_action_log_probs).exp();
        let policy_loss = clipped_surrogate_loss(
            &imp_weights,
            &sample.advantages,
            &sample.active_masks,
            self.settings.clip_param,
            self.settings.use_policy_active_masks,
        );

        let actor_vars = self.policy.actor_var_store().trainable_variables();
        let critic_vars = self.policy.critic_var_store().trainable_variables();
        let max_grad_norm = self.settings.max_grad_norm;

        let mut step = self.scaler.begin();

        // actor
        self.actor_opt.zero_grad();
        let start = Instant::now();
        if update_actor {
            step.backward(&(&policy_loss - &eval.dist_entropy * self.settings.entropy_coef))?;
        }
        let actor_backward_time = start.elapsed();
        let actor_grad_norm = step.unscale_and_clip(&actor_vars, max_grad_norm)?;
        if update_actor {
            step.step(&mut self.actor_opt)?;
        } else {
            step.skip();
        }

        // critic
        let normalizer = active_normalizer(
            self.settings.normalization,
            &mut self.value_norm,
            &mut self.policy,
        );
        let value_loss = self.value_loss.compute(
            &eval.values,
            &sample.value_preds,
            &sample.returns,
            &sample.active_masks,
            normalizer,
        )?;
        self.critic_opt.zero_grad();
        let start = Instant::now();
        step.backward(&(&value_loss * self.settings.value_loss_coef))?;
        let critic_backward_time = start.elapsed();
        let critic_grad_norm = step.unscale_and_clip(&critic_vars, max_grad_norm)?;
        step.step(&mut self.critic_opt)?;
        step.end()?;

        let stats = UpdateStats {
            value_loss: scalar(&value_loss)?,
            policy_loss: scalar(&policy_loss)?,
            dist_entropy: scalar(&eval.dist_entropy)?,
            actor_grad_norm,
            critic_grad_norm,
            ratio: scalar(&imp_weights.mean(Kind::Float))?,
        };
        if !stats.is_finite() {
            warn!(fields = ?stats.non_finite_fields(), "non-finite update statistics");
        }
        if let Some(hook) = self.update_hook.as_mut() {
            hook(&stats);
        }

        Ok(PpoUpdate {
            stats,
            imp_weights: imp_weights.detach(),
            actor_backward_time,
            critic_backward_time,
        })
    }

    /// Runs `ppo_epoch` passes of minibatch updates over `buffer`.
    ///
    /// Advantages are `returns - value_preds` (denormalized when a normalizer
    /// is active) over all but the bootstrap step, standardized with the
    /// statistics of the active entries.
    pub fn train<B: SampleSource + ?Sized>(
        &mut self,
        buffer: &B,
        update_actor: bool,
    ) -> Result<TrainInfo, TrainingError> {
        let steps = buffer.returns().dim().0.saturating_sub(1);
        let returns = buffer.returns().slice_move(s![..steps, .., ..]);
        let value_preds = buffer.value_preds().slice_move(s![..steps, .., ..]);
        let active_masks = buffer.active_masks().slice_move(s![..steps, .., ..]);

        let value_preds = match self.value_normalizer() {
            Some(normalizer) => normalizer.denormalize_array(value_preds),
            None => value_preds.to_owned(),
        };
        let raw = &returns - &value_preds;
        let advantages = standardize_advantages(raw.view(), active_masks);

        let num_mini_batch = self.settings.num_mini_batch;
        let mut info = TrainInfo::default();

        for epoch in 0..self.settings.ppo_epoch {
            let start = Instant::now();
            let batches = match self.settings.mini_batch_mode {
                MiniBatchMode::Recurrent { chunk_length } => buffer.recurrent_generator(
                    &advantages,
                    num_mini_batch,
                    chunk_length,
                    &mut self.rng,
                )?,
                MiniBatchMode::NaiveRecurrent => {
                    buffer.naive_recurrent_generator(&advantages, num_mini_batch, &mut self.rng)?
                }
                MiniBatchMode::FeedForward => {
                    buffer.feed_forward_generator(&advantages, num_mini_batch, &mut self.rng)?
                }
            };

            let mut minibatches = 0;
            for sample in batches {
                let update = self.ppo_update(sample, update_actor)?;
                info.accumulate(&update.stats);
                minibatches += 1;
            }
            debug!(epoch, minibatches, elapsed = ?start.elapsed(), "PPO epoch finished");
        }

        let info = info.averaged(self.settings.ppo_epoch * num_mini_batch);
        info!(
            value_loss = info.value_loss,
            policy_loss = info.policy_loss,
            dist_entropy = info.dist_entropy,
            actor_grad_norm = info.actor_grad_norm,
            critic_grad_norm = info.critic_grad_norm,
            ratio = info.ratio,
            "MAPPO train finished"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::network::{GraphActorCritic, GraphPolicyConfig};
    use crate::algorithms::rl::training::buffer::{BufferShape, GraphReplayBuffer, StepData};
    use crate::algorithms::rl::ConfigError;
    use crate::aps::build_adjacency;
    use ndarray::{Array2, Array3};
    use std::cell::RefCell;
    use std::rc::Rc;

    const THREADS: usize = 2;
    const AGENTS: usize = 4;
    const STEPS: usize = 4;
    const ACTIONS: usize = 3;

    fn policy(use_popart: bool) -> GraphActorCritic {
        GraphActorCritic::new(
            GraphPolicyConfig {
                node_feature_dim: 2,
                hidden_dim: 8,
                n_actions: ACTIONS,
                use_popart,
                ..GraphPolicyConfig::default()
            },
            Device::Cpu,
        )
    }

    fn config() -> MappoConfig {
        MappoConfig {
            ppo_epoch: 1,
            num_mini_batch: 1,
            use_recurrent_policy: false,
            ..MappoConfig::default()
        }
    }

    /// Fills a buffer by acting with `policy` on random graphs.
    fn rollout(policy: &GraphActorCritic) -> GraphReplayBuffer {
        let adjacency = build_adjacency(2, 2, true);
        let shape = BufferShape {
            episode_length: STEPS,
            n_threads: THREADS,
            n_agents: AGENTS,
            n_nodes: 4,
            node_feature_dim: 2,
            hidden_dim: 1,
            n_actions: Some(ACTIONS),
        };
        let mut buffer = GraphReplayBuffer::new(shape, &adjacency, Device::Cpu);
        let hidden = Array3::<f32>::zeros((THREADS, AGENTS, 1));
        let ones = Array2::<f32>::ones((THREADS, AGENTS));

        for t in 0..STEPS {
            let (graphs, agent_ids, available) = buffer.rollout_inputs(t);
            let out = policy.act(&graphs, &agent_ids, available.as_ref(), false);
            let to_array = |x: &Tensor| {
                let v: Vec<f32> = Vec::try_from(&x.to_kind(Kind::Float).view([-1])).unwrap();
                Array2::from_shape_vec((THREADS, AGENTS), v).unwrap()
            };
            let actions: Vec<i64> = Vec::try_from(&out.actions.view([-1])).unwrap();
            let actions = Array2::from_shape_vec((THREADS, AGENTS), actions).unwrap();
            let rewards = actions.mapv(|a| if a == 0 { 1.0f32 } else { 0.0 });
            let features = Array3::from_shape_fn((THREADS, 4, 2), |(e, n, f)| {
                ((t + e + n + f) % 3) as f32 * 0.5
            });

            buffer.insert(StepData {
                node_features: features.view(),
                rnn_states_actor: hidden.view(),
                rnn_states_critic: hidden.view(),
                actions: actions.view(),
                action_log_probs: to_array(&out.action_log_probs).view(),
                value_preds: to_array(&out.values).view(),
                rewards: rewards.view(),
                masks: ones.view(),
                active_masks: None,
                available_actions: None,
            });
        }
        let next_value = Array2::<f32>::zeros((THREADS, AGENTS));
        buffer.compute_returns(next_value.view(), 0.99, 0.95, None);
        buffer
    }

    fn actor_snapshot(policy: &GraphActorCritic) -> Vec<Tensor> {
        policy
            .actor_var_store()
            .trainable_variables()
            .iter()
            .map(|v| v.detach().copy())
            .collect()
    }

    #[test]
    fn conflicting_normalizers_fail_at_construction() {
        let cfg = MappoConfig {
            use_popart: true,
            use_valuenorm: true,
            ..config()
        };
        let err = MappoTrainer::new(cfg, policy(true)).err().unwrap();
        assert!(matches!(
            err,
            TrainingError::Config(ConfigError::ConflictingNormalizers)
        ));
    }

    #[test]
    fn popart_requires_popart_head() {
        let cfg = MappoConfig {
            use_popart: true,
            use_valuenorm: false,
            ..config()
        };
        assert!(matches!(
            MappoTrainer::new(cfg, policy(false)).err().unwrap(),
            TrainingError::MissingPopArt
        ));
    }

    #[test]
    fn single_epoch_single_batch_is_divided_by_one() {
        let mut trainer = MappoTrainer::new(config(), policy(false)).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        trainer.set_update_hook(move |s| sink.borrow_mut().push(*s));

        let buffer = rollout(&trainer.policy);
        let info = trainer.train(&buffer, true).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(info.num_updates, 1);
        assert_eq!(info.value_loss, seen[0].value_loss);
        assert_eq!(info.policy_loss, seen[0].policy_loss);
        assert_eq!(info.dist_entropy, seen[0].dist_entropy);
        assert_eq!(info.actor_grad_norm, seen[0].actor_grad_norm);
        assert_eq!(info.critic_grad_norm, seen[0].critic_grad_norm);
        assert_eq!(info.ratio, seen[0].ratio);
        assert!(info.is_finite());
    }

    #[test]
    fn every_minibatch_mode_trains() {
        let modes = [
            (false, false, 4),
            (false, true, 2),
            (true, false, 2),
        ];
        for (recurrent, naive, num_mini_batch) in modes {
            let cfg = MappoConfig {
                ppo_epoch: 2,
                num_mini_batch,
                use_recurrent_policy: recurrent,
                use_naive_recurrent_policy: naive,
                data_chunk_length: 2,
                ..config()
            };
            let mut trainer = MappoTrainer::new(cfg, policy(false)).unwrap();
            trainer.prep_training();
            let buffer = rollout(&trainer.policy);
            let info = trainer.train(&buffer, true).unwrap();
            assert_eq!(info.num_updates, 2 * num_mini_batch);
            assert!(info.is_finite(), "{info}");
            assert!(info.value_loss >= 0.0);
        }
    }

    #[test]
    fn first_update_has_unit_ratio() {
        let mut trainer = MappoTrainer::new(config(), policy(false)).unwrap();
        let buffer = rollout(&trainer.policy);
        let info = trainer.train(&buffer, true).unwrap();
        // the policy has not moved before the first minibatch
        assert!((info.ratio - 1.0).abs() < 1e-4);
    }

    #[test]
    fn frozen_actor_is_not_stepped() {
        let mut trainer = MappoTrainer::new(config(), policy(false)).unwrap();
        let buffer = rollout(&trainer.policy);
        let before = actor_snapshot(&trainer.policy);
        let info = trainer.train(&buffer, false).unwrap();
        let after = actor_snapshot(&trainer.policy);

        assert_eq!(info.actor_grad_norm, 0.0);
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(b.equal(a));
        }
    }

    #[test]
    fn value_norm_tracks_returns() {
        let cfg = MappoConfig {
            use_valuenorm: true,
            ..config()
        };
        let mut trainer = MappoTrainer::new(cfg, policy(false)).unwrap();
        let buffer = rollout(&trainer.policy);
        trainer.train(&buffer, true).unwrap();
        let (mean, _) = trainer.value_normalizer().unwrap().moments().mean_var();
        assert!(mean > 0.0);
    }

    #[test]
    fn popart_mode_trains() {
        let cfg = MappoConfig {
            use_popart: true,
            use_valuenorm: false,
            ..config()
        };
        let mut trainer = MappoTrainer::new(cfg, policy(true)).unwrap();
        let buffer = rollout(&trainer.policy);
        let info = trainer.train(&buffer, true).unwrap();
        assert!(info.is_finite());
        assert!(trainer.value_normalizer().is_some());
    }

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([-1, 1])
    }

    fn surrogate(ratio: f32, advantage: f32) -> f64 {
        let loss = clipped_surrogate_loss(
            &column(&[ratio]),
            &column(&[advantage]),
            &column(&[1.0]),
            0.2,
            true,
        );
        f64::try_from(&loss).unwrap()
    }

    #[test]
    fn surrogate_clips_large_ratio_on_positive_advantage() {
        // min(1.5 * 2, 1.2 * 2)
        assert!((surrogate(1.5, 2.0) + 2.4).abs() < 1e-6);
    }

    #[test]
    fn surrogate_clips_small_ratio_on_negative_advantage() {
        // min(0.5 * -2, 0.8 * -2)
        assert!((surrogate(0.5, -2.0) - 1.6).abs() < 1e-6);
    }

    #[test]
    fn surrogate_keeps_small_ratio_on_positive_advantage() {
        // min(0.5 * 2, 0.8 * 2)
        assert!((surrogate(0.5, 2.0) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn surrogate_reduction_respects_active_masks() {
        // per-sample objectives: 1.0, 2.4, 1.0
        let ratios = column(&[1.0, 1.5, 0.5]);
        let advantages = column(&[1.0, 2.0, 2.0]);
        let active = column(&[1.0, 1.0, 0.0]);

        let masked = clipped_surrogate_loss(&ratios, &advantages, &active, 0.2, true);
        let plain = clipped_surrogate_loss(&ratios, &advantages, &active, 0.2, false);
        assert!((f64::try_from(&masked).unwrap() + 1.7).abs() < 1e-6);
        assert!((f64::try_from(&plain).unwrap() + 4.4 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_graph_batch_is_rejected() {
        let mut trainer = MappoTrainer::new(config(), policy(false)).unwrap();
        let buffer = rollout(&trainer.policy);
        let advantages = Array3::<f32>::zeros((STEPS, THREADS, AGENTS));
        let mut rng = StdRng::seed_from_u64(0);
        let mut sample = buffer
            .feed_forward_generator(&advantages, 1, &mut rng)
            .unwrap()
            .next()
            .unwrap();
        sample.graphs.node_features = sample.graphs.node_features.narrow(0, 0, 2);

        let err = trainer.ppo_update(sample, true).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::ShapeMismatch { what: "graph batch", .. }
        ));
    }

    #[test]
    fn trainer_sets_policy_entropy_masking() {
        let cfg = MappoConfig {
            use_policy_active_masks: false,
            ..config()
        };
        let trainer = MappoTrainer::new(cfg, policy(false)).unwrap();
        assert!(!trainer.policy.uses_policy_active_masks());

        let trainer = MappoTrainer::new(config(), policy(false)).unwrap();
        assert!(trainer.policy.uses_policy_active_masks());
    }

    #[test]
    fn disabled_scaler_on_cpu() {
        let cfg = MappoConfig {
            mixed_precision: true,
            ..config()
        };
        let trainer = MappoTrainer::new(cfg, policy(false)).unwrap();
        assert!(!trainer.scaler().is_enabled());
    }
}
