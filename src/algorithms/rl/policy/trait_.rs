//! Policy trait consumed by the MAPPO trainer.

use tch::{nn, Device};

use crate::algorithms::rl::error::TrainingError;
use crate::algorithms::rl::training::normalization::PopArt;
use crate::algorithms::rl::types::{ActionEvaluation, MiniBatchSample};

/// A graph actor-critic with separately optimized actor and critic.
///
/// The trainer only relies on batched action evaluation, the two parameter
/// sets, and the train/eval switch.
pub trait GraphPolicy {
    /// Evaluates the sample's actions under the current parameters.
    ///
    /// Reads the graphs, agent ids, actor and critic hidden states, actions,
    /// masks, available actions and active masks of `sample`; returns values
    /// and log-probabilities shaped `[B, 1]` and the scalar mean entropy.
    fn evaluate_actions(&self, sample: &MiniBatchSample) -> Result<ActionEvaluation, TrainingError>;

    /// Parameters updated by the actor optimizer.
    fn actor_var_store(&self) -> &nn::VarStore;

    /// Parameters updated by the critic optimizer.
    fn critic_var_store(&self) -> &nn::VarStore;

    /// PopArt value head, if the critic has one.
    fn popart_mut(&mut self) -> Option<&mut PopArt> {
        None
    }

    /// Selects whether the entropy is averaged over active agents only,
    /// matching the trainer's policy-loss reduction.
    fn set_policy_active_masks(&mut self, enabled: bool);

    /// Switches between training and evaluation behavior.
    fn set_train_mode(&mut self, train: bool);

    fn device(&self) -> Device {
        self.actor_var_store().device()
    }
}
