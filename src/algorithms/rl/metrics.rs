//! Training statistics for MAPPO updates.
//!
//! [`UpdateStats`] is produced by one minibatch update; [`TrainInfo`] sums
//! them over a `train` call and is averaged before being returned.

use std::fmt;

/// Scalars reported by a single PPO minibatch update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateStats {
    pub value_loss: f64,
    pub policy_loss: f64,
    pub dist_entropy: f64,
    pub actor_grad_norm: f64,
    pub critic_grad_norm: f64,
    /// Mean importance weight of the minibatch.
    pub ratio: f64,
}

impl UpdateStats {
    fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("value_loss", self.value_loss),
            ("policy_loss", self.policy_loss),
            ("dist_entropy", self.dist_entropy),
            ("actor_grad_norm", self.actor_grad_norm),
            ("critic_grad_norm", self.critic_grad_norm),
            ("ratio", self.ratio),
        ]
    }

    /// Names of fields holding NaN or infinite values.
    pub fn non_finite_fields(&self) -> Vec<&'static str> {
        self.fields()
            .into_iter()
            .filter(|(_, v)| !v.is_finite())
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_finite(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_finite())
    }
}

/// Averaged statistics of a `train` call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainInfo {
    pub value_loss: f64,
    pub policy_loss: f64,
    pub dist_entropy: f64,
    pub actor_grad_norm: f64,
    pub critic_grad_norm: f64,
    pub ratio: f64,
    /// Number of minibatch updates that contributed.
    pub num_updates: usize,
}

impl TrainInfo {
    /// Adds one minibatch's statistics to the running sums.
    pub fn accumulate(&mut self, stats: &UpdateStats) {
        self.value_loss += stats.value_loss;
        self.policy_loss += stats.policy_loss;
        self.dist_entropy += stats.dist_entropy;
        self.actor_grad_norm += stats.actor_grad_norm;
        self.critic_grad_norm += stats.critic_grad_norm;
        self.ratio += stats.ratio;
        self.num_updates += 1;
    }

    /// Divides every running sum by `divisor` (`ppo_epoch × num_mini_batch`).
    pub fn averaged(mut self, divisor: usize) -> Self {
        if divisor == 0 {
            return self;
        }
        let d = divisor as f64;
        self.value_loss /= d;
        self.policy_loss /= d;
        self.dist_entropy /= d;
        self.actor_grad_norm /= d;
        self.critic_grad_norm /= d;
        self.ratio /= d;
        self
    }

    pub fn is_finite(&self) -> bool {
        [
            self.value_loss,
            self.policy_loss,
            self.dist_entropy,
            self.actor_grad_norm,
            self.critic_grad_norm,
            self.ratio,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

impl fmt::Display for TrainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Train Info ({} updates) ===", self.num_updates)?;
        writeln!(f, "  value_loss:        {:.4}", self.value_loss)?;
        writeln!(f, "  policy_loss:       {:.4}", self.policy_loss)?;
        writeln!(f, "  dist_entropy:      {:.4}", self.dist_entropy)?;
        writeln!(f, "  actor_grad_norm:   {:.4}", self.actor_grad_norm)?;
        writeln!(f, "  critic_grad_norm:  {:.4}", self.critic_grad_norm)?;
        write!(f, "  ratio:             {:.4}", self.ratio)
    }
}
