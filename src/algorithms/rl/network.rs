//! Reference graph actor-critic using tch-rs (PyTorch bindings).
//!
//! Each (UE, AP) link is a graph node. Actor and critic own separate
//! parameter stores and separate relational encoders that run one round of
//! mean-aggregated message passing over the same-UE and same-AP relations.
//! This module is only available with the `rl-nn` feature.

use tch::{nn, nn::Module, Device, Kind, Tensor};

use super::error::TrainingError;
use super::policy::GraphPolicy;
use super::training::normalization::PopArt;
use super::types::{ActionEvaluation, GraphBatch, MiniBatchSample};

/// Logit assigned to unavailable actions.
const MASKED_LOGIT: f64 = -1e10;

/// Architecture of [`GraphActorCritic`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphPolicyConfig {
    /// Features per (UE, AP) node.
    pub node_feature_dim: usize,
    pub hidden_dim: usize,
    /// Discrete actions per agent.
    pub n_actions: usize,
    /// Use a PopArt value head instead of a plain linear one.
    pub use_popart: bool,
}

impl Default for GraphPolicyConfig {
    fn default() -> Self {
        Self {
            node_feature_dim: 4,
            hidden_dim: 64,
            n_actions: 2,
            use_popart: false,
        }
    }
}

/// Mean of neighbor embeddings along `edges` (`[2, E]`, `src → dst`).
///
/// Nodes without incoming edges receive a zero vector.
fn mean_aggregate(h: &Tensor, edges: &Tensor) -> Tensor {
    let n_nodes = h.size()[1];
    let src = edges.get(0);
    let dst = edges.get(1);

    let messages = h.index_select(1, &src);
    let summed = h.zeros_like().index_add(1, &dst, &messages);
    let ones = Tensor::ones([dst.size()[0]], (h.kind(), h.device()));
    let degree = Tensor::zeros([n_nodes], (h.kind(), h.device()))
        .index_add(0, &dst, &ones)
        .clamp_min(1.0);
    summed / degree.view([1, n_nodes, 1])
}

/// One relational message-passing layer over the UE-AP graph.
#[derive(Debug)]
struct RelationalEncoder {
    input: nn::Linear,
    self_loop: nn::Linear,
    same_ue: nn::Linear,
    same_ap: nn::Linear,
}

impl RelationalEncoder {
    fn new(p: nn::Path<'_>, in_dim: i64, hidden: i64) -> Self {
        Self {
            input: nn::linear(&p / "input", in_dim, hidden, Default::default()),
            self_loop: nn::linear(&p / "self", hidden, hidden, Default::default()),
            same_ue: nn::linear(&p / "same_ue", hidden, hidden, Default::default()),
            same_ap: nn::linear(&p / "same_ap", hidden, hidden, Default::default()),
        }
    }

    /// `[B, N, F]` node features to `[B, N, H]` embeddings.
    fn forward(&self, graphs: &GraphBatch) -> Tensor {
        let h = self.input.forward(&graphs.node_features).relu();
        let ue = mean_aggregate(&h, &graphs.same_ue_edges);
        let ap = mean_aggregate(&h, &graphs.same_ap_edges);
        (self.self_loop.forward(&h) + self.same_ue.forward(&ue) + self.same_ap.forward(&ap)).relu()
    }
}

/// Picks the `[B, H]` embedding of each sample's agent node.
fn agent_embedding(embeddings: &Tensor, agent_ids: &Tensor) -> Tensor {
    let size = embeddings.size();
    let (batch, hidden) = (size[0], size[2]);
    let index = agent_ids.view([batch, 1, 1]).expand([batch, 1, hidden], false);
    embeddings.gather(1, &index, false).squeeze_dim(1)
}

#[derive(Debug)]
enum ValueHead {
    Linear(nn::Linear),
    PopArt(PopArt),
}

impl ValueHead {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            ValueHead::Linear(l) => l.forward(xs),
            ValueHead::PopArt(p) => p.forward(xs),
        }
    }
}

/// Result of [`GraphActorCritic::act`].
#[derive(Debug)]
pub struct ActOutput {
    /// `[B, 1]` critic values.
    pub values: Tensor,
    /// `[B, 1]` `Int64` actions.
    pub actions: Tensor,
    /// `[B, 1]` log-probabilities of `actions`.
    pub action_log_probs: Tensor,
}

/// Graph actor-critic with separate actor and critic parameter stores.
pub struct GraphActorCritic {
    config: GraphPolicyConfig,
    actor_vs: nn::VarStore,
    critic_vs: nn::VarStore,
    actor_encoder: RelationalEncoder,
    actor_head: nn::Linear,
    critic_encoder: RelationalEncoder,
    critic_hidden: nn::Linear,
    value_head: ValueHead,
    /// Average the entropy over active agents only.
    policy_active_masks: bool,
    train: bool,
}

impl GraphActorCritic {
    pub fn new(config: GraphPolicyConfig, device: Device) -> Self {
        let actor_vs = nn::VarStore::new(device);
        let critic_vs = nn::VarStore::new(device);
        let in_dim = config.node_feature_dim as i64;
        let hidden = config.hidden_dim as i64;

        let a = actor_vs.root();
        let actor_encoder = RelationalEncoder::new(&a / "encoder", in_dim, hidden);
        let actor_head = nn::linear(
            &a / "head",
            hidden,
            config.n_actions as i64,
            Default::default(),
        );

        let c = critic_vs.root();
        let critic_encoder = RelationalEncoder::new(&c / "encoder", in_dim, hidden);
        let critic_hidden = nn::linear(&c / "hidden", 2 * hidden, hidden, Default::default());
        let value_head = if config.use_popart {
            ValueHead::PopArt(PopArt::new(&c / "v_out", hidden))
        } else {
            ValueHead::Linear(nn::linear(&c / "v_out", hidden, 1, Default::default()))
        };

        Self {
            config,
            actor_vs,
            critic_vs,
            actor_encoder,
            actor_head,
            critic_encoder,
            critic_hidden,
            value_head,
            policy_active_masks: true,
            train: true,
        }
    }

    pub fn config(&self) -> &GraphPolicyConfig {
        &self.config
    }

    pub fn is_training(&self) -> bool {
        self.train
    }

    pub fn uses_policy_active_masks(&self) -> bool {
        self.policy_active_masks
    }

    /// `[B, n_actions]` log-probabilities with unavailable actions masked out.
    pub fn action_log_probs(
        &self,
        graphs: &GraphBatch,
        agent_ids: &Tensor,
        available_actions: Option<&Tensor>,
    ) -> Tensor {
        let embeddings = self.actor_encoder.forward(graphs);
        let logits = self
            .actor_head
            .forward(&agent_embedding(&embeddings, agent_ids));
        let logits = match available_actions {
            Some(available) => logits.masked_fill(&available.eq(0.0), MASKED_LOGIT),
            None => logits,
        };
        logits.log_softmax(-1, Kind::Float)
    }

    /// `[B, 1]` value estimates.
    pub fn values(&self, graphs: &GraphBatch, agent_ids: &Tensor) -> Tensor {
        let embeddings = self.critic_encoder.forward(graphs);
        let pooled = embeddings.mean_dim([1i64].as_slice(), false, Kind::Float);
        let agent = agent_embedding(&embeddings, agent_ids);
        let h = self
            .critic_hidden
            .forward(&Tensor::cat(&[pooled, agent], 1))
            .relu();
        self.value_head.forward(&h)
    }

    /// Samples (or, if `deterministic`, picks the most likely) actions for a
    /// rollout step without tracking gradients.
    pub fn act(
        &self,
        graphs: &GraphBatch,
        agent_ids: &Tensor,
        available_actions: Option<&Tensor>,
        deterministic: bool,
    ) -> ActOutput {
        tch::no_grad(|| {
            let log_probs = self.action_log_probs(graphs, agent_ids, available_actions);
            let actions = if deterministic {
                log_probs.argmax(-1, true)
            } else {
                log_probs.exp().multinomial(1, true)
            };
            ActOutput {
                values: self.values(graphs, agent_ids),
                action_log_probs: log_probs.gather(1, &actions, false),
                actions,
            }
        })
    }
}

impl GraphPolicy for GraphActorCritic {
    fn evaluate_actions(&self, sample: &MiniBatchSample) -> Result<ActionEvaluation, TrainingError> {
        let log_probs = self.action_log_probs(
            &sample.graphs,
            &sample.agent_ids,
            sample.available_actions.as_ref(),
        );
        let action_log_probs = log_probs.f_gather(1, &sample.actions, false)?;

        let entropy = -(log_probs.exp() * &log_probs).sum_dim_intlist(
            [-1i64].as_slice(),
            false,
            Kind::Float,
        );
        let dist_entropy = if self.policy_active_masks {
            let active = sample.active_masks.view([-1]);
            (entropy * &active).sum(Kind::Float) / active.sum(Kind::Float).clamp_min(1.0)
        } else {
            entropy.mean(Kind::Float)
        };

        Ok(ActionEvaluation {
            values: self.values(&sample.graphs, &sample.agent_ids),
            action_log_probs,
            dist_entropy,
        })
    }

    fn actor_var_store(&self) -> &nn::VarStore {
        &self.actor_vs
    }

    fn critic_var_store(&self) -> &nn::VarStore {
        &self.critic_vs
    }

    fn popart_mut(&mut self) -> Option<&mut PopArt> {
        match &mut self.value_head {
            ValueHead::PopArt(p) => Some(p),
            ValueHead::Linear(_) => None,
        }
    }

    fn set_policy_active_masks(&mut self, enabled: bool) {
        self.policy_active_masks = enabled;
    }

    fn set_train_mode(&mut self, train: bool) {
        self.train = train;
    }
}
