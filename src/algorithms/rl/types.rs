//! Tensor containers exchanged between the buffer, the policy and the trainer.

use tch::{Device, Kind, Tensor};

use crate::aps::{EdgeKind, UeApAdjacency};

/// A batch of UE-AP graphs sharing one topology.
///
/// `node_features` is `[B, N, F]`; the edge tensors are `[2, E]` `Int64`
/// `(src, dst)` lists over node indices `0..N`, identical for every graph in
/// the batch.
#[derive(Debug)]
pub struct GraphBatch {
    pub node_features: Tensor,
    pub same_ue_edges: Tensor,
    pub same_ap_edges: Tensor,
}

/// Converts one relation of `adjacency` into a `[2, E]` edge tensor.
pub fn edge_tensor(adjacency: &UeApAdjacency, kind: EdgeKind, device: Device) -> Tensor {
    let pairs = adjacency.pairs(kind);
    let mut flat = Vec::with_capacity(2 * pairs.len());
    flat.extend(pairs.iter().map(|&(src, _)| src as i64));
    flat.extend(pairs.iter().map(|&(_, dst)| dst as i64));
    Tensor::from_slice(&flat)
        .reshape([2, pairs.len() as i64])
        .to_device(device)
}

impl GraphBatch {
    /// Batch size `B`.
    pub fn batch_size(&self) -> i64 {
        self.node_features.size()[0]
    }
}

/// One PPO minibatch.
///
/// Every per-sample tensor has leading dimension `B` (or `L × N` for chunked
/// recurrent batches, flattened time-major). Hidden states have one row per
/// sequence start.
#[derive(Debug)]
pub struct MiniBatchSample {
    pub graphs: GraphBatch,
    /// `[B, 1]` agent index within its environment.
    pub agent_ids: Tensor,
    pub rnn_states_actor: Tensor,
    pub rnn_states_critic: Tensor,
    /// `[B, 1]` `Int64` discrete actions.
    pub actions: Tensor,
    pub value_preds: Tensor,
    pub returns: Tensor,
    pub masks: Tensor,
    /// `[B, 1]`, values in `{0, 1}`.
    pub active_masks: Tensor,
    pub old_action_log_probs: Tensor,
    pub advantages: Tensor,
    /// `[B, n_actions]`, zero marks an unavailable action.
    pub available_actions: Option<Tensor>,
}

impl MiniBatchSample {
    pub fn len(&self) -> i64 {
        self.actions.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves every tensor to `device`, casting the float ones to `Float`.
    pub fn to_device(self, device: Device) -> Self {
        let float = |t: Tensor| t.to_kind(Kind::Float).to_device(device);
        Self {
            graphs: GraphBatch {
                node_features: float(self.graphs.node_features),
                same_ue_edges: self.graphs.same_ue_edges.to_device(device),
                same_ap_edges: self.graphs.same_ap_edges.to_device(device),
            },
            agent_ids: self.agent_ids.to_device(device),
            rnn_states_actor: float(self.rnn_states_actor),
            rnn_states_critic: float(self.rnn_states_critic),
            actions: self.actions.to_device(device),
            value_preds: float(self.value_preds),
            returns: float(self.returns),
            masks: float(self.masks),
            active_masks: float(self.active_masks),
            old_action_log_probs: float(self.old_action_log_probs),
            advantages: float(self.advantages),
            available_actions: self.available_actions.map(float),
        }
    }
}

/// Output of [`GraphPolicy::evaluate_actions`](super::policy::GraphPolicy::evaluate_actions).
#[derive(Debug)]
pub struct ActionEvaluation {
    /// `[B, 1]` value estimates (normalized space when a normalizer is active).
    pub values: Tensor,
    /// `[B, 1]` log-probabilities of the taken actions.
    pub action_log_probs: Tensor,
    /// Scalar mean policy entropy.
    pub dist_entropy: Tensor,
}
