//! Graph replay buffer and PPO minibatch generators.
//!
//! Storage is time-major: per-agent scalars are `[T(+1), threads, agents]`,
//! hidden states append a feature axis, and node features are stored once
//! per thread as `[T + 1, threads, nodes, features]`. Arrays with `T + 1`
//! steps hold the observation-side data that is carried over to the next
//! rollout by [`GraphReplayBuffer::after_update`].

use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::seq::SliceRandom;
use rand::RngCore;
use tch::{Device, Tensor};
use tracing::debug;

use super::gae::compute_gae;
use super::normalization::ValueNormalizer;
use crate::algorithms::rl::error::TrainingError;
use crate::algorithms::rl::types::{edge_tensor, GraphBatch, MiniBatchSample};
use crate::aps::{EdgeKind, UeApAdjacency};

/// Lazily assembled minibatches of one epoch.
pub type MiniBatches<'a> = Box<dyn Iterator<Item = MiniBatchSample> + 'a>;

/// Rollout storage the trainer draws minibatches from.
pub trait SampleSource {
    /// `[T + 1, threads, agents]` discounted returns.
    fn returns(&self) -> ArrayView3<'_, f32>;

    /// `[T + 1, threads, agents]` critic outputs recorded during the rollout.
    fn value_preds(&self) -> ArrayView3<'_, f32>;

    /// `[T + 1, threads, agents]` active-agent masks.
    fn active_masks(&self) -> ArrayView3<'_, f32>;

    /// Shuffled independent timesteps split into `num_mini_batch` batches.
    fn feed_forward_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError>;

    /// Whole (thread, agent) sequences split into `num_mini_batch` batches.
    fn naive_recurrent_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError>;

    /// Sequence chunks of `data_chunk_length` steps split into
    /// `num_mini_batch` batches.
    fn recurrent_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        data_chunk_length: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError>;
}

/// Dimensions of a [`GraphReplayBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShape {
    pub episode_length: usize,
    pub n_threads: usize,
    pub n_agents: usize,
    pub n_nodes: usize,
    pub node_feature_dim: usize,
    pub hidden_dim: usize,
    /// `Some(n)` stores `[T + 1, threads, agents, n]` available-action masks.
    pub n_actions: Option<usize>,
}

/// Data produced by one environment step across all threads.
#[derive(Debug, Clone)]
pub struct StepData<'a> {
    /// `[threads, nodes, features]` observation after the step.
    pub node_features: ArrayView3<'a, f32>,
    /// `[threads, agents, hidden]` actor hidden state after the step.
    pub rnn_states_actor: ArrayView3<'a, f32>,
    pub rnn_states_critic: ArrayView3<'a, f32>,
    /// `[threads, agents]` actions taken.
    pub actions: ArrayView2<'a, i64>,
    pub action_log_probs: ArrayView2<'a, f32>,
    pub value_preds: ArrayView2<'a, f32>,
    pub rewards: ArrayView2<'a, f32>,
    /// `[threads, agents]`, zero when the episode ended with this step.
    pub masks: ArrayView2<'a, f32>,
    pub active_masks: Option<ArrayView2<'a, f32>>,
    /// `[threads, agents, actions]` availability for the next step.
    pub available_actions: Option<ArrayView3<'a, f32>>,
}

/// `(t, thread, agent)` index into the rollout.
type Position = (usize, usize, usize);

/// Positions of one minibatch, plus the positions whose hidden states seed it.
#[derive(Debug, Clone)]
struct BatchPlan {
    positions: Vec<Position>,
    hidden: Vec<Position>,
}

/// Replay buffer for graph-observation MAPPO.
#[derive(Debug)]
pub struct GraphReplayBuffer {
    shape: BufferShape,
    step: usize,
    device: Device,
    same_ue_edges: Tensor,
    same_ap_edges: Tensor,

    node_features: Array4<f32>,
    rnn_states_actor: Array4<f32>,
    rnn_states_critic: Array4<f32>,
    value_preds: Array3<f32>,
    returns: Array3<f32>,
    actions: Array3<i64>,
    action_log_probs: Array3<f32>,
    rewards: Array3<f32>,
    masks: Array3<f32>,
    active_masks: Array3<f32>,
    available_actions: Option<Array4<f32>>,
}

impl GraphReplayBuffer {
    pub fn new(shape: BufferShape, adjacency: &UeApAdjacency, device: Device) -> Self {
        let BufferShape {
            episode_length: t,
            n_threads: e,
            n_agents: a,
            n_nodes,
            node_feature_dim,
            hidden_dim,
            n_actions,
        } = shape;

        Self {
            shape,
            step: 0,
            device,
            same_ue_edges: edge_tensor(adjacency, EdgeKind::SameUe, Device::Cpu),
            same_ap_edges: edge_tensor(adjacency, EdgeKind::SameAp, Device::Cpu),
            node_features: Array4::zeros((t + 1, e, n_nodes, node_feature_dim)),
            rnn_states_actor: Array4::zeros((t + 1, e, a, hidden_dim)),
            rnn_states_critic: Array4::zeros((t + 1, e, a, hidden_dim)),
            value_preds: Array3::zeros((t + 1, e, a)),
            returns: Array3::zeros((t + 1, e, a)),
            actions: Array3::zeros((t, e, a)),
            action_log_probs: Array3::zeros((t, e, a)),
            rewards: Array3::zeros((t, e, a)),
            masks: Array3::ones((t + 1, e, a)),
            active_masks: Array3::ones((t + 1, e, a)),
            available_actions: n_actions.map(|n| Array4::ones((t + 1, e, a, n))),
        }
    }

    pub fn shape(&self) -> &BufferShape {
        &self.shape
    }

    /// Index of the next step to be written.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Writes the first observation of a rollout.
    pub fn set_initial_observation(
        &mut self,
        node_features: ArrayView3<'_, f32>,
        available_actions: Option<ArrayView3<'_, f32>>,
    ) {
        self.node_features
            .index_axis_mut(Axis(0), 0)
            .assign(&node_features);
        if let (Some(store), Some(available)) = (&mut self.available_actions, available_actions) {
            store.index_axis_mut(Axis(0), 0).assign(&available);
        }
    }

    /// Stores one environment step and advances the write cursor.
    pub fn insert(&mut self, data: StepData<'_>) {
        let (t, next) = (self.step, self.step + 1);

        self.node_features
            .index_axis_mut(Axis(0), next)
            .assign(&data.node_features);
        self.rnn_states_actor
            .index_axis_mut(Axis(0), next)
            .assign(&data.rnn_states_actor);
        self.rnn_states_critic
            .index_axis_mut(Axis(0), next)
            .assign(&data.rnn_states_critic);
        self.actions.index_axis_mut(Axis(0), t).assign(&data.actions);
        self.action_log_probs
            .index_axis_mut(Axis(0), t)
            .assign(&data.action_log_probs);
        self.value_preds
            .index_axis_mut(Axis(0), t)
            .assign(&data.value_preds);
        self.rewards.index_axis_mut(Axis(0), t).assign(&data.rewards);
        self.masks.index_axis_mut(Axis(0), next).assign(&data.masks);
        if let Some(active) = data.active_masks {
            self.active_masks
                .index_axis_mut(Axis(0), next)
                .assign(&active);
        }
        if let (Some(store), Some(available)) = (&mut self.available_actions, data.available_actions) {
            store.index_axis_mut(Axis(0), next).assign(&available);
        }

        self.step = next % self.shape.episode_length;
    }

    /// Carries the last observation-side step over as the first of the next
    /// rollout.
    pub fn after_update(&mut self) {
        let last = self.shape.episode_length;
        fn carry<A: Clone, D: ndarray::RemoveAxis>(array: &mut ndarray::Array<A, D>, last: usize) {
            let tail = array.index_axis(Axis(0), last).to_owned();
            array.index_axis_mut(Axis(0), 0).assign(&tail);
        }
        carry(&mut self.node_features, last);
        carry(&mut self.rnn_states_actor, last);
        carry(&mut self.rnn_states_critic, last);
        carry(&mut self.masks, last);
        carry(&mut self.active_masks, last);
        if let Some(available) = &mut self.available_actions {
            carry(available, last);
        }
    }

    /// Fills `returns` with GAE-λ returns bootstrapped from `next_value`.
    ///
    /// Stored value predictions are denormalized first when `normalizer` is
    /// given.
    pub fn compute_returns(
        &mut self,
        next_value: ArrayView2<'_, f32>,
        gamma: f64,
        gae_lambda: f64,
        normalizer: Option<&dyn ValueNormalizer>,
    ) {
        let last = self.shape.episode_length;
        self.value_preds
            .index_axis_mut(Axis(0), last)
            .assign(&next_value);
        let values = match normalizer {
            Some(normalizer) => normalizer.denormalize_array(self.value_preds.view()),
            None => self.value_preds.clone(),
        };
        self.returns = compute_gae(
            self.rewards.view(),
            values.view(),
            self.masks.view(),
            gamma,
            gae_lambda,
        );
    }

    /// Policy inputs for every (thread, agent) at step `t`, thread-major.
    pub fn rollout_inputs(&self, t: usize) -> (GraphBatch, Tensor, Option<Tensor>) {
        let positions: Vec<Position> = (0..self.shape.n_threads)
            .flat_map(|e| (0..self.shape.n_agents).map(move |a| (t, e, a)))
            .collect();
        (
            self.graph_batch(&positions),
            self.agent_ids(&positions),
            self.available(&positions),
        )
    }

    fn graph_batch(&self, positions: &[Position]) -> GraphBatch {
        let BufferShape {
            n_nodes,
            node_feature_dim,
            ..
        } = self.shape;
        let mut flat = Vec::with_capacity(positions.len() * n_nodes * node_feature_dim);
        for &(t, e, _) in positions {
            flat.extend(self.node_features.slice(s![t, e, .., ..]).iter());
        }
        GraphBatch {
            node_features: Tensor::from_slice(&flat)
                .view([
                    positions.len() as i64,
                    n_nodes as i64,
                    node_feature_dim as i64,
                ])
                .to_device(self.device),
            same_ue_edges: self.same_ue_edges.to_device(self.device),
            same_ap_edges: self.same_ap_edges.to_device(self.device),
        }
    }

    fn agent_ids(&self, positions: &[Position]) -> Tensor {
        let ids: Vec<i64> = positions.iter().map(|&(_, _, a)| a as i64).collect();
        column_i64(&ids, self.device)
    }

    fn available(&self, positions: &[Position]) -> Option<Tensor> {
        self.available_actions.as_ref().map(|store| {
            let n = store.dim().3;
            let mut flat = Vec::with_capacity(positions.len() * n);
            for &(t, e, a) in positions {
                flat.extend(store.slice(s![t, e, a, ..]).iter());
            }
            Tensor::from_slice(&flat)
                .view([positions.len() as i64, n as i64])
                .to_device(self.device)
        })
    }

    fn hidden(&self, store: &Array4<f32>, positions: &[Position]) -> Tensor {
        let h = self.shape.hidden_dim;
        let mut flat = Vec::with_capacity(positions.len() * h);
        for &(t, e, a) in positions {
            flat.extend(store.slice(s![t, e, a, ..]).iter());
        }
        Tensor::from_slice(&flat)
            .view([positions.len() as i64, h as i64])
            .to_device(self.device)
    }

    fn assemble(&self, plan: &BatchPlan, advantages: &Array3<f32>) -> MiniBatchSample {
        let pick = |array: &Array3<f32>| -> Tensor {
            let v: Vec<f32> = plan.positions.iter().map(|&p| array[p]).collect();
            column_f32(&v, self.device)
        };
        let actions: Vec<i64> = plan.positions.iter().map(|&p| self.actions[p]).collect();

        MiniBatchSample {
            graphs: self.graph_batch(&plan.positions),
            agent_ids: self.agent_ids(&plan.positions),
            rnn_states_actor: self.hidden(&self.rnn_states_actor, &plan.hidden),
            rnn_states_critic: self.hidden(&self.rnn_states_critic, &plan.hidden),
            actions: column_i64(&actions, self.device),
            value_preds: pick(&self.value_preds),
            returns: pick(&self.returns),
            masks: pick(&self.masks),
            active_masks: pick(&self.active_masks),
            old_action_log_probs: pick(&self.action_log_probs),
            advantages: pick(advantages),
            available_actions: self.available(&plan.positions),
        }
    }

    fn check_advantages(&self, advantages: &Array3<f32>) -> Result<(), TrainingError> {
        let expected = [
            self.shape.episode_length,
            self.shape.n_threads,
            self.shape.n_agents,
        ];
        if advantages.shape() != expected {
            return Err(TrainingError::ShapeMismatch {
                what: "advantages",
                expected: expected.to_vec(),
                found: advantages.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn sequences(&self) -> Vec<(usize, usize)> {
        (0..self.shape.n_threads)
            .flat_map(|e| (0..self.shape.n_agents).map(move |a| (e, a)))
            .collect()
    }

    fn batches<'a>(&'a self, plans: Vec<BatchPlan>, advantages: &'a Array3<f32>) -> MiniBatches<'a> {
        Box::new(
            plans
                .into_iter()
                .map(move |plan| self.assemble(&plan, advantages)),
        )
    }
}

fn column_f32(values: &[f32], device: Device) -> Tensor {
    Tensor::from_slice(values)
        .view([values.len() as i64, 1])
        .to_device(device)
}

fn column_i64(values: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(values)
        .view([values.len() as i64, 1])
        .to_device(device)
}

/// Shuffles `0..total` and cuts it into `num_mini_batch` groups of equal
/// size; leftover indices are dropped.
fn shuffled_groups(
    total: usize,
    num_mini_batch: usize,
    what: &'static str,
    rng: &mut dyn RngCore,
) -> Result<Vec<Vec<usize>>, TrainingError> {
    if num_mini_batch == 0 || total < num_mini_batch {
        return Err(TrainingError::InsufficientData {
            what,
            needed: num_mini_batch.max(1),
            available: total,
        });
    }
    let group = total / num_mini_batch;
    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(rng);
    Ok(order
        .chunks_exact(group)
        .take(num_mini_batch)
        .map(<[usize]>::to_vec)
        .collect())
}

/// Time-major positions of sequences starting at `starts`, each `len` long.
fn time_major(starts: &[Position], len: usize) -> Vec<Position> {
    (0..len)
        .flat_map(|l| starts.iter().map(move |&(t, e, a)| (t + l, e, a)))
        .collect()
}

impl SampleSource for GraphReplayBuffer {
    fn returns(&self) -> ArrayView3<'_, f32> {
        self.returns.view()
    }

    fn value_preds(&self) -> ArrayView3<'_, f32> {
        self.value_preds.view()
    }

    fn active_masks(&self) -> ArrayView3<'_, f32> {
        self.active_masks.view()
    }

    fn feed_forward_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError> {
        self.check_advantages(advantages)?;
        let (t_len, e_len, a_len) = advantages.dim();
        let groups = shuffled_groups(t_len * e_len * a_len, num_mini_batch, "timesteps", rng)?;

        let plans = groups
            .into_iter()
            .map(|group| {
                let positions: Vec<Position> = group
                    .into_iter()
                    .map(|i| (i / (e_len * a_len), (i / a_len) % e_len, i % a_len))
                    .collect();
                BatchPlan {
                    hidden: positions.clone(),
                    positions,
                }
            })
            .collect();
        Ok(self.batches(plans, advantages))
    }

    fn naive_recurrent_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError> {
        self.check_advantages(advantages)?;
        let sequences = self.sequences();
        let groups = shuffled_groups(sequences.len(), num_mini_batch, "sequences", rng)?;
        let len = self.shape.episode_length;

        let plans = groups
            .into_iter()
            .map(|group| {
                let starts: Vec<Position> = group
                    .into_iter()
                    .map(|i| (0, sequences[i].0, sequences[i].1))
                    .collect();
                BatchPlan {
                    positions: time_major(&starts, len),
                    hidden: starts,
                }
            })
            .collect();
        Ok(self.batches(plans, advantages))
    }

    fn recurrent_generator<'a>(
        &'a self,
        advantages: &'a Array3<f32>,
        num_mini_batch: usize,
        data_chunk_length: usize,
        rng: &mut dyn RngCore,
    ) -> Result<MiniBatches<'a>, TrainingError> {
        self.check_advantages(advantages)?;
        let len = self.shape.episode_length;
        if data_chunk_length == 0 || data_chunk_length > len {
            return Err(TrainingError::InsufficientData {
                what: "timesteps per chunk",
                needed: data_chunk_length.max(1),
                available: len,
            });
        }
        let per_sequence = len / data_chunk_length;
        let dropped = len % data_chunk_length;
        if dropped > 0 {
            debug!(
                dropped,
                data_chunk_length, "episode length not divisible by chunk length, dropping tail steps"
            );
        }

        let sequences = self.sequences();
        let groups = shuffled_groups(
            sequences.len() * per_sequence,
            num_mini_batch,
            "data chunks",
            rng,
        )?;

        let plans = groups
            .into_iter()
            .map(|group| {
                let starts: Vec<Position> = group
                    .into_iter()
                    .map(|i| {
                        let (e, a) = sequences[i / per_sequence];
                        ((i % per_sequence) * data_chunk_length, e, a)
                    })
                    .collect();
                BatchPlan {
                    positions: time_major(&starts, data_chunk_length),
                    hidden: starts,
                }
            })
            .collect();
        Ok(self.batches(plans, advantages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aps::build_adjacency;
    use ndarray::{Array2, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shape(episode_length: usize, n_threads: usize, n_agents: usize) -> BufferShape {
        BufferShape {
            episode_length,
            n_threads,
            n_agents,
            n_nodes: 4,
            node_feature_dim: 2,
            hidden_dim: 3,
            n_actions: Some(2),
        }
    }

    /// Buffer whose rewards and actor hidden states encode their position as
    /// `100 t + 10 e + a`.
    fn filled(episode_length: usize, n_threads: usize, n_agents: usize) -> GraphReplayBuffer {
        let adjacency = build_adjacency(2, 2, true);
        let mut buffer =
            GraphReplayBuffer::new(shape(episode_length, n_threads, n_agents), &adjacency, Device::Cpu);
        let initial = Array3::from_shape_fn((n_threads, n_agents, 3), |(e, a, _)| {
            (10 * e + a) as f32
        });
        buffer
            .rnn_states_actor
            .index_axis_mut(Axis(0), 0)
            .assign(&initial);
        let features = Array3::<f32>::zeros((n_threads, 4, 2));
        let actions = Array2::<i64>::zeros((n_threads, n_agents));
        let ones = Array2::<f32>::ones((n_threads, n_agents));
        for t in 0..episode_length {
            let code = Array2::from_shape_fn((n_threads, n_agents), |(e, a)| {
                (100 * t + 10 * e + a) as f32
            });
            let hidden = Array3::from_shape_fn((n_threads, n_agents, 3), |(e, a, _)| {
                (100 * (t + 1) + 10 * e + a) as f32
            });
            buffer.insert(StepData {
                node_features: features.view(),
                rnn_states_actor: hidden.view(),
                rnn_states_critic: hidden.view(),
                actions: actions.view(),
                action_log_probs: ones.view(),
                value_preds: ones.view(),
                rewards: code.view(),
                masks: ones.view(),
                active_masks: None,
                available_actions: None,
            });
        }
        buffer
    }

    fn rewards_as_advantages(buffer: &GraphReplayBuffer) -> Array3<f32> {
        buffer.rewards.clone()
    }

    fn floats(t: &Tensor) -> Vec<f32> {
        Vec::try_from(&t.view([-1])).unwrap()
    }

    #[test]
    fn insert_wraps_cursor() {
        let buffer = filled(4, 1, 2);
        assert_eq!(buffer.step(), 0);
    }

    #[test]
    fn feed_forward_covers_distinct_positions() {
        let buffer = filled(4, 2, 3);
        let adv = rewards_as_advantages(&buffer);
        let mut rng = StdRng::seed_from_u64(7);
        let batches: Vec<_> = buffer
            .feed_forward_generator(&adv, 4, &mut rng)
            .unwrap()
            .collect();

        assert_eq!(batches.len(), 4);
        let mut seen: Vec<f32> = batches.iter().flat_map(|b| floats(&b.advantages)).collect();
        assert!(batches.iter().all(|b| b.len() == 6));
        seen.sort_by(|x, y| x.partial_cmp(y).unwrap());
        seen.dedup();
        assert_eq!(seen.len(), 24);
        assert_eq!(batches[0].graphs.node_features.size(), vec![6, 4, 2]);
        assert_eq!(batches[0].available_actions.as_ref().unwrap().size(), vec![6, 2]);
    }

    #[test]
    fn recurrent_chunks_are_time_major() {
        let buffer = filled(6, 1, 2);
        let adv = rewards_as_advantages(&buffer);
        let mut rng = StdRng::seed_from_u64(3);
        // 2 sequences × 2 chunks of length 3, one minibatch
        let batches: Vec<_> = buffer
            .recurrent_generator(&adv, 1, 3, &mut rng)
            .unwrap()
            .collect();
        assert_eq!(batches.len(), 1);

        let b = &batches[0];
        assert_eq!(b.len(), 12);
        assert_eq!(b.rnn_states_actor.size(), vec![4, 3]);

        let codes = floats(&b.advantages);
        let hidden = floats(&b.rnn_states_actor);
        for n in 0..4 {
            let start = codes[n];
            // row l * N + n continues the same chunk one step later
            for l in 0..3 {
                assert_eq!(codes[l * 4 + n], start + 100.0 * l as f32);
            }
            // hidden state recorded at the chunk start step
            assert_eq!(hidden[n * 3], start);
        }
    }

    #[test]
    fn recurrent_drops_remainder_steps() {
        let buffer = filled(5, 1, 1);
        let adv = rewards_as_advantages(&buffer);
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<_> = buffer
            .recurrent_generator(&adv, 1, 2, &mut rng)
            .unwrap()
            .collect();
        assert_eq!(batches[0].len(), 4);
        assert!(floats(&batches[0].advantages).iter().all(|&c| c < 400.0));
    }

    #[test]
    fn naive_recurrent_uses_whole_sequences() {
        let buffer = filled(3, 2, 2);
        let adv = rewards_as_advantages(&buffer);
        let mut rng = StdRng::seed_from_u64(1);
        let batches: Vec<_> = buffer
            .naive_recurrent_generator(&adv, 2, &mut rng)
            .unwrap()
            .collect();
        assert_eq!(batches.len(), 2);
        for b in &batches {
            assert_eq!(b.len(), 6);
            assert_eq!(b.rnn_states_actor.size(), vec![2, 3]);
            let codes = floats(&b.advantages);
            assert!(codes[..2].iter().all(|&c| c < 100.0));
        }
    }

    #[test]
    fn too_many_minibatches_is_an_error() {
        let buffer = filled(2, 1, 1);
        let adv = rewards_as_advantages(&buffer);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            buffer.naive_recurrent_generator(&adv, 2, &mut rng),
            Err(TrainingError::InsufficientData { needed: 2, available: 1, .. })
        ));
        assert!(matches!(
            buffer.recurrent_generator(&adv, 1, 3, &mut rng),
            Err(TrainingError::InsufficientData { .. })
        ));
    }

    #[test]
    fn mismatched_advantages_are_rejected() {
        let buffer = filled(2, 1, 1);
        let adv = Array3::<f32>::zeros((3, 1, 1));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            buffer.feed_forward_generator(&adv, 1, &mut rng),
            Err(TrainingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn after_update_carries_last_step() {
        let mut buffer = filled(2, 1, 1);
        buffer.after_update();
        assert_eq!(buffer.rnn_states_actor[[0, 0, 0, 0]], 200.0);
    }

    #[test]
    fn compute_returns_bootstraps_next_value() {
        let mut buffer = filled(1, 1, 1);
        let next = Array2::from_elem((1, 1), 2.0f32);
        buffer.compute_returns(next.view(), 0.5, 1.0, None);
        // r = 0, v = 1, v_next = 2: return = 0 + 0.5 * 2 = 1
        assert!((buffer.returns[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(buffer.returns[[1, 0, 0]], 2.0);
    }
}
