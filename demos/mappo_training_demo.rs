//! MAPPO training demo: UE-AP link selection on a toy fading channel.
//!
//! Every UE-AP pair is an agent deciding whether to serve its link. A link
//! pays its channel gain minus a fixed activation cost, so the policy should
//! learn to enable only strong links.
//!
//! Run (requires libtorch):
//! ```sh
//! RUST_LOG=info cargo run --example mappo_training_demo --features rl-nn
//! ```

use std::error::Error;

use aps_mappo::algorithms::rl::training::{BufferShape, GraphReplayBuffer, StepData};
use aps_mappo::algorithms::rl::{GraphActorCritic, GraphPolicyConfig, MappoConfig, MappoTrainer};
use aps_mappo::aps::build_adjacency;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::{Device, Kind, Tensor};
use tracing_subscriber::EnvFilter;

const N_UES: usize = 2;
const N_APS: usize = 3;
const N_NODES: usize = N_UES * N_APS;
const N_THREADS: usize = 4;
const EPISODE_LENGTH: usize = 16;
const LINK_COST: f32 = 0.5;

/// Independent fading gains per thread and UE-AP pair.
struct FadingEnv {
    rng: StdRng,
    gains: Array2<f32>,
}

impl FadingEnv {
    fn new(seed: u64) -> Self {
        let mut env = Self {
            rng: StdRng::seed_from_u64(seed),
            gains: Array2::zeros((N_THREADS, N_NODES)),
        };
        env.redraw();
        env
    }

    fn redraw(&mut self) {
        let rng = &mut self.rng;
        self.gains.mapv_inplace(|_| rng.gen_range(0.0..1.0));
    }

    /// `[threads, nodes, 4]`: gain, UE position, AP position, bias.
    fn observe(&self) -> Array3<f32> {
        Array3::from_shape_fn((N_THREADS, N_NODES, 4), |(e, n, f)| match f {
            0 => self.gains[[e, n]],
            1 => (n % N_UES) as f32 / N_UES as f32,
            2 => (n / N_UES) as f32 / N_APS as f32,
            _ => 1.0,
        })
    }

    fn step(&mut self, actions: &Array2<i64>) -> Array2<f32> {
        let rewards = Array2::from_shape_fn((N_THREADS, N_NODES), |(e, n)| {
            if actions[[e, n]] == 1 {
                self.gains[[e, n]] - LINK_COST
            } else {
                0.0
            }
        });
        self.redraw();
        rewards
    }
}

fn to_array<T: tch::kind::Element>(t: &Tensor) -> Result<Array2<T>, Box<dyn Error>> {
    let flat: Vec<T> = Vec::try_from(&t.view([-1]))?;
    Ok(Array2::from_shape_vec((N_THREADS, N_NODES), flat)?)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Graph MAPPO Link Selection Demo ===\n");

    let adjacency = build_adjacency(N_UES, N_APS, false);
    let device = Device::cuda_if_available();
    let policy = GraphActorCritic::new(
        GraphPolicyConfig {
            node_feature_dim: 4,
            hidden_dim: 32,
            n_actions: 2,
            ..GraphPolicyConfig::default()
        },
        device,
    );
    let config = MappoConfig {
        ppo_epoch: 5,
        num_mini_batch: 4,
        use_recurrent_policy: false,
        use_naive_recurrent_policy: false,
        ..MappoConfig::default()
    };
    let (gamma, gae_lambda) = (config.gamma, config.gae_lambda);
    let mut trainer = MappoTrainer::new(config, policy)?;

    let shape = BufferShape {
        episode_length: EPISODE_LENGTH,
        n_threads: N_THREADS,
        n_agents: N_NODES,
        n_nodes: N_NODES,
        node_feature_dim: 4,
        hidden_dim: 1,
        n_actions: None,
    };
    let mut buffer = GraphReplayBuffer::new(shape, &adjacency, device);
    let mut env = FadingEnv::new(3);
    buffer.set_initial_observation(env.observe().view(), None);

    let hidden = Array3::<f32>::zeros((N_THREADS, N_NODES, 1));
    let masks = Array2::<f32>::ones((N_THREADS, N_NODES));

    println!("Layout: {N_UES} UEs x {N_APS} APs, {N_THREADS} threads, device {device:?}\n");

    for iteration in 0..20 {
        trainer.prep_rollout();
        let mut total_reward = 0.0;
        for t in 0..EPISODE_LENGTH {
            let (graphs, agent_ids, available) = buffer.rollout_inputs(t);
            let out = trainer
                .policy
                .act(&graphs, &agent_ids, available.as_ref(), false);
            let actions: Array2<i64> = to_array(&out.actions.to_device(Device::Cpu))?;
            let log_probs: Array2<f32> =
                to_array(&out.action_log_probs.to_kind(Kind::Float).to_device(Device::Cpu))?;
            let values: Array2<f32> =
                to_array(&out.values.to_kind(Kind::Float).to_device(Device::Cpu))?;

            let rewards = env.step(&actions);
            total_reward += rewards.sum();
            let observation = env.observe();

            buffer.insert(StepData {
                node_features: observation.view(),
                rnn_states_actor: hidden.view(),
                rnn_states_critic: hidden.view(),
                actions: actions.view(),
                action_log_probs: log_probs.view(),
                value_preds: values.view(),
                rewards: rewards.view(),
                masks: masks.view(),
                active_masks: None,
                available_actions: None,
            });
        }

        let (graphs, agent_ids, _) = buffer.rollout_inputs(EPISODE_LENGTH);
        let next_value = tch::no_grad(|| trainer.policy.values(&graphs, &agent_ids));
        let next_value: Array2<f32> =
            to_array(&next_value.to_kind(Kind::Float).to_device(Device::Cpu))?;
        let normalizer = trainer.value_normalizer().map(|n| &*n);
        buffer.compute_returns(next_value.view(), gamma, gae_lambda, normalizer);

        trainer.prep_training();
        let info = trainer.train(&buffer, true)?;
        buffer.after_update();

        println!(
            "Iteration {iteration:2}: mean reward {:.4}, value loss {:.4}, entropy {:.4}",
            total_reward / (EPISODE_LENGTH * N_THREADS * N_NODES) as f32,
            info.value_loss,
            info.dist_entropy,
        );
    }

    Ok(())
}
