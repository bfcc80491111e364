//! Graph-based multi-agent reinforcement learning.
//!
//! Configuration, metrics and advantage standardization only need
//! `ndarray`. Neural network policies, the replay buffer and MAPPO training
//! are behind the `rl-nn` feature flag (which brings in `tch`).

pub mod advantages;
pub mod config;
pub mod error;
pub mod metrics;

#[cfg(feature = "rl-nn")]
pub mod network;
#[cfg(feature = "rl-nn")]
pub mod policy;
#[cfg(feature = "rl-nn")]
pub mod training;
#[cfg(feature = "rl-nn")]
pub mod types;

pub use advantages::{standardize_advantages, ADVANTAGE_EPS};
pub use config::{
    MappoConfig, MiniBatchMode, NormalizationMode, TrainerSettings, ValueLossKind,
};
pub use error::ConfigError;
pub use metrics::{TrainInfo, UpdateStats};

#[cfg(feature = "rl-nn")]
pub use error::TrainingError;
#[cfg(feature = "rl-nn")]
pub use network::{GraphActorCritic, GraphPolicyConfig};
#[cfg(feature = "rl-nn")]
pub use policy::GraphPolicy;
#[cfg(feature = "rl-nn")]
pub use training::{GraphReplayBuffer, MappoTrainer, SampleSource};
#[cfg(feature = "rl-nn")]
pub use types::{ActionEvaluation, GraphBatch, MiniBatchSample};
