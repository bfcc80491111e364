//! Training infrastructure for MAPPO (Multi-Agent PPO).
//!
//! Provides the graph rollout buffer and its minibatch generators, GAE
//! computation, value normalization, the value loss, gradient scaling and
//! the MAPPO trainer.

pub mod buffer;
pub mod gae;
pub mod grad_scaler;
pub mod mappo;
pub mod normalization;
pub mod value_loss;

pub use buffer::{BufferShape, GraphReplayBuffer, MiniBatches, SampleSource, StepData};
pub use gae::compute_gae;
pub use grad_scaler::{clip_grad_norm, grad_norm, GradScaler, ScaledStep};
pub use mappo::{clipped_surrogate_loss, MappoTrainer, PpoUpdate, UpdateHook};
pub use normalization::{PopArt, RunningMoments, ValueNorm, ValueNormalizer};
pub use value_loss::{huber_loss, masked_mean, mse_loss, ValueLossCalculator};
