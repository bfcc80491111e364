//! aps-mappo - graph MAPPO training for cell-free access-point selection
//!
//! A multi-agent PPO trainer for graph-structured policies over UE-AP
//! pairs, together with the physical-layer pieces it trains against: SINR
//! evaluation, the relational adjacency of the UE-AP graph and an SOCP
//! feasibility solver that bounds the achievable max-min SINR.

pub mod algorithms;
pub mod aps;
