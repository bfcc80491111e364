//! Physical-layer utilities for the access-point / user-equipment simulation.
//!
//! Provides SINR evaluation of linear precoders, the relational adjacency
//! structure consumed by the graph policy, and the SOCP feasibility solver
//! used to bound the achievable max-min SINR.

pub mod adjacency;
pub mod error;
pub mod sinr;
pub mod socp;

pub use adjacency::{build_adjacency, EdgeKind, NodeLayout, UeApAdjacency};
pub use error::SocpError;
pub use sinr::{clip_abs, min_sinr, polar, sinr_from_a};
pub use socp::{
    bisect_max_min_sinr, BeamformingProblem, SinrBound, SocpConstraintSolver, SocpSolution,
    SolveStatus, SolverSettings,
};

/// Complex scalar used for channel and precoding matrices.
pub type Complex64 = num_complex::Complex<f64>;
