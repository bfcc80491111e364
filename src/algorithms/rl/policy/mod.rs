//! Policy interface for graph actor-critics.

pub mod trait_;

pub use trait_::GraphPolicy;
