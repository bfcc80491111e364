//! Learning algorithms for access-point / user-equipment control.

pub mod rl;
