use thiserror::Error;

/// Errors raised while assembling an SOCP instance.
///
/// Infeasibility is not an error: it is reported through
/// [`SolveStatus`](super::SolveStatus).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SocpError {
    #[error("Dimension mismatch for {what}: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("SINR target must be finite and non-negative, got {0}")]
    InvalidTarget(f64),

    #[error("Downlink power budget must be finite and positive, got {0}")]
    InvalidPowerBudget(f64),

    #[error("Invalid bisection bracket [{lower}, {upper}]")]
    InvalidBracket { lower: f64, upper: f64 },
}
