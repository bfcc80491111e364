use thiserror::Error;

/// Errors raised while validating a [`MappoConfig`](super::MappoConfig).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("use_popart and use_valuenorm cannot both be enabled")]
    ConflictingNormalizers,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Errors raised while running MAPPO updates.
#[cfg(feature = "rl-nn")]
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("Not enough {what} to form the requested minibatches: need {needed}, have {available}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Gradient scaler misuse: {0}")]
    ScalerOrder(&'static str),

    #[error("PopArt normalization requested but the policy has no PopArt value head")]
    MissingPopArt,
}
