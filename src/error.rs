//! Error types of the coupled-cluster solver.

use thiserror::Error;

/// Result type used throughout the solver.
pub type Result<T> = std::result::Result<T, CcError>;

/// Errors that abort a run.
///
/// Numerical non-convergence is not an error: it is reported through
/// [`ConvergenceStatus`](crate::structs::ConvergenceStatus). Likewise an
/// ill-conditioned DIIS system is recovered inside the mixer.
#[derive(Error, Debug)]
pub enum CcError {
    /// Two tensors that must agree in shape do not.
    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch { context: String, expected: Vec<usize>, found: Vec<usize> },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The mixer name does not match any registered mixer.
    #[error("Unknown mixer kind: {0}")]
    UnknownMixer(String),

    /// An integral block was requested but never supplied.
    #[error("Missing integral block: {0}")]
    MissingBlock(String),

    /// A block signature could not be parsed.
    #[error("Invalid block signature: {0}")]
    InvalidSignature(String),

    /// Index labels of a contraction are inconsistent.
    #[error("Invalid contraction labels: {0}")]
    InvalidLabels(String),

    /// No builder is registered for the intermediate.
    #[error("No builder registered for intermediate `{0}`")]
    UnregisteredIntermediate(String),

    /// The intermediate was requested again while being built.
    #[error("Dependency cycle detected while building intermediate `{0}`")]
    IntermediateCycle(String),

    /// `current()` was called on a mixer with no history.
    #[error("Mixer has no estimate yet; append must be called before current")]
    EmptyMixer,

    /// Only part of a stored amplitude set was found on disk.
    #[error("Incomplete amplitude seed: {0}")]
    MissingSeed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Npy format error: {0}")]
    Npy(String),
}

impl CcError {
    pub(crate) fn shape_mismatch(context: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        CcError::ShapeMismatch { context: context.into(), expected: expected.to_vec(), found: found.to_vec() }
    }
}
