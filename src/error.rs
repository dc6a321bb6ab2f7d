use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Configuration errors (`DimensionMismatch`, `InvalidArgument`) are raised
/// synchronously and are never retried. `NumericalFailure` marks a sweep whose
/// draws could not be completed; the posterior state visible to callers is the
/// pre-sweep state. `Unimplemented` marks a posterior-update stage that is
/// intentionally stubbed and must never silently no-op.
#[derive(Debug, Error)]
pub enum ImputeError {
    #[error("dimension mismatch for {what}: expected {expected}, got {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("posterior update stage not implemented: {0}")]
    Unimplemented(&'static str),
}
