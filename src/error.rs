//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own error enum (`grammar::GrammarError`,
//! `ipm::ParserError`, `decode::ProviderError`, ...). [`CdcError`] only
//! aggregates them for callers that want one error type to match on by
//! `kind`, as described in the propagation policy.
use displaydoc::Display;

use crate::decode::ProviderError;
use crate::grammar::GrammarError;
use crate::ipm::ParserError;
use crate::repair::ValidationFailure;

/// A stable tag for metrics/logging, independent of the error's payload.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ErrorKind {
    /// grammar
    Grammar,
    /// parser
    Parser,
    /// provider
    Provider,
    /// validation
    Validation,
    /// repair-exhausted
    RepairExhausted,
    /// cancelled
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
/// The top-level error type returned by the orchestration entry points.
pub enum CdcError {
    /// Compile-time malformed or unsupported grammar.
    #[error("grammar error: {0}")]
    Grammar(#[from] GrammarError),
    /// In-decode illegal advance; an internal invariant was violated.
    #[error("parser error: {0}")]
    Parser(#[from] ParserError),
    /// Transport, auth, timeout, or malformed logits from the Provider.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// Diagnostics from external validators; recoverable up to the repair budget.
    #[error("validation failure: {0}")]
    Validation(#[from] ValidationFailure),
    /// The repair ladder reached its ceiling without acceptance.
    #[error("repair exhausted after {attempts} attempt(s)")]
    RepairExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The last emitted artifact, returned to the caller alongside this error.
        last_artifact: String,
    },
    /// Deadline or caller cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl CdcError {
    /// A stable tag suitable for metrics, independent of the payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CdcError::Grammar(_) => ErrorKind::Grammar,
            CdcError::Parser(_) => ErrorKind::Parser,
            CdcError::Provider(_) => ErrorKind::Provider,
            CdcError::Validation(_) => ErrorKind::Validation,
            CdcError::RepairExhausted { .. } => ErrorKind::RepairExhausted,
            CdcError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
