use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure classes of one unit of analysis.
///
/// `MissingMemoryDependency` is normally carried inside a partial result
/// rather than returned; it only becomes an error when a caller insists on
/// a complete slice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to lift block at {address:#x}: {reason}")]
    LiftingFailure { address: u64, reason: String },

    #[error("wall-clock budget of {0:?} exhausted")]
    Timeout(std::time::Duration),

    #[error("memory read {read} has {uncovered} uncovered bits without a preceding write")]
    MissingMemoryDependency { read: String, uncovered: u32 },

    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("engine invariant violated: {0}")]
    AssertionViolation(String),
}

impl EngineError {
    pub fn lifting(address: u64, reason: impl Into<String>) -> Self {
        Self::LiftingFailure {
            address,
            reason: reason.into(),
        }
    }

    /// Errors that end the unit they occur in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LiftingFailure { .. } | Self::AssertionViolation(_)
        )
    }
}
