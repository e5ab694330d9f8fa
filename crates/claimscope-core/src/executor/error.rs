//! Executor error types.

use claimscope_state::StorageError;
use thiserror::Error;

/// Failures of the executor itself, as opposed to harness outcomes, which
/// are always reported through `ExecutionOutcome`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("artifact store error: {0}")]
    Artifacts(#[from] StorageError),
}

pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_store() {
        let err: ExecutionError = StorageError::Backend("disk full".to_string()).into();
        let msg = err.to_string();
        assert!(msg.contains("artifact store"));
        assert!(msg.contains("disk full"));
    }
}
