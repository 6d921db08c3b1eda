// Error kinds surfaced by the todo service

use thiserror::Error;

/// Errors returned to callers of [`crate::TodoService`].
///
/// Messages are meant for the user. Diagnostic detail from SQLite or the
/// filesystem is logged where the failure happens and does not end up here.
#[derive(Debug, Error)]
pub enum TodoError {
    /// The store could not be opened, even after one destructive recreate.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Malformed input, rejected before the store is touched.
    #[error("{0}")]
    Validation(String),

    /// Any other store failure during a read or a mutation.
    #[error("{0}")]
    Persistence(String),
}

impl TodoError {
    pub fn is_validation(&self) -> bool {
        matches!(self, TodoError::Validation(_))
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, TodoError::Persistence(_))
    }

    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, TodoError::StorageUnavailable(_))
    }
}

pub type TodoResult<T> = Result<T, TodoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_user_message() {
        let err = TodoError::Persistence("Failed to add todo. Please try again.".to_string());
        assert_eq!(err.to_string(), "Failed to add todo. Please try again.");

        let err = TodoError::StorageUnavailable("locked".to_string());
        assert_eq!(err.to_string(), "Storage unavailable: locked");
    }

    #[test]
    fn test_kind_predicates() {
        assert!(TodoError::Validation("x".to_string()).is_validation());
        assert!(TodoError::Persistence("x".to_string()).is_persistence());
        assert!(TodoError::StorageUnavailable("x".to_string()).is_storage_unavailable());
        assert!(!TodoError::Validation("x".to_string()).is_persistence());
    }
}
