//! Error types for convoy-state

use thiserror::Error;

/// Errors returned by repository ports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An entity with the same identity was already written.
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A status write that the entity's state machine does not allow.
    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// `true` for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Returned when a closed enumeration is parsed from an unknown string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseVariantError {
    pub kind: &'static str,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_entity_and_id() {
        let err = StorageError::not_found("deployment", "dep-1");
        assert_eq!(err.to_string(), "deployment not found: dep-1");
        assert!(err.is_not_found());
    }

    #[test]
    fn invalid_transition_displays_both_states() {
        let err = StorageError::InvalidTransition {
            entity: "group",
            id: "g-1".to_string(),
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("completed -> running"));
        assert!(!err.is_not_found());
    }
}
