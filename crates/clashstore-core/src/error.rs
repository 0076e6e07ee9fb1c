//! Unified error type covering all failure modes of the clash-zone store.
//!
//! The taxonomy deliberately separates locally-handled conditions
//! (`Validation`, `IntegrityConflict` — skip-and-continue within a batch)
//! from conditions that propagate to the caller (`Transaction`,
//! `Verification`). Engine-level failures that do not fit a more specific
//! variant are wrapped in `Storage`.

/// Error type for every fallible operation in the clashstore workspace.
#[derive(Debug, thiserror::Error)]
pub enum ClashError {
    /// A candidate or argument failed validation before touching storage.
    ///
    /// Batch operations report these per item and continue with the
    /// remaining items.
    #[error("validation failed for {field}: {reason}")]
    Validation {
        /// Which field or argument was rejected.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A uniqueness-constraint collision that the dedup resolver could not
    /// convert into an update. Collisions it can resolve are never surfaced.
    #[error("integrity conflict on {entity} ({key})")]
    IntegrityConflict {
        /// The table or logical entity the conflict occurred on.
        entity: &'static str,
        /// The conflicting key, rendered for diagnostics.
        key: String,
    },

    /// An unrecoverable database error inside a batch transaction. The
    /// whole batch has been rolled back.
    #[error("transaction failed during {op} (batch of {batch_size}): {source}")]
    Transaction {
        /// The operation that was executing.
        op: &'static str,
        /// How many items the batch carried.
        batch_size: usize,
        /// The underlying engine error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The element-existence oracle failed for a handle during staleness
    /// verification. The affected zone is left in its current state.
    #[error("existence check failed for handle {handle}: {source}")]
    Verification {
        /// The handle whose check failed.
        handle: String,
        /// The underlying oracle error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The persisted schema is newer than this build supports.
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew {
        /// The version recorded in the database.
        found: i64,
        /// The newest version this build understands.
        supported: i64,
    },

    /// Any other storage-engine failure.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying engine error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ClashError {
    /// Wrap an arbitrary engine error as a `Storage` failure.
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            source: Box::new(source),
        }
    }

    /// Build a `Validation` error from a field name and reason.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the workspace.
pub type ClashResult<T> = Result<T, ClashError>;

#[cfg(test)]
mod tests {
    use super::{ClashError, ClashResult};

    #[test]
    fn validation_error_names_field_and_reason() {
        let err = ClashError::validation("intersection", "coordinates must be finite");
        let msg = err.to_string();
        assert!(msg.contains("intersection"));
        assert!(msg.contains("finite"));
    }

    #[test]
    fn transaction_error_carries_op_and_batch_size() {
        let err = ClashError::Transaction {
            op: "sync_batch",
            batch_size: 42,
            source: Box::new(std::io::Error::other("disk full")),
        };
        let msg = err.to_string();
        assert!(msg.contains("sync_batch"));
        assert!(msg.contains("42"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn verification_error_names_handle_and_source() {
        let err = ClashError::Verification {
            handle: "sleeve-7".to_owned(),
            source: Box::new(std::io::Error::other("rpc timeout")),
        };
        let msg = err.to_string();
        assert!(msg.contains("sleeve-7"));
        assert!(msg.contains("rpc timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn storage_error_preserves_source() {
        let err = ClashError::storage(std::io::Error::other("locked"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn result_alias_is_usable() {
        let ok: ClashResult<u32> = Ok(7);
        assert_eq!(ok.unwrap(), 7);
        let err: ClashResult<u32> = Err(ClashError::SchemaTooNew {
            found: 9,
            supported: 2,
        });
        assert!(err.is_err());
    }
}
