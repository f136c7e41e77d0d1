//! Error types for objsync.

use thiserror::Error;

/// Errors that can occur when handling objsync wire-level values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// An identifier string could not be parsed.
    #[error("invalid {kind} id: {value}")]
    InvalidId {
        /// Which identifier type was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidId {
            kind: "file",
            value: "nope".into(),
        };
        assert_eq!(err.to_string(), "invalid file id: nope");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
