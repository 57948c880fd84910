//! Error types shared by every stage of a replication run.
//!
//! Database calls capture their failure on the session that issued them
//! (see [`crate::db::DbSession::last_error`]) and additionally return one of
//! the variants below so callers can decide between aborting the table and
//! logging-and-continuing.

use thiserror::Error;

/// Errors produced while replicating tables between two servers.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection to a server could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A requested table is missing on one side, or the column lists of a
    /// table disagree between source and target.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reading table or column metadata failed.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// A statement could not be prepared.
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// The server rejected a statement and reported a numeric error code.
    #[error("server error [{code}]: {message}")]
    Vendor { code: u16, message: String },

    /// Any other driver-level failure (I/O, protocol, pool).
    #[error("database error: {0}")]
    Db(String),

    /// The driver delivered a value whose type disagrees with the declared
    /// column metadata.
    #[error("decode error: {0}")]
    Decode(String),

    /// A shutdown was requested; not a fault, but the run ends non-zero.
    #[error("stop requested")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_error_renders_code_and_message() {
        let e = SyncError::Vendor {
            code: 1062,
            message: "Duplicate entry '2' for key 'uniq'".into(),
        };
        assert_eq!(
            e.to_string(),
            "server error [1062]: Duplicate entry '2' for key 'uniq'"
        );
    }

    #[test]
    fn cancellation_is_not_an_error_message() {
        assert_eq!(SyncError::Cancelled.to_string(), "stop requested");
    }
}
