//! Journal error taxonomy
//!
//! Transient conditions (bind contention, an unreachable helper) are retried
//! inside `setup()` and only surface once the retry bound is exhausted.
//! Everything else is surfaced to the caller immediately.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    /// The local replication endpoint could not be bound.
    #[error("address {addr} is already in use, gave up after {attempts} attempts")]
    BindConflict {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Create/remove/put attempted on a node that is not the master.
    #[error("node {label} is not writable in role {role}")]
    NotWritable { label: String, role: String },

    /// The helper could not be reached or refused the join.
    #[error("unable to join the group via {helper}: {reason}")]
    JoinFailure { helper: String, reason: String },

    /// Local committed history is not part of the group's history.
    #[error(
        "local history of {label} diverged from the group: committed index {local_commit} \
         (term {local_term}) is unknown to the leader (last index {group_last_index}, \
         term at index {group_term:?}); wipe the storage directory and rejoin"
    )]
    RollbackDivergence {
        label: String,
        local_commit: u64,
        local_term: u64,
        group_last_index: u64,
        group_term: Option<u64>,
    },

    #[error("{0} is closed")]
    Closed(String),

    /// Catch-up with the group did not finish in time.
    #[error("{label} did not catch up to index {target} within {seconds}s (applied {applied})")]
    SyncTimeout {
        label: String,
        target: u64,
        applied: u64,
        seconds: u64,
    },

    #[error("proposal was not committed within {0}s")]
    CommitTimeout(u64),

    #[error("segment {0} not found")]
    SegmentNotFound(String),

    #[error("invalid segment {name}: {reason}")]
    InvalidSegment { name: String, reason: String },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("storage path {0} is used by another environment")]
    StorageInUse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Raft(#[from] raft::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

impl JournalError {
    pub fn not_writable(label: impl Into<String>, role: impl ToString) -> Self {
        JournalError::NotWritable {
            label: label.into(),
            role: role.to_string(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        JournalError::Closed(what.into())
    }

    pub fn invalid_segment(name: impl Into<String>, reason: impl Into<String>) -> Self {
        JournalError::InvalidSegment {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Requires an operator before the node can be started again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JournalError::BindConflict { .. }
                | JournalError::RollbackDivergence { .. }
                | JournalError::SyncTimeout { .. }
                | JournalError::StorageInUse(_)
        )
    }

    /// Retried internally by `setup()` before being surfaced.
    pub fn is_retryable(&self) -> bool {
        match self {
            JournalError::JoinFailure { .. } => true,
            JournalError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_and_retryable_are_disjoint() {
        let errors = vec![
            JournalError::BindConflict {
                addr: "127.0.0.1:9010".to_string(),
                attempts: 3,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            },
            JournalError::not_writable("follower0", "Follower"),
            JournalError::JoinFailure {
                helper: "127.0.0.1:9011".to_string(),
                reason: "refused".to_string(),
            },
            JournalError::closed("journal environment"),
            JournalError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
        ];
        for e in errors {
            assert!(!(e.is_fatal() && e.is_retryable()), "{}", e);
        }
    }

    #[test]
    fn test_rollback_is_fatal_and_mentions_operator_action() {
        let e = JournalError::RollbackDivergence {
            label: "master".to_string(),
            local_commit: 120,
            local_term: 2,
            group_last_index: 18,
            group_term: None,
        };
        assert!(e.is_fatal());
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("wipe the storage directory"));
    }

    #[test]
    fn test_not_writable_is_surfaced_immediately() {
        let e = JournalError::not_writable("observer", "Observer");
        assert!(!e.is_fatal());
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "node observer is not writable in role Observer");
    }
}
