//! Error types for the Keel state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// The storage variants carry the underlying redb/serde message. The
/// remaining variants are request-level precondition failures; they are
/// always detected before anything is written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("corrupt table {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Missing node registration")]
    MissingNode,

    #[error("Missing service registration")]
    MissingService,

    #[error("Missing service ID")]
    MissingServiceId,

    #[error("Missing session ID")]
    MissingSessionId,

    #[error("Missing ACL ID")]
    MissingAclId,

    #[error("Missing query ID")]
    MissingQueryId,

    #[error("missing session")]
    MissingSession,

    #[error("invalid session {0:?}")]
    InvalidSession(String),

    #[error("Missing check '{0}' registration")]
    InvalidCheck(String),

    #[error("Check '{0}' is in critical state")]
    CriticalCheck(String),

    #[error("node ID {id:?} for node {node:?} aliases existing node {existing:?}")]
    NodeIdConflict {
        id: String,
        node: String,
        existing: String,
    },

    #[error("node {check_node:?} of check {check:?} does not match registration node {node:?}")]
    NodeMismatch {
        check: String,
        check_node: String,
        node: String,
    },

    #[error("name {0:?} aliases an existing query name")]
    DuplicateQueryName(String),

    #[error("failed to check {what}, key {key:?} doesn't exist")]
    KeyMissing { what: &'static str, key: String },

    #[error("failed index check for key {key:?}, current modify index {current} != {expected}")]
    IndexMismatch {
        key: String,
        current: u64,
        expected: u64,
    },

    #[error("failed session check for key {key:?}, current session {current:?} != {expected:?}")]
    SessionMismatch {
        key: String,
        current: String,
        expected: String,
    },
}

impl StateError {
    /// True for errors caused by the request rather than by the storage layer.
    pub fn is_precondition(&self) -> bool {
        !matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Commit(_)
                | StateError::Serialize(_)
                | StateError::Deserialize(_)
                | StateError::Corrupt { .. }
        )
    }
}
