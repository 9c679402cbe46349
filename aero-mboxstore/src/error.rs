use thiserror::Error;

/// The error taxonomy surfaced to callers of the storage engine.
///
/// Violations that indicate a caller bug rather than on-disk corruption or a
/// lost race with another process (e.g. appending a non-increasing UID,
/// committing an unlocked handle) are not represented here: they `panic!`
/// at the call site instead, per the per-invariant policy recorded in
/// DESIGN.md.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mailbox index has an unrecognized or malformed layout")]
    BadFormat,

    #[error("checksum mismatch")]
    Checksum,

    #[error("mailbox is locked")]
    Locked,

    #[error("mailbox does not exist")]
    Nonexistent,

    #[error("mailbox is being moved")]
    Moved,

    #[error("mailbox name is invalid")]
    BadName,

    #[error("not found")]
    NotFound,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("no more user flag slots available")]
    UserFlagExhausted,

    #[error("invalid identifier")]
    InvalidIdentifier,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("message parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
