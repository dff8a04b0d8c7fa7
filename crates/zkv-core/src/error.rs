use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// The record a publish lost against.
///
/// Carried inside [`VaultError::PublishConflict`] so the caller can decode
/// the winning state and re-apply its intent on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Naming-layer name of the entity (hex signing public key)
    pub name: String,
    /// Sequence number currently published
    pub sequence: u64,
    /// Encoded (encrypted) record currently published
    pub value: Vec<u8>,
    /// Sequence the losing caller expected to find
    pub expected: u64,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("key unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("unsupported {kind} schema version {found} (newest known: {supported})")]
    SchemaMismatch {
        kind: String,
        found: u32,
        supported: u32,
    },

    #[error("malformed {kind} record: {reason}")]
    MalformedRecord { kind: String, reason: String },

    #[error(
        "publish conflict on {}: expected sequence {}, found {}",
        .0.name, .0.expected, .0.sequence
    )]
    PublishConflict(Box<ConflictRecord>),

    #[error("naming layer unavailable after {attempts} attempts: {reason}")]
    PublishUnavailable { attempts: u32, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale sequence for {name}: {sequence} <= last seen {last_seen}")]
    StaleSequence {
        name: String,
        sequence: u64,
        last_seen: u64,
    },

    #[error("sequence {0} is outside the safe integer range")]
    SequenceOverflow(u64),

    #[error("authorization request {0} has expired")]
    RequestExpired(String),

    #[error("authorization request {0} was already fulfilled")]
    RequestAlreadyFulfilled(String),

    #[error("authorization request {0} was cancelled")]
    RequestCancelled(String),

    #[error("device {0} cannot fulfill its own authorization request")]
    SelfFulfillment(String),

    #[error("too many pending authorization requests (max {0})")]
    TooManyPendingRequests(usize),

    #[error("custodian epoch {0} has expired; re-enroll under the current epoch")]
    EpochExpired(u64),

    #[error("no active custodian epoch")]
    NoActiveEpoch,

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid signature on record {0}")]
    InvalidSignature(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Conflicts and transient unavailability can be retried by the caller
    /// after re-reading state. Everything else aborts the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::PublishConflict(_) | VaultError::PublishUnavailable { .. }
        )
    }

    /// The competing record, if this is a publish conflict.
    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            VaultError::PublishConflict(record) => Some(record),
            _ => None,
        }
    }

    pub fn malformed(kind: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        VaultError::MalformedRecord {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }
}
