//! The [`Error`] and [`Result`] types used throughout this crate.

use std::collections::HashMap;
use std::sync::LazyLock;

use thiserror::Error;

/// Label attached to an [`OperationFailure`] when the server aborted the owning
/// transaction and the caller may retry it on a fresh session.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// The result type used by all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A server-reported command or write failure.
///
/// Carries the raw numeric `code` the server returned along with its symbolic name
/// looked up in the static [`codes table`](codes), the human-readable message, and
/// any error labels the reply carried (e.g. [`TRANSIENT_TRANSACTION_ERROR`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationFailure {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
}

impl OperationFailure {
    pub(crate) fn new(code: i32, message: impl Into<String>, labels: Vec<String>) -> Self {
        let code_name = codes::lookup(code).unwrap_or("Unknown").to_string();
        Self {
            code,
            code_name,
            message: message.into(),
            labels,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.message)
    }
}

/// Why a typed record definition could not be turned into a `$jsonSchema` document.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaGenerationError {
    #[error("cannot mix a nested document type with another non-null type in a union")]
    MixedDocumentUnion,
    #[error("cannot mix an enum type with another non-null type in a union")]
    MixedEnumUnion,
    #[error("cannot mix a literal set with another non-null type in a union")]
    MixedLiteralUnion,
    #[error("unsupported field type: {0}")]
    UnsupportedType(String),
    #[error("top-level schema must be generated from a document-shaped record")]
    NotADocument,
}

/// GridFS-specific failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GridFsErrorKind {
    #[error("no gridfs file found for the given identifier")]
    FileNotFound,
    #[error("sha1 integrity check failed: expected {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// The variety of failure that occurred. See the crate-level error handling design for the
/// propagation policy associated with each kind.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The socket was closed, a read returned fewer bytes than requested, or a TLS handshake
    /// failed. Fatal: the owning connection must not be used again.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A framing invariant was violated: `responseTo` didn't match the in-flight request id,
    /// an unrecognized opcode was received, or decompression failed. Fatal.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The SCRAM handshake failed verification, or the server offered no mechanism this
    /// crate supports.
    #[error("authentication error: {message}")]
    Authentication { message: String },

    /// The server rejected a command or write outright.
    #[error("{0}")]
    Operation(OperationFailure),

    /// A BSON (de)serialization step failed.
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// BSON deserialization failed.
    #[error("bson deserialization error: {0}")]
    BsonDeserialize(#[from] bson::de::Error),

    /// The underlying OS-level I/O failed outside of the exact-read/write protocol checks.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A typed record definition could not be converted into a `$jsonSchema` document.
    #[error("schema generation error: {0}")]
    Schema(#[from] SchemaGenerationError),

    /// A GridFS operation failed.
    #[error("gridfs error: {0}")]
    GridFs(#[from] GridFsErrorKind),

    /// The supplied connection string could not be parsed.
    #[error("invalid connection string: {message}")]
    InvalidUri { message: String },

    /// The caller misused the API: an empty insert batch, reuse of a closed transaction, an
    /// unrecognized option, etc.
    #[error("usage error: {message}")]
    Usage { message: String },
}

/// An error produced by this crate.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport {
            message: message.into(),
        })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol {
            message: message.into(),
        })
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication {
            message: message.into(),
        })
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage {
            message: message.into(),
        })
    }

    pub(crate) fn operation(failure: OperationFailure) -> Self {
        Self::new(ErrorKind::Operation(failure))
    }

    /// If this error is an [`OperationFailure`], return it.
    pub fn as_operation_failure(&self) -> Option<&OperationFailure> {
        match &self.kind {
            ErrorKind::Operation(f) => Some(f),
            _ => None,
        }
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Self::new(ErrorKind::Bson(e))
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Self::new(ErrorKind::BsonDeserialize(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(e))
    }
}

impl From<SchemaGenerationError> for Error {
    fn from(e: SchemaGenerationError) -> Self {
        Self::new(ErrorKind::Schema(e))
    }
}

impl From<GridFsErrorKind> for Error {
    fn from(e: GridFsErrorKind) -> Self {
        Self::new(ErrorKind::GridFs(e))
    }
}

/// The static numeric-code → symbolic-name table, a read-only resource bundled with the
/// binary. Not exhaustive of the server's full error catalog — only the codes this crate's
/// own tests and documented scenarios rely on, plus the common ones an embedding
/// application is likely to branch on.
pub mod codes {
    use super::*;

    static TABLE: LazyLock<HashMap<i32, &'static str>> = LazyLock::new(|| {
        HashMap::from([
            (2, "BadValue"),
            (6, "HostUnreachable"),
            (7, "HostNotFound"),
            (9, "FailedToParse"),
            (11, "UserNotFound"),
            (13, "Unauthorized"),
            (18, "AuthenticationFailed"),
            (26, "NamespaceNotFound"),
            (43, "CursorNotFound"),
            (50, "MaxTimeMSExpired"),
            (59, "CommandNotFound"),
            (61, "ShardKeyNotFound"),
            (66, "ImmutableField"),
            (72, "InvalidOptions"),
            (89, "NetworkTimeout"),
            (91, "ShutdownInProgress"),
            (96, "OperationFailed"),
            (112, "WriteConflict"),
            (125, "TransactionAborted"),
            (134, "ExceededTimeLimit"),
            (189, "PrimarySteppedDown"),
            (211, "Keypattern"),
            (225, "TransactionTooOld"),
            (244, "TransactionAborted"),
            (251, "NoSuchTransaction"),
            (256, "IncompleteTransactionHistory"),
            (257, "DuplicateSession"),
            (261, "TooManyLogicalSessions"),
            (262, "ExceededTimeLimit"),
            (11000, "DuplicateKey"),
            (11600, "InterruptedAtShutdown"),
            (11602, "InterruptedDueToReplStateChange"),
            (13435, "NotPrimaryNoSecondaryOk"),
            (13436, "NotPrimaryOrSecondary"),
        ])
    });

    /// Look up the symbolic name for a server error code, if known.
    pub fn lookup(code: i32) -> Option<&'static str> {
        TABLE.get(&code).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn looks_up_known_codes() {
        assert_eq!(codes::lookup(11000), Some("DuplicateKey"));
        assert_eq!(codes::lookup(26), Some("NamespaceNotFound"));
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(codes::lookup(-1), None);
        let failure = OperationFailure::new(-1, "boom", vec![]);
        assert_eq!(failure.code_name, "Unknown");
    }

    #[test]
    fn transient_transaction_label_is_detected() {
        let failure = OperationFailure::new(
            251,
            "no such transaction",
            vec![TRANSIENT_TRANSACTION_ERROR.to_string()],
        );
        assert!(failure.has_label(TRANSIENT_TRANSACTION_ERROR));
        assert!(!failure.has_label("RetryableWriteError"));
    }
}
