use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// What went wrong, independent of how badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // ---
    #[error("stream not initialized")]
    Uninitialized,

    /// The message was stamped with a session id that no longer matches the
    /// stream's current session epoch.
    #[error("invalid session")]
    InvalidSession,

    #[error("operation expired")]
    OperationExpired,

    /// Never arms the stream error window — credentials may be refreshed at
    /// any moment, so an immediate retry must stay possible.
    #[error("authentication failed")]
    AuthFailed,

    #[error("connection error")]
    ConnectionError,

    #[error("stream broken")]
    StreamBroken,

    #[error("fatal stream error")]
    FatalError,

    #[error("query not supported")]
    QueryNotSupported,

    #[error("checksum error")]
    CheckSumError,

    #[error("error response from server")]
    ErrorResponse,

    #[error("local error")]
    LocalError,

    #[error("operation interrupted")]
    OperationInterrupted,

    #[error("malformed message")]
    InvalidMessage,
}

// ---------------------------------------------------------------------------
// XrdError
// ---------------------------------------------------------------------------

/// An error status with a severity bit.
///
/// Severity is orthogonal to the kind: a `ConnectionError` may be
/// recoverable (retry policy applies) or fatal (the retry budget is spent,
/// or the failure cannot possibly clear on its own).  Statuses are cloned
/// freely — the same status is reported to every handler drained from an
/// out-queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct XrdError {
    // ---
    kind: ErrorKind,
    fatal: bool,
}

// ---

impl XrdError {
    // ---
    /// A recoverable error of the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, fatal: false }
    }

    /// A fatal error of the given kind.  Fatal means: do not retry.
    pub fn fatal(kind: ErrorKind) -> Self {
        Self { kind, fatal: true }
    }

    // ---

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    // ---

    /// Escalate to fatal severity, keeping the kind.
    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

// ---

pub type Result<T> = std::result::Result<T, XrdError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
