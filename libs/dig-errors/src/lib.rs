//! Workspace-wide error taxonomy.
//!
//! Every crate in the `dig-*` workspace converts its local failures into one
//! of the kinds below at its public boundary, so callers never need to
//! downcast across crates. This mirrors §7 of the specification exactly:
//! `ValidationError`, `NotFound`, `IntegrityError`, `TransientNetworkError`,
//! `AuthError`, `ConflictError`, `ResourceError`.

use std::fmt;
use thiserror::Error;

/// A conflict class reported by push preflight negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Local generation index is behind the remote's.
    RemoteAhead,
    /// Local and remote roots diverge at the same generation index.
    Diverged,
    /// Local and remote already agree; there is nothing to upload.
    NoChange,
    /// A refreshed root-history is not an extension of the previously
    /// cached one (on-chain reorg).
    Reorg,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::RemoteAhead => "remote_ahead",
            ConflictKind::Diverged => "diverged",
            ConflictKind::NoChange => "no_change",
            ConflictKind::Reorg => "reorg",
        };
        f.write_str(s)
    }
}

/// The single error type propagated across `dig-*` crate boundaries.
#[derive(Debug, Error)]
pub enum DigError {
    /// Malformed hex, wrong-length digest, or otherwise structurally
    /// invalid input. Fatal to the caller; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A key, root, or blob that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A blob hash mismatch, tree root mismatch, or foreign-tree root
    /// mismatch. Always triggers local deletion and peer blacklisting
    /// at the replication layer.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Timeout, connection reset, or 5xx from a peer. Retried with
    /// exponential backoff; after the retry budget is exhausted the peer
    /// is cooled down and the caller switches peers.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// 401/403 from a propagation server.
    #[error("auth error: {0}")]
    Auth(String),

    /// A push preflight conflict. Fatal to the push; reported to the
    /// operator.
    #[error("conflict error: {0}")]
    Conflict(ConflictKind),

    /// Out of disk, or an advisory lock could not be acquired. Fatal to
    /// the current task; retried only by restarting the process.
    #[error("resource error: {0}")]
    Resource(String),
}

impl DigError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DigError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DigError::NotFound(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        DigError::Integrity(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        DigError::TransientNetwork(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        DigError::Auth(msg.into())
    }

    pub fn conflict(kind: ConflictKind) -> Self {
        DigError::Conflict(kind)
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        DigError::Resource(msg.into())
    }

    /// True when this error represents a transient condition a caller
    /// should retry against a different peer.
    pub fn is_transient(&self) -> bool {
        matches!(self, DigError::TransientNetwork(_))
    }

    /// True when this error represents a tamper/corruption finding that
    /// must blacklist the source peer.
    pub fn is_integrity(&self) -> bool {
        matches!(self, DigError::Integrity(_))
    }

    /// CLI-facing exit code. The core exposes the kind verbatim; mapping
    /// it to a process exit code is the only thing the binary owns.
    pub fn exit_code(&self) -> i32 {
        match self {
            DigError::Validation(_) => 64,
            DigError::NotFound(_) => 65,
            DigError::Integrity(_) => 66,
            DigError::TransientNetwork(_) => 75,
            DigError::Auth(_) => 77,
            DigError::Conflict(_) => 78,
            DigError::Resource(_) => 69,
        }
    }
}

impl From<std::io::Error> for DigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => DigError::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::ConnectionReset => {
                DigError::TransientNetwork(e.to_string())
            }
            std::io::ErrorKind::OutOfMemory => DigError::Resource(e.to_string()),
            _ => DigError::Resource(e.to_string()),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type DigResult<T> = Result<T, DigError>;
