//! The [`EngineError`] kind enum.
//!
//! Call sites propagate with `anyhow::Result` and `fn_error_context::context`
//! for the human-readable chain; this enum exists so callers that need to
//! match on *category* (for example the daemon boundary, which maps errors
//! onto D-Bus-ish reply codes) can do so without parsing strings.

use thiserror::Error;

/// The kind of an engine error, grouped by the categories in the error
/// handling design: input validation, policy violations, resource failures,
/// state conflicts, and on-disk consistency problems.
#[derive(Debug, Error)]
pub enum EngineError {
    // --- Input ---
    /// The origin document failed validation (e.g. an invariant in §3 was violated).
    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),
    /// A refspec string did not parse to any known variant.
    #[error("Invalid refspec: {0}")]
    InvalidRefspec(String),
    /// Two or more requested options cannot be satisfied together.
    #[error("Conflicting options: {0}")]
    ConflictingOptions(String),
    /// A package name was requested that the resolver does not know about.
    #[error("Unknown package: {0}")]
    UnknownPackage(String),
    /// A repo name was requested that is not configured.
    #[error("Repo(s) not found: {0:?}")]
    RepoNotFound(Vec<String>),
    /// The caller asked to add something already present.
    #[error("Already requested: {0}")]
    AlreadyRequested(String),
    /// The caller asked to remove a package that isn't layered.
    #[error("Not layered: {0}")]
    NotLayered(String),

    // --- Policy ---
    /// An RPM file entry claims non-root ownership, which this engine cannot translate.
    #[error("Non-root ownership unsupported: {0}")]
    NonRootOwnershipUnsupported(String),
    /// An `initramfs-etc` path escaped `/etc`.
    #[error("initramfs-etc path outside /etc: {0}")]
    InitramfsEtcOutsideEtc(String),
    /// Two packages claim the same path with differing content during overlay.
    #[error("Layer conflict on {path}: {a} vs {b}")]
    LayerConflict {
        /// The conflicting path.
        path: String,
        /// The first package providing `path`.
        a: String,
        /// The second package providing `path`.
        b: String,
    },
    /// The SELinux policy could not be loaded from the target root.
    #[error("Failed to load SELinux policy: {0}")]
    PolicyLoadFailure(String),
    /// GPG/signature verification of fetched content failed.
    #[error("Signature verification failed: {0}")]
    SignatureVerifyFailed(String),

    // --- Resource ---
    /// A network operation (metadata or payload fetch) failed.
    #[error("Network error: {0}")]
    NetworkError(String),
    /// The target filesystem ran out of space.
    #[error("Disk full: {0}")]
    DiskFull(String),
    /// The object store reported an I/O failure.
    #[error("Store I/O error: {0}")]
    StoreIoError(String),
    /// A sandboxed subprocess (depmod/dracut/semodule) failed to spawn.
    #[error("Failed to spawn sandboxed subprocess: {0}")]
    SandboxSpawnFailed(String),

    // --- State ---
    /// No deployment is currently booted.
    #[error("No booted deployment")]
    NoBootedDeployment,
    /// No rollback deployment is available.
    #[error("No rollback deployment")]
    NoRollbackDeployment,
    /// A staged deployment already exists and the request conflicts with it.
    #[error("A staged deployment already exists")]
    StagedDeploymentExists,
    /// Another transaction is already active on this sysroot.
    #[error("A transaction is already in progress")]
    TransactionInProgress,
    /// The transaction was cancelled by its caller.
    #[error("Cancelled")]
    Cancelled,

    // --- Consistency ---
    /// The new root's `/etc/passwd` disagrees with policy relative to the prior source.
    #[error("passwd mismatch: {0}")]
    PasswdMismatch(String),
    /// The new root's `/etc/group` disagrees with policy relative to the prior source.
    #[error("group mismatch: {0}")]
    GroupMismatch(String),
    /// Two distinct input sets produced the same inputhash.
    #[error("inputhash collision: {0}")]
    InputhashCollision(String),
}

impl EngineError {
    /// A coarse category name, useful for telemetry and daemon reply mapping.
    pub fn category(&self) -> &'static str {
        use EngineError::*;
        match self {
            InvalidOrigin(_)
            | InvalidRefspec(_)
            | ConflictingOptions(_)
            | UnknownPackage(_)
            | RepoNotFound(_)
            | AlreadyRequested(_)
            | NotLayered(_) => "input",
            NonRootOwnershipUnsupported(_)
            | InitramfsEtcOutsideEtc(_)
            | LayerConflict { .. }
            | PolicyLoadFailure(_)
            | SignatureVerifyFailed(_) => "policy",
            NetworkError(_) | DiskFull(_) | StoreIoError(_) | SandboxSpawnFailed(_) => "resource",
            NoBootedDeployment
            | NoRollbackDeployment
            | StagedDeploymentExists
            | TransactionInProgress
            | Cancelled => "state",
            PasswdMismatch(_) | GroupMismatch(_) | InputhashCollision(_) => "consistency",
        }
    }
}
