//! Error taxonomy shared by all IPC objects.
//!
//! Every fallible operation in this crate returns [`IpcError`]. OS failures
//! are classified into the stable variants below so callers can branch on
//! open-mode expectations (`AlreadyExists` / `DoesNotExist`) without
//! inspecting raw error codes; anything without a stable classification is
//! carried verbatim in [`IpcError::Os`].
//!
//! Interrupted syscalls (`EINTR`) are retried in place by the layer that
//! issued them and never surface here. Shared-state protocol corruption
//! (unlocking a mutex that is not locked) is not an error value at all: it
//! panics, because the on-disk protocol cannot recover.

use std::io;

use thiserror::Error;

/// Result alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Contextual errors produced by shared memory objects, regions, and
/// synchronization primitives.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The provided object name is syntactically unacceptable.
    #[error("invalid object name `{name}`: {reason}")]
    NameInvalid {
        name: String,
        reason: &'static str,
    },
    /// A create-only open found an object that already exists.
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    /// An open-only open found no object with this name.
    #[error("object `{0}` does not exist")]
    DoesNotExist(String),
    /// The OS refused access to the object.
    #[error("permission denied for `{0}`")]
    PermissionDenied(String),
    /// Kernel object table full, or no memory for the request.
    #[error("{op} failed for `{name}`: kernel resources exhausted")]
    ResourceExhausted {
        op: &'static str,
        name: String,
    },
    /// A caller mistake: zero size on create, unmappable length, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Any other OS-level failure, carried with the operation that hit it.
    #[error("{op} failed for `{name}`: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

impl IpcError {
    /// Classifies an OS error against the taxonomy above.
    ///
    /// `op` names the syscall for diagnostics; `name` is the logical object
    /// name the caller used, not the resolved OS path.
    pub(crate) fn os(op: &'static str, name: &str, source: impl Into<io::Error>) -> Self {
        let source: io::Error = source.into();
        let name = name.to_string();
        match source.kind() {
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(name),
            io::ErrorKind::NotFound => Self::DoesNotExist(name),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(name),
            io::ErrorKind::OutOfMemory => Self::ResourceExhausted { op, name },
            _ if is_table_full(&source) => Self::ResourceExhausted { op, name },
            _ => Self::Os { op, name, source },
        }
    }
}

/// Errno values that mean "kernel object table full" but have no stable
/// `io::ErrorKind` mapping.
#[cfg(unix)]
fn is_table_full(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOSPC)
    )
}

#[cfg(windows)]
fn is_table_full(_err: &io::Error) -> bool {
    false
}
