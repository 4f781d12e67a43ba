//! Logical name validation and per-platform identifier resolution.
//!
//! Users address IPC objects by a short logical name with no path
//! separators. This module turns that name into whatever the platform
//! wants: a `/`-prefixed POSIX shared memory name, a file path under the
//! shared temporary directory, or (for mutexes) a derived state-object
//! name tagged with the waiter variant.
//!
//! Names are case-sensitive on Unix and case-insensitive on Windows; the
//! crate preserves whichever semantics the OS name table has.

/// Longest accepted logical name. POSIX caps shared memory names at 255
/// bytes; we leave room for the leading `/` and the waiter-variant suffix.
const NAME_MAX: usize = 249;

/// Rejects names the platform layers cannot represent.
pub(crate) fn sanitize(name: &str) -> crate::Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else if name.contains('/') || name.contains('\\') {
        "name must not contain path separators"
    } else if name.len() > NAME_MAX {
        "name is longer than 249 bytes"
    } else {
        return Ok(());
    };
    Err(crate::IpcError::NameInvalid {
        name: name.to_string(),
        reason,
    })
}

/// Resolves a logical name to a POSIX shared memory object name.
#[cfg(all(unix, not(target_os = "android")))]
pub(crate) fn shm_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// The directory that holds file-backed IPC objects. The `go-ipc` path is
/// kept for compatibility with existing deployments.
#[cfg(any(windows, target_os = "android"))]
pub(crate) fn ipc_dir() -> std::io::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join("go-ipc");
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    match builder.create(&dir) {
        Ok(()) => Ok(dir),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(dir),
        Err(err) => Err(err),
    }
}

/// Resolves a logical name to its file-backed object path.
#[cfg(any(windows, target_os = "android"))]
pub(crate) fn file_path(name: &str) -> std::io::Result<std::path::PathBuf> {
    Ok(ipc_dir()?.join(name))
}

/// Derives the name of a mutex's shared-state object.
///
/// The suffix tags the waiter variant (`"f"` futex, `"s"` semaphore) so
/// that differently-implemented mutexes with the same user name never
/// share a backing word.
#[cfg(unix)]
pub(crate) fn mutex_state_name(name: &str, variant: &str) -> String {
    format!("{name}{variant}")
}
