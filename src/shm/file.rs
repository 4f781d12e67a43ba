//! File-backed shared memory for platforms without `shm_open`.
//!
//! Windows and Android emulate named shared memory with regular files
//! under the shared temporary directory; the mapping layer turns them into
//! shared views. Removing the file gives the POSIX unlink semantics:
//! future opens fail while live mappings keep working.
//!
//! On Windows the backing filesystem is case-insensitive, so object names
//! are too.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::error::{IpcError, Result};
use crate::flags::{OpenFlags, OpenMode};
use crate::name;
use crate::trace;

/// A named shared memory object backed by a regular file.
pub struct MemoryObject {
    file: File,
    name: String,
}

impl MemoryObject {
    /// Creates or opens a file-backed object, per `flags`. See the POSIX
    /// backend for the full contract; the two are interchangeable.
    pub fn create_or_open(
        name: &str,
        flags: OpenFlags,
        perm: u32,
        size: u64,
    ) -> Result<(Self, bool)> {
        name::sanitize(name)?;
        if size == 0 && flags.mode() != OpenMode::OpenOnly {
            return Err(IpcError::InvalidArgument(
                "size must be non-zero when the object may be created",
            ));
        }
        let path = name::file_path(name).map_err(|err| IpcError::os("mkdir", name, err))?;

        let (file, created) = match flags.mode() {
            OpenMode::OpenOnly => {
                let file = open_existing(&path, flags)
                    .map_err(|err| IpcError::os("open", name, err))?;
                (file, false)
            }
            OpenMode::CreateOnly => {
                let file = create_exclusive(&path, perm)
                    .map_err(|err| IpcError::os("open", name, err))?;
                (file, true)
            }
            OpenMode::OpenOrCreate => loop {
                match create_exclusive(&path, perm) {
                    Ok(file) => break (file, true),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(IpcError::os("open", name, err)),
                }
                match open_existing(&path, flags) {
                    Ok(file) => break (file, false),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(IpcError::os("open", name, err)),
                }
            },
        };

        if created {
            if let Err(err) = file.set_len(size) {
                drop(file);
                let _ = std::fs::remove_file(&path);
                return Err(IpcError::os("set_len", name, err));
            }
            trace::debug!(name, size, "created file-backed memory object");
        }

        Ok((
            Self {
                file,
                name: name.to_string(),
            },
            created,
        ))
    }

    /// The logical name this object was opened with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current size of the object in bytes.
    pub fn size(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|err| IpcError::os("stat", &self.name, err))?;
        Ok(meta.len())
    }

    /// Resizes the object. By convention only the creator calls this.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|err| IpcError::os("set_len", &self.name, err))
    }

    /// Releases this process's handle without touching the OS name.
    pub fn close(self) {}

    /// Closes this handle and removes the OS name, like [`Self::unlink`].
    pub fn destroy(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        Self::unlink(&name)
    }

    /// Removes the backing file so future opens fail with `DoesNotExist`.
    /// Live mappings stay valid. A name that is already absent is a
    /// success.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)?;
        let path = name::file_path(name).map_err(|err| IpcError::os("mkdir", name, err))?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                trace::debug!(name, "removed file-backed memory object");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IpcError::os("remove_file", name, err)),
        }
    }

    #[cfg(windows)]
    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(unix)]
impl std::os::fd::AsFd for MemoryObject {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        use std::os::fd::AsFd as _;
        self.file.as_fd()
    }
}

fn open_existing(path: &Path, flags: OpenFlags) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(flags.is_truncate())
        .open(path)
}

fn create_exclusive(path: &Path, perm: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(perm);
    }
    #[cfg(windows)]
    let _ = perm; // permission bits have no meaning here
    options.open(path)
}
