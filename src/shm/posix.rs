//! POSIX shared memory backend (`shm_open` / `ftruncate` / `shm_unlink`).

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::shm;

use crate::error::{IpcError, Result};
use crate::flags::{OpenFlags, OpenMode};
use crate::name;
use crate::trace;

/// A named POSIX shared memory object.
///
/// Names are case-sensitive here; the Windows file backend inherits the
/// filesystem's case-insensitivity instead.
#[derive(Debug)]
pub struct MemoryObject {
    fd: OwnedFd,
    name: String,
}

impl MemoryObject {
    /// Creates or opens a shared memory object, per `flags`.
    ///
    /// The returned `bool` is true exactly when this call brought the OS
    /// object into existence; that caller is the *creator* and the object
    /// has been sized to `size` bytes. Opening an existing object keeps
    /// whatever size the creator set - `size` is not checked against it.
    ///
    /// # Errors
    ///
    /// - [`IpcError::NameInvalid`] for a malformed `name`.
    /// - [`IpcError::InvalidArgument`] when creation is possible and
    ///   `size` is zero.
    /// - [`IpcError::AlreadyExists`] for create-only on a taken name.
    /// - [`IpcError::DoesNotExist`] for open-only on a missing name.
    /// - Classified OS errors otherwise; if sizing fails after this call
    ///   created the object, the name is unlinked before returning.
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
        let path = name::shm_name(name);
        let mode = Mode::from_bits_truncate(perm);

        let mut open_flags = shm::OFlags::RDWR;
        if flags.is_truncate() {
            open_flags |= shm::OFlags::TRUNC;
        }

        let (fd, created) = match flags.mode() {
            OpenMode::OpenOnly => {
                let fd = shm::open(&path, open_flags, Mode::empty())
                    .map_err(|err| IpcError::os("shm_open", name, err))?;
                (fd, false)
            }
            OpenMode::CreateOnly => {
                let fd = shm::open(
                    &path,
                    open_flags | shm::OFlags::CREATE | shm::OFlags::EXCL,
                    mode,
                )
                .map_err(|err| IpcError::os("shm_open", name, err))?;
                (fd, true)
            }
            OpenMode::OpenOrCreate => loop {
                // Create-exclusive first so we learn which role we got.
                // Both arms can race with another process; retry until one
                // of them sticks.
                match shm::open(
                    &path,
                    open_flags | shm::OFlags::CREATE | shm::OFlags::EXCL,
                    mode,
                ) {
                    Ok(fd) => break (fd, true),
                    Err(err) if err == Errno::EXIST => {}
                    Err(err) => return Err(IpcError::os("shm_open", name, err)),
                }
                match shm::open(&path, open_flags, Mode::empty()) {
                    Ok(fd) => break (fd, false),
                    Err(err) if err == Errno::NOENT => continue,
                    Err(err) => return Err(IpcError::os("shm_open", name, err)),
                }
            },
        };

        if created {
            if let Err(err) = ftruncate(&fd, size) {
                drop(fd);
                let _ = shm::unlink(&path);
                return Err(IpcError::os("ftruncate", name, err));
            }
            trace::debug!(name, size, "created shared memory object");
        }

        Ok((
            Self {
                fd,
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
        let stat = fstat(&self.fd).map_err(|err| IpcError::os("fstat", &self.name, err))?;
        Ok(stat.st_size as u64)
    }

    /// Resizes the object. By convention only the creator calls this;
    /// openers must not truncate shared state other processes rely on.
    pub fn truncate(&self, size: u64) -> Result<()> {
        ftruncate(&self.fd, size).map_err(|err| IpcError::os("ftruncate", &self.name, err))
    }

    /// Releases this process's handle. Mappings created from the object
    /// stay valid, and the OS name is untouched. Consuming `self` makes a
    /// double close unrepresentable.
    pub fn close(self) {}

    /// Closes this handle and removes the OS name, like [`Self::unlink`].
    pub fn destroy(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        Self::unlink(&name)
    }

    /// Removes the OS name so future opens fail with `DoesNotExist`.
    /// Existing mappings stay valid until their owners close them. A name
    /// that is already absent is a success.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)?;
        match shm::unlink(name::shm_name(name)) {
            Ok(()) => {
                trace::debug!(name, "unlinked shared memory object");
                Ok(())
            }
            Err(err) if err == Errno::NOENT => Ok(()),
            Err(err) => Err(IpcError::os("shm_unlink", name, err)),
        }
    }
}

impl AsFd for MemoryObject {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! unwrap_or_skip {
        ($expr:expr) => {
            match $expr {
                Ok(value) => value,
                Err(IpcError::PermissionDenied(name)) => {
                    eprintln!("skipping: shared memory access denied for {name}");
                    return;
                }
                Err(err) => panic!("unexpected shared memory error: {err}"),
            }
        };
    }

    fn unique(tag: &str) -> String {
        format!("shmsync-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_close_open_close_destroy_roundtrip() {
        let name = unique("roundtrip");
        let _ = MemoryObject::unlink(&name);

        let (obj, created) = unwrap_or_skip!(MemoryObject::create_or_open(
            &name,
            OpenFlags::create_only(),
            0o600,
            4096,
        ));
        assert!(created);
        assert_eq!(obj.size().unwrap(), 4096);
        obj.close();

        let (obj, created) = MemoryObject::create_or_open(&name, OpenFlags::open_only(), 0, 0)
            .expect("reopen after close");
        assert!(!created);
        assert_eq!(obj.size().unwrap(), 4096);
        obj.close();

        MemoryObject::unlink(&name).expect("destroy");
    }

    #[test]
    fn create_only_fails_on_existing_name() {
        let name = unique("exclusive");
        let _ = MemoryObject::unlink(&name);

        let (obj, _) = unwrap_or_skip!(MemoryObject::create_or_open(
            &name,
            OpenFlags::create_only(),
            0o600,
            64,
        ));
        let err = MemoryObject::create_or_open(&name, OpenFlags::create_only(), 0o600, 64)
            .expect_err("second exclusive create must fail");
        assert!(matches!(err, IpcError::AlreadyExists(_)));

        obj.destroy().unwrap();
    }

    #[test]
    fn open_only_fails_on_missing_name() {
        let name = unique("missing");
        let _ = MemoryObject::unlink(&name);

        let err = MemoryObject::create_or_open(&name, OpenFlags::open_only(), 0, 0)
            .expect_err("open of a missing name must fail");
        assert!(matches!(err, IpcError::DoesNotExist(_)));
    }

    #[test]
    fn open_or_create_reports_role() {
        let name = unique("role");
        let _ = MemoryObject::unlink(&name);

        let (first, created) = unwrap_or_skip!(MemoryObject::create_or_open(
            &name,
            OpenFlags::open_or_create(),
            0o600,
            64,
        ));
        assert!(created);

        let (second, created) =
            MemoryObject::create_or_open(&name, OpenFlags::open_or_create(), 0o600, 64)
                .expect("open existing");
        assert!(!created);
        assert_eq!(second.size().unwrap(), 64);

        second.close();
        first.destroy().unwrap();
    }

    #[test]
    fn zero_size_create_is_rejected() {
        let err =
            MemoryObject::create_or_open(&unique("zero"), OpenFlags::open_or_create(), 0o600, 0)
                .expect_err("zero size must be rejected");
        assert!(matches!(err, IpcError::InvalidArgument(_)));
    }

    #[test]
    fn unlink_of_missing_name_is_ok() {
        MemoryObject::unlink(&unique("never-created")).expect("absent name is success");
    }
}
