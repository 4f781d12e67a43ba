//! Windows cross-process mutex over the OS named mutex.
//!
//! The kernel object already blocks across processes, so the shared-word
//! protocol the Unix variants need is deliberately skipped here; `lock`
//! and `unlock` collapse to `WaitForSingleObject` and `ReleaseMutex`.
//! Names are case-insensitive, matching the OS name table.

use std::io;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, GetLastError, HANDLE, WAIT_ABANDONED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, INFINITE, MUTEX_ALL_ACCESS, OpenMutexW, ReleaseMutex, WaitForSingleObject,
};

use crate::error::{IpcError, Result};
use crate::flags::{OpenFlags, OpenMode};
use crate::name;
use crate::trace;

/// A named OS mutex.
///
/// Windows mutexes are owned per-thread: the thread that locked must be
/// the one that unlocks. The kernel destroys the name with the last
/// handle, so there is nothing for `destroy` to do beyond closing.
pub struct NamedMutex {
    handle: HANDLE,
    name: String,
}

// SAFETY: kernel handles may be used from any thread; the per-thread
// ownership rule above is about lock/unlock pairing, not handle access.
unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(Some(0)).collect()
}

impl NamedMutex {
    /// Creates or opens the mutex named `name`, per `flags`. `perm` is
    /// accepted for signature parity with the Unix variants and ignored;
    /// the object gets the caller's default security descriptor.
    pub fn new(name: &str, flags: OpenFlags, _perm: u32) -> Result<Self> {
        name::sanitize(name)?;
        let wide_name = wide(name);

        let handle = match flags.mode() {
            OpenMode::OpenOnly => {
                // SAFETY: wide_name is NUL-terminated and outlives the call.
                let handle = unsafe { OpenMutexW(MUTEX_ALL_ACCESS, 0, wide_name.as_ptr()) };
                if handle.is_null() {
                    // SAFETY: trivially safe; reads the thread's last error.
                    let code = unsafe { GetLastError() };
                    let err = if code == ERROR_FILE_NOT_FOUND {
                        IpcError::DoesNotExist(name.to_string())
                    } else {
                        IpcError::os("OpenMutexW", name, io::Error::from_raw_os_error(code as i32))
                    };
                    return Err(err);
                }
                handle
            }
            OpenMode::CreateOnly => {
                // SAFETY: as above; a null security descriptor is allowed.
                let handle =
                    unsafe { CreateMutexW(std::ptr::null(), 0, wide_name.as_ptr()) };
                // CreateMutexW hands back the existing object on a name
                // clash; exclusive creation has to check for itself.
                // SAFETY: trivially safe.
                let clashed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
                if handle.is_null() {
                    return Err(IpcError::os(
                        "CreateMutexW",
                        name,
                        io::Error::last_os_error(),
                    ));
                }
                if clashed {
                    // SAFETY: handle came from CreateMutexW above.
                    unsafe {
                        CloseHandle(handle);
                    }
                    return Err(IpcError::AlreadyExists(name.to_string()));
                }
                handle
            }
            OpenMode::OpenOrCreate => {
                // SAFETY: as above.
                let handle =
                    unsafe { CreateMutexW(std::ptr::null(), 0, wide_name.as_ptr()) };
                if handle.is_null() {
                    return Err(IpcError::os(
                        "CreateMutexW",
                        name,
                        io::Error::last_os_error(),
                    ));
                }
                handle
            }
        };
        trace::debug!(name, "named mutex ready");

        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    /// The logical name this mutex was opened with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the mutex, blocking until it is available.
    pub fn lock(&self) {
        self.wait(INFINITE);
    }

    /// One attempt to acquire the mutex; returns true on success.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.try_wait(0)
    }

    /// Acquires the mutex, giving up after `timeout`. Returns true on
    /// acquisition.
    #[must_use]
    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        // INFINITE is the all-ones sentinel; clamp just below it.
        let millis = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
        self.try_wait(millis)
    }

    fn wait(&self, millis: u32) {
        if !self.try_wait(millis) {
            unreachable!("infinite wait neither acquired nor failed");
        }
    }

    fn try_wait(&self, millis: u32) -> bool {
        // SAFETY: handle is a live mutex handle for self's lifetime.
        let rc = unsafe { WaitForSingleObject(self.handle, millis) };
        match rc {
            WAIT_OBJECT_0 => true,
            // The previous owner died while holding the mutex; ownership
            // transfers to us, and the protected state deserves suspicion.
            WAIT_ABANDONED => true,
            WAIT_TIMEOUT => false,
            _ => {
                let err = io::Error::last_os_error();
                trace::error!(name = %self.name, %err, "WaitForSingleObject failed");
                panic!("WaitForSingleObject failed for mutex `{}`: {err}", self.name);
            }
        }
    }

    /// Releases the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not own the mutex; that is a
    /// protocol violation the OS refuses to hide.
    pub fn unlock(&self) {
        // SAFETY: handle is a live mutex handle.
        let ok = unsafe { ReleaseMutex(self.handle) };
        if ok == 0 {
            let err = io::Error::last_os_error();
            trace::error!(name = %self.name, %err, "ReleaseMutex refused");
            panic!("unlock of a mutex `{}` this thread does not own: {err}", self.name);
        }
    }

    /// Releases this process's handle. Consuming `self` makes a double
    /// close unrepresentable.
    pub fn close(self) {}

    /// Closes this handle. The kernel removes the name once the last
    /// handle anywhere is gone, which is this platform's `destroy`.
    pub fn destroy(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    /// Nothing to unlink: the kernel owns the lifetime of the name. Kept
    /// for signature parity with the Unix variants.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        // SAFETY: handle came from Create/OpenMutexW and is closed once.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}
