//! Named POSIX semaphores and the semaphore-backed waiter.
//!
//! rustix has no binding for the `sem_open` family, so this is the one
//! place the crate talks to `libc` directly.
//!
//! The timed wait deliberately avoids `sem_timedwait`: it takes an
//! absolute `CLOCK_REALTIME` deadline (a wall-clock jump would distort the
//! timeout) and does not exist on macOS at all. Instead the deadline is
//! tracked on the monotonic clock and `sem_trywait` is polled with a short
//! sleep, which behaves identically on every Unix.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::error::{IpcError, Result};
use crate::flags::{OpenFlags, OpenMode};
use crate::name;

use super::waiter::{WaitOutcome, Waiter};

/// Interval between `sem_trywait` probes in the timed wait.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// A named counting semaphore shared between processes.
pub struct Semaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: POSIX semaphore handles may be used from any thread; the kernel
// serializes the operations.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates or opens a named semaphore, per `flags`. A created
    /// semaphore starts at `initial`; an opened one keeps its current
    /// value. The returned `bool` is true when this call created it.
    pub fn new(name: &str, flags: OpenFlags, perm: u32, initial: u32) -> Result<(Self, bool)> {
        name::sanitize(name)?;
        let c_name = CString::new(name::shm_name(name)).expect("sanitized name has no NUL");

        let (sem, created) = match flags.mode() {
            OpenMode::OpenOnly => (
                open_existing(&c_name).map_err(|err| IpcError::os("sem_open", name, err))?,
                false,
            ),
            OpenMode::CreateOnly => (
                create_exclusive(&c_name, perm, initial)
                    .map_err(|err| IpcError::os("sem_open", name, err))?,
                true,
            ),
            OpenMode::OpenOrCreate => loop {
                match create_exclusive(&c_name, perm, initial) {
                    Ok(sem) => break (sem, true),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(IpcError::os("sem_open", name, err)),
                }
                match open_existing(&c_name) {
                    Ok(sem) => break (sem, false),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(IpcError::os("sem_open", name, err)),
                }
            },
        };

        Ok((
            Self {
                sem,
                name: name.to_string(),
            },
            created,
        ))
    }

    /// The logical name this semaphore was opened with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decrements the semaphore, blocking until it is positive.
    pub fn wait(&self) -> Result<()> {
        self.down().map_err(|err| IpcError::os("sem_wait", &self.name, err))
    }

    /// Decrements the semaphore, giving up after `timeout`. Returns true
    /// on success, false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.down_timeout(timeout)
            .map_err(|err| IpcError::os("sem_trywait", &self.name, err))
    }

    /// Increments the semaphore, waking one blocked waiter if any.
    pub fn post(&self) -> Result<()> {
        self.up().map_err(|err| IpcError::os("sem_post", &self.name, err))
    }

    /// Releases this process's handle without touching the OS name.
    pub fn close(self) {}

    /// Removes the OS name so future opens fail with `DoesNotExist`.
    /// Processes that still hold the semaphore keep working. A name that
    /// is already absent is a success.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)?;
        let c_name = CString::new(name::shm_name(name)).expect("sanitized name has no NUL");
        // SAFETY: c_name is a valid NUL-terminated string.
        let rc = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(IpcError::os("sem_unlink", name, err))
        }
    }

    pub(crate) fn down(&self) -> io::Result<()> {
        loop {
            // SAFETY: sem is a live handle from sem_open.
            let rc = unsafe { libc::sem_wait(self.sem.as_ptr()) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub(crate) fn down_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let start = Instant::now();
        loop {
            // SAFETY: sem is a live handle from sem_open.
            let rc = unsafe { libc::sem_trywait(self.sem.as_ptr()) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => return Err(err),
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    pub(crate) fn up(&self) -> io::Result<()> {
        // SAFETY: sem is a live handle from sem_open.
        let rc = unsafe { libc::sem_post(self.sem.as_ptr()) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: sem came from sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

fn open_existing(name: &CString) -> io::Result<NonNull<libc::sem_t>> {
    // SAFETY: name is a valid NUL-terminated string.
    let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
    sem_result(sem)
}

fn create_exclusive(name: &CString, perm: u32, initial: u32) -> io::Result<NonNull<libc::sem_t>> {
    // SAFETY: name is a valid NUL-terminated string; the variadic tail
    // carries mode and initial value as sem_open requires with O_CREAT.
    let sem = unsafe {
        libc::sem_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL,
            perm as libc::c_uint,
            initial as libc::c_uint,
        )
    };
    sem_result(sem)
}

fn sem_result(sem: *mut libc::sem_t) -> io::Result<NonNull<libc::sem_t>> {
    if sem == libc::SEM_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(sem).ok_or_else(io::Error::last_os_error)
}

/// Waiter that parks on a named semaphore instead of a futex.
///
/// The shared word cannot be checked atomically with the sleep the way a
/// futex does it, so the check here is advisory: a wakeup that slips in
/// between load and `sem_wait` leaves the semaphore positive, and the next
/// `wait` returns immediately as a spurious wakeup. The mutex protocol
/// re-examines the word after every wakeup, so the extra pass is harmless.
pub(crate) struct SemaWaiter {
    word: NonNull<AtomicU32>,
    sem: Semaphore,
}

// SAFETY: the word lives in a shared mapping; the semaphore handle is
// already Send + Sync.
unsafe impl Send for SemaWaiter {}
unsafe impl Sync for SemaWaiter {}

impl SemaWaiter {
    /// # Safety
    ///
    /// `word` must point to an `AtomicU32` inside a shared mapping that
    /// outlives the waiter.
    pub(crate) unsafe fn new(word: NonNull<AtomicU32>, sem: Semaphore) -> Self {
        Self { word, sem }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: valid for self's lifetime per the constructor contract.
        unsafe { self.word.as_ref() }
    }
}

impl Waiter for SemaWaiter {
    fn wait(&self, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        if self.word().load(Ordering::Acquire) != expected {
            return Ok(WaitOutcome::Spurious);
        }
        match timeout {
            None => {
                self.sem.down()?;
                Ok(WaitOutcome::Woken)
            }
            Some(timeout) => {
                if self.sem.down_timeout(timeout)? {
                    Ok(WaitOutcome::Woken)
                } else {
                    Ok(WaitOutcome::TimedOut)
                }
            }
        }
    }

    fn wake(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            self.sem.up()?;
        }
        Ok(())
    }
}
