//! Concrete cross-process mutexes: a lightweight mutex bound to a named
//! shared memory object.
//!
//! Each wrapper owns a 64-byte shared state object (named after the user's
//! name plus a waiter-variant tag), a read-write mapping of it, and a
//! [`LightMutex`] over the `AtomicU32` at offset 0. The process that
//! created the object initializes the word to `0`; openers attach without
//! writing. If construction fails partway, everything this call opened is
//! closed and everything it created is unlinked, so no OS state leaks.

use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use crate::error::Result;
use crate::flags::OpenFlags;
use crate::name;
use crate::region::{MemoryRegion, Protection};
use crate::shm::MemoryObject;
use crate::sync::MUTEX_STATE_SIZE;
use crate::trace;

use super::lwmutex::LightMutex;
#[cfg(any(target_os = "linux", target_os = "android"))]
use super::futex::FutexWaiter;
#[cfg(not(target_os = "android"))]
use super::sema::{SemaWaiter, Semaphore};

/// Creates (or opens) the shared state object for a mutex and maps its
/// protocol word read-write. Returns the mapping and whether this call
/// created the object.
fn map_state(state_name: &str, flags: OpenFlags, perm: u32) -> Result<(MemoryRegion, bool)> {
    let (object, created) =
        MemoryObject::create_or_open(state_name, flags, perm, MUTEX_STATE_SIZE)?;
    let region = match MemoryRegion::map(
        &object,
        Protection::ReadWrite,
        0,
        MUTEX_STATE_SIZE as usize,
    ) {
        Ok(region) => region,
        Err(err) => {
            object.close();
            if created {
                let _ = MemoryObject::unlink(state_name);
            }
            return Err(err);
        }
    };
    // The mapping keeps the memory alive; the descriptor is not needed
    // past this point.
    object.close();
    Ok((region, created))
}

/// The protocol word at offset 0 of the state mapping.
fn state_word(region: &MemoryRegion) -> NonNull<AtomicU32> {
    // The mapping starts at page-aligned offset 0, so the base satisfies
    // AtomicU32's alignment.
    NonNull::new(region.as_mut_ptr().cast::<AtomicU32>()).expect("mapped region base is non-null")
}

/// A cross-process mutex blocking on the kernel futex.
///
/// The fast path is a single compare-and-swap on a word in shared memory;
/// the kernel is entered only under contention. Two processes (or two
/// handles in one process) opened with the same name lock the same
/// conceptual mutex.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub struct FutexMutex {
    lwm: LightMutex<FutexWaiter>,
    _region: MemoryRegion,
    name: String,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl std::fmt::Debug for FutexMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutexMutex").field("name", &self.name).finish()
    }
}

// SAFETY: the shared word is only touched through atomics and the futex
// syscall; the mapping has no thread affinity.
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe impl Send for FutexMutex {}
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe impl Sync for FutexMutex {}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FutexMutex {
    /// Creates or opens the mutex named `name`, per `flags`. `perm` holds
    /// permission bits for a created state object; it is ignored when
    /// opening.
    pub fn new(name: &str, flags: OpenFlags, perm: u32) -> Result<Self> {
        name::sanitize(name)?;
        let state_name = name::mutex_state_name(name, "f");
        let (region, created) = map_state(&state_name, flags, perm)?;

        let word = state_word(&region);
        // SAFETY: the word lives inside `region`, which this struct owns
        // for as long as the waiter and lwmutex exist.
        let waiter = unsafe { FutexWaiter::new(word) };
        let lwm = unsafe { LightMutex::new(word, waiter) };
        if created {
            lwm.init();
        }
        trace::debug!(name, created, "futex mutex ready");

        Ok(Self {
            lwm,
            _region: region,
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
        self.lwm.lock();
    }

    /// One attempt to acquire the mutex; returns true on success. A false
    /// return leaves nothing to release.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.lwm.try_lock()
    }

    /// Acquires the mutex, giving up after `timeout`. Returns true on
    /// acquisition.
    #[must_use]
    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        self.lwm.lock_timeout(timeout)
    }

    /// Releases the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked; the shared protocol cannot
    /// recover from that.
    pub fn unlock(&self) {
        self.lwm.unlock();
    }

    /// Releases this process's handle (mapping and waiter). The OS object
    /// is untouched; other processes keep working. Consuming `self` makes
    /// a double close unrepresentable.
    pub fn close(self) {}

    /// Closes this handle and removes the OS name, like [`Self::unlink`].
    pub fn destroy(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        Self::unlink(&name)
    }

    /// Removes the OS state for the mutex named `name`. Handles that are
    /// still open keep working against the unlinked object; future opens
    /// fail with `DoesNotExist`. An absent name is a success.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)?;
        MemoryObject::unlink(&name::mutex_state_name(name, "f"))
    }
}

/// A cross-process mutex blocking on a named POSIX semaphore.
///
/// Same shared-word protocol as [`FutexMutex`]; only the slow path
/// differs. This is the portable Unix variant for kernels without a
/// futex, and the two never collide: their state objects carry different
/// variant tags.
#[cfg(not(target_os = "android"))]
pub struct SemaMutex {
    lwm: LightMutex<SemaWaiter>,
    _region: MemoryRegion,
    name: String,
}

#[cfg(not(target_os = "android"))]
impl std::fmt::Debug for SemaMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaMutex").field("name", &self.name).finish()
    }
}

// SAFETY: as for FutexMutex; the semaphore handle is process-shareable by
// design.
#[cfg(not(target_os = "android"))]
unsafe impl Send for SemaMutex {}
#[cfg(not(target_os = "android"))]
unsafe impl Sync for SemaMutex {}

#[cfg(not(target_os = "android"))]
impl SemaMutex {
    /// Creates or opens the mutex named `name`, per `flags`.
    pub fn new(name: &str, flags: OpenFlags, perm: u32) -> Result<Self> {
        name::sanitize(name)?;
        let state_name = name::mutex_state_name(name, "s");
        let (region, created) = map_state(&state_name, flags, perm)?;

        let sem = match Semaphore::new(name, flags, perm, 1) {
            Ok((sem, _)) => sem,
            Err(err) => {
                region.close();
                if created {
                    let _ = MemoryObject::unlink(&state_name);
                }
                return Err(err);
            }
        };

        let word = state_word(&region);
        // SAFETY: the word lives inside `region`, which this struct owns
        // for as long as the waiter and lwmutex exist.
        let waiter = unsafe { SemaWaiter::new(word, sem) };
        let lwm = unsafe { LightMutex::new(word, waiter) };
        if created {
            lwm.init();
        }
        trace::debug!(name, created, "semaphore mutex ready");

        Ok(Self {
            lwm,
            _region: region,
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
        self.lwm.lock();
    }

    /// One attempt to acquire the mutex; returns true on success.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.lwm.try_lock()
    }

    /// Acquires the mutex, giving up after `timeout`. Returns true on
    /// acquisition.
    #[must_use]
    pub fn lock_timeout(&self, timeout: Duration) -> bool {
        self.lwm.lock_timeout(timeout)
    }

    /// Releases the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        self.lwm.unlock();
    }

    /// Releases this process's handle (mapping and semaphore). The OS
    /// objects are untouched.
    pub fn close(self) {}

    /// Closes this handle and removes the OS names, like [`Self::unlink`].
    pub fn destroy(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        Self::unlink(&name)
    }

    /// Removes the OS state (shared word and semaphore) for the mutex
    /// named `name`. An absent name is a success.
    pub fn unlink(name: &str) -> Result<()> {
        name::sanitize(name)?;
        MemoryObject::unlink(&name::mutex_state_name(name, "s"))?;
        Semaphore::unlink(name)
    }
}
