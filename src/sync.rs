//! Cross-process synchronization primitives.
//!
//! The portable entry point is [`Mutex`], an alias for the best
//! implementation the target offers:
//!
//! - [`FutexMutex`] on Linux and Android - a Drepper three-state word in
//!   shared memory, blocking on the kernel futex only under contention.
//! - [`SemaMutex`] on other Unixes - the same shared word, blocking on a
//!   named POSIX semaphore instead. Also available on Linux for
//!   deployments that mix runtimes.
//! - [`NamedMutex`] on Windows - the OS named mutex directly; the kernel
//!   object already blocks across processes, so no shared word is needed.
//!
//! All variants share one contract: `lock`/`try_lock`/`lock_timeout`/
//! `unlock`, a consuming `close` that releases this process's handle, and
//! `destroy`/`unlink` to remove the OS names. Unlocking a mutex that is
//! not locked is a fatal protocol violation and panics.

#[cfg(unix)]
mod lwmutex;
#[cfg(unix)]
mod waiter;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod futex;

#[cfg(all(unix, not(target_os = "android")))]
mod sema;
#[cfg(all(unix, not(target_os = "android")))]
pub use sema::Semaphore;

#[cfg(unix)]
mod mutex;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use mutex::FutexMutex;
#[cfg(all(unix, not(target_os = "android")))]
pub use mutex::SemaMutex;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NamedMutex;

/// The preferred mutex implementation for this target.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type Mutex = FutexMutex;
/// The preferred mutex implementation for this target.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub type Mutex = SemaMutex;
/// The preferred mutex implementation for this target.
#[cfg(windows)]
pub type Mutex = NamedMutex;

/// Size of a mutex's shared-state object: the `AtomicU32` protocol word at
/// offset 0, padded to a cache line so future fields cannot false-share.
#[cfg(unix)]
pub(crate) const MUTEX_STATE_SIZE: u64 = 64;
