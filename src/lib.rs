//! Cross-process synchronization primitives backed by named shared
//! memory.
//!
//! # Overview
//!
//! - [`MemoryObject`] - a kernel-named region of memory that multiple
//!   processes can create, open, size, and unlink.
//! - [`MemoryRegion`] - one process's mapped view of such an object, at a
//!   chosen offset, length, and [`Protection`] mode.
//! - [`Mutex`] - a cross-process mutex built from a single shared word
//!   plus a kernel blocking primitive: the futex on Linux and Android
//!   ([`FutexMutex`]), a named POSIX semaphore on other Unixes
//!   ([`SemaMutex`]), and the OS named mutex on Windows
//!   ([`NamedMutex`][sync::NamedMutex]).
//!
//! # Example
//!
//! ```no_run
//! use shmsync::{Mutex, OpenFlags};
//!
//! // Process A creates the mutex; process B runs the same code and
//! // attaches to the existing one.
//! let m = Mutex::new("build-lock", OpenFlags::open_or_create(), 0o644)?;
//!
//! m.lock();
//! // ... the critical section is exclusive across processes ...
//! m.unlock();
//!
//! // Drop (or close) releases this process's handle; the OS object stays
//! // until someone unlinks it.
//! Mutex::unlink("build-lock")?;
//! # Ok::<(), shmsync::IpcError>(())
//! ```
//!
//! # Creator and opener
//!
//! For every named object exactly one process is the *creator*: the one
//! whose open actually brought the OS object into existence. Only the
//! creator sizes the object and initializes shared state inside it;
//! openers attach without writing. The mutex constructors handle this
//! split internally, so `open_or_create` from any number of processes
//! just works.
//!
//! Any process may unlink a name. Handles and mappings that already exist
//! keep working; new opens fail until somebody creates the name again -
//! the POSIX `shm_unlink` model on every platform.

pub mod error;
pub mod flags;
mod name;
pub mod region;
pub mod shm;
pub mod sync;
mod trace;

pub use error::{IpcError, Result};
pub use flags::{OpenFlags, OpenMode};
pub use region::{MemoryRegion, Protection};
pub use shm::MemoryObject;
pub use sync::Mutex;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use sync::FutexMutex;
#[cfg(all(unix, not(target_os = "android")))]
pub use sync::{SemaMutex, Semaphore};
#[cfg(windows)]
pub use sync::NamedMutex;
pub use trace::init_tracing;
