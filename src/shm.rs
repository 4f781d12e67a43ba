//! Named shared memory objects.
//!
//! A [`MemoryObject`] is a kernel-named region of memory that multiple
//! processes can open and map. On Unix systems with POSIX shared memory it
//! is backed by `shm_open`; on Windows and on Unixes without `shm_open`
//! (Android) it is emulated with a regular file under a shared temporary
//! directory, the way boost.interprocess does it. Both backends expose the
//! same surface, so the rest of the crate is written against a single
//! type.
//!
//! # Lifecycle
//!
//! Exactly one process *creates* an object (and sizes it); any number of
//! others *open* it. [`MemoryObject::create_or_open`] reports which role
//! this call ended up in, and the creator alone is expected to initialize
//! any shared state inside. [`MemoryObject::unlink`] removes the OS name:
//! future opens fail, while existing mappings stay valid until every
//! mapper closes - the POSIX `shm_unlink` model, which the file backend
//! reproduces with `remove_file`.

#[cfg(all(unix, not(target_os = "android")))]
mod posix;
#[cfg(all(unix, not(target_os = "android")))]
pub use posix::MemoryObject;

#[cfg(any(windows, target_os = "android"))]
mod file;
#[cfg(any(windows, target_os = "android"))]
pub use file::MemoryObject;
