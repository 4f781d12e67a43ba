//! Mapped views of shared memory objects.
//!
//! A [`MemoryRegion`] exposes a byte range of a [`MemoryObject`] inside
//! this process's address space. The requested offset may be arbitrary:
//! the implementation aligns it down to the page (allocation granularity
//! on Windows), maps the padded range, and trims the visible slice back to
//! exactly what was asked for.
//!
//! The slice returned by [`MemoryRegion::data`] is valid until the region
//! is dropped or closed; Rust's borrow rules make use-after-unmap
//! unrepresentable in safe code. Regions must not be carried across
//! `fork` - re-map in the child instead.
//!
//! [`MemoryObject`]: crate::shm::MemoryObject

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::MemoryRegion;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::MemoryRegion;

/// Protection mode for a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable, shared with other mappers.
    ReadOnly,
    /// Readable and writable, shared with other mappers.
    ReadWrite,
    /// Readable and writable; writes stay private to this mapping.
    CopyOnWrite,
    /// Readable; the mapping is private, so later writes by others may not
    /// be observed.
    ReadPrivate,
}

impl Protection {
    pub(crate) const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::CopyOnWrite)
    }
}
