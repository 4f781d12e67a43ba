//! Windows mapping backend (`CreateFileMappingW` / `MapViewOfFile`).
//!
//! Views are created from the backing file handle per mapping, the way
//! boost.interprocess does it; the file-mapping handle itself is closed
//! as soon as the view exists, because the view keeps the section alive.

use std::io;
use std::os::windows::io::AsRawHandle;
use std::ptr::{NonNull, null};
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_COPY, FILE_MAP_READ, FILE_MAP_WRITE, FlushViewOfFile,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    UnmapViewOfFile,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::error::{IpcError, Result};
use crate::region::Protection;
use crate::shm::MemoryObject;

/// One process's view of a shared memory object.
pub struct MemoryRegion {
    base: NonNull<u8>,
    mapped_len: usize,
    /// Distance from the granularity-aligned view base to the requested
    /// offset.
    delta: usize,
    len: usize,
    prot: Protection,
}

// SAFETY: the view is plain shared memory with no thread affinity; races
// inside it are the concern of whoever interprets the bytes.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

/// View offsets must be multiples of the allocation granularity (64 KiB on
/// every shipping Windows), not the page size.
fn allocation_granularity() -> u64 {
    static GRANULARITY: OnceLock<u64> = OnceLock::new();
    *GRANULARITY.get_or_init(|| {
        // SAFETY: GetSystemInfo writes the whole struct and cannot fail.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        u64::from(info.dwAllocationGranularity)
    })
}

impl MemoryRegion {
    /// Maps `len` bytes of `object` starting at `offset`. See the Unix
    /// backend for the full contract; the two are interchangeable.
    pub fn map(
        object: &MemoryObject,
        prot: Protection,
        offset: u64,
        len: usize,
    ) -> Result<Self> {
        if len == 0 {
            return Err(IpcError::InvalidArgument("cannot map an empty region"));
        }
        let granularity = allocation_granularity();
        let aligned = offset - offset % granularity;
        let delta = (offset - aligned) as usize;
        let mapped_len = len + delta;

        let (page_prot, view_access) = match prot {
            Protection::ReadOnly | Protection::ReadPrivate => (PAGE_READONLY, FILE_MAP_READ),
            Protection::ReadWrite => (PAGE_READWRITE, FILE_MAP_WRITE),
            Protection::CopyOnWrite => (PAGE_WRITECOPY, FILE_MAP_COPY),
        };

        // SAFETY: the file handle is valid for &object's lifetime; a zero
        // size maps the whole file.
        let mapping: HANDLE = unsafe {
            CreateFileMappingW(
                object.file().as_raw_handle() as HANDLE,
                null(),
                page_prot,
                0,
                0,
                null(),
            )
        };
        if mapping.is_null() {
            return Err(IpcError::os(
                "CreateFileMappingW",
                object.name(),
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: mapping is a valid section handle; the offset halves and
        // length describe a range the section covers.
        let view = unsafe {
            MapViewOfFile(
                mapping,
                view_access,
                (aligned >> 32) as u32,
                aligned as u32,
                mapped_len,
            )
        };
        // The view holds its own reference to the section.
        // SAFETY: mapping came from CreateFileMappingW above.
        unsafe {
            CloseHandle(mapping);
        }
        let Some(base) = NonNull::new(view.Value.cast::<u8>()) else {
            return Err(IpcError::os(
                "MapViewOfFile",
                object.name(),
                io::Error::last_os_error(),
            ));
        };

        Ok(Self {
            base,
            mapped_len,
            delta,
            len,
            prot,
        })
    }

    /// Length of the visible slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty regions cannot be mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the first visible byte. Stable for the region's
    /// lifetime.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        // SAFETY: delta < mapped_len, so the offset stays inside the view.
        unsafe { self.base.as_ptr().add(self.delta) }
    }

    /// Mutable pointer to the first visible byte. Writing through it
    /// requires a writable protection mode.
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: as for as_ptr.
        unsafe { self.base.as_ptr().add(self.delta) }
    }

    /// The visible bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the view covers delta..delta+len and stays alive for
        // &self's lifetime.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The visible bytes, writable.
    ///
    /// # Panics
    ///
    /// Panics if the region was not mapped with a writable protection
    /// mode.
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(
            self.prot.is_writable(),
            "data_mut on a region mapped {:?}",
            self.prot
        );
        // SAFETY: as for data; &mut self gives exclusivity within this
        // process.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    /// Asks the OS to write dirty pages back to the backing file. Windows
    /// flushes are always asynchronous; `async_flush` is accepted for
    /// parity with the Unix backend.
    pub fn flush(&self, _async_flush: bool) -> Result<()> {
        // SAFETY: base/mapped_len describe exactly the view created in
        // map().
        let ok = unsafe { FlushViewOfFile(self.base.as_ptr().cast(), self.mapped_len) };
        if ok == 0 {
            return Err(IpcError::os(
                "FlushViewOfFile",
                "<region>",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    /// Unmaps the region. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let addr = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: self.base.as_ptr().cast(),
        };
        // SAFETY: addr is the base returned by MapViewOfFile and nothing
        // else unmaps it.
        unsafe {
            UnmapViewOfFile(addr);
        }
    }
}
