//! Unix mapping backend (`mmap` / `msync` / `munmap`).

use std::ptr::{NonNull, null_mut};

use rustix::mm::{MapFlags, MsyncFlags, ProtFlags, mmap, msync, munmap};

use crate::error::{IpcError, Result};
use crate::region::Protection;
use crate::shm::MemoryObject;

/// One process's view of a shared memory object.
#[derive(Debug)]
pub struct MemoryRegion {
    base: NonNull<u8>,
    mapped_len: usize,
    /// Distance from the page-aligned mapping base to the requested offset.
    delta: usize,
    len: usize,
    prot: Protection,
}

// SAFETY: the mapping is plain shared memory with no thread affinity. Data
// races inside it are the concern of whoever interprets the bytes (the
// mutex layer goes through atomics); handing the region itself to another
// thread is fine.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Maps `len` bytes of `object` starting at `offset`.
    ///
    /// `offset` does not need to be page-aligned; the mapping is padded
    /// down to the page boundary and the visible slice trimmed back.
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidArgument`] for a zero `len`, classified OS
    /// errors if `mmap` refuses the request.
    pub fn map(
        object: &MemoryObject,
        prot: Protection,
        offset: u64,
        len: usize,
    ) -> Result<Self> {
        if len == 0 {
            return Err(IpcError::InvalidArgument("cannot map an empty region"));
        }
        let page = rustix::param::page_size() as u64;
        let aligned = offset - offset % page;
        let delta = (offset - aligned) as usize;
        let mapped_len = len + delta;

        let (prot_flags, map_flags) = match prot {
            Protection::ReadOnly => (ProtFlags::READ, MapFlags::SHARED),
            Protection::ReadWrite => (ProtFlags::READ | ProtFlags::WRITE, MapFlags::SHARED),
            Protection::CopyOnWrite => (ProtFlags::READ | ProtFlags::WRITE, MapFlags::PRIVATE),
            Protection::ReadPrivate => (ProtFlags::READ, MapFlags::PRIVATE),
        };

        // SAFETY: a fresh mapping at a kernel-chosen address aliases no
        // existing Rust object; the fd is valid for the duration of the
        // call and the kernel validates the range.
        let ptr = unsafe { mmap(null_mut(), mapped_len, prot_flags, map_flags, object, aligned) }
            .map_err(|err| IpcError::os("mmap", object.name(), err))?;

        // SAFETY: mmap never returns null on success.
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
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
        // SAFETY: delta < mapped_len, so the offset stays inside the
        // mapping.
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
    ///
    /// Other processes may be writing concurrently; treat the contents as
    /// volatile unless a protocol (such as the mutex word) says otherwise.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the mapping covers delta..delta+len and stays alive for
        // &self's lifetime.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The visible bytes, writable.
    ///
    /// # Panics
    ///
    /// Panics if the region was not mapped with a writable protection
    /// mode; writing through a read-only mapping faults anyway, so this
    /// fails loudly and early.
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

    /// Asks the OS to write dirty pages back to the backing object.
    /// Synchronous unless `async_flush` is set. A no-op for purely
    /// anonymous shared memory.
    pub fn flush(&self, async_flush: bool) -> Result<()> {
        let flags = if async_flush {
            MsyncFlags::ASYNC
        } else {
            MsyncFlags::SYNC
        };
        // SAFETY: base/mapped_len describe exactly the mapping created in
        // map(), and the base is page-aligned as msync requires.
        unsafe { msync(self.base.as_ptr().cast(), self.mapped_len, flags) }
            .map_err(|err| IpcError::os("msync", "<region>", err))
    }

    /// Unmaps the region. Equivalent to dropping it; consuming `self`
    /// makes a double unmap unrepresentable.
    pub fn close(self) {}
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: base/mapped_len came from a successful mmap and nothing
        // else unmaps them.
        unsafe {
            let _ = munmap(self.base.as_ptr().cast(), self.mapped_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OpenFlags;

    fn unique(tag: &str) -> String {
        format!("shmsync-test-{tag}-{}", std::process::id())
    }

    fn scratch_object(tag: &str, size: u64) -> Option<MemoryObject> {
        let name = unique(tag);
        let _ = MemoryObject::unlink(&name);
        match MemoryObject::create_or_open(&name, OpenFlags::create_only(), 0o600, size) {
            Ok((obj, _)) => Some(obj),
            Err(IpcError::PermissionDenied(name)) => {
                eprintln!("skipping: shared memory access denied for {name}");
                None
            }
            Err(err) => panic!("unexpected shared memory error: {err}"),
        }
    }

    #[test]
    fn writes_are_visible_through_a_second_mapping() {
        let Some(obj) = scratch_object("region-rw", 4096) else {
            return;
        };

        let mut writer = MemoryRegion::map(&obj, Protection::ReadWrite, 0, 4096).unwrap();
        writer.data_mut()[0] = 0xAB;
        writer.data_mut()[4095] = 0xCD;

        let reader = MemoryRegion::map(&obj, Protection::ReadOnly, 0, 4096).unwrap();
        assert_eq!(reader.data()[0], 0xAB);
        assert_eq!(reader.data()[4095], 0xCD);

        reader.close();
        writer.close();
        obj.destroy().unwrap();
    }

    #[test]
    fn unaligned_offset_is_trimmed() {
        let Some(obj) = scratch_object("region-trim", 8192) else {
            return;
        };

        let mut whole = MemoryRegion::map(&obj, Protection::ReadWrite, 0, 8192).unwrap();
        whole.data_mut()[100] = 42;
        whole.data_mut()[101] = 43;

        // 100 is nowhere near page-aligned; the visible slice must still
        // start exactly at byte 100.
        let view = MemoryRegion::map(&obj, Protection::ReadOnly, 100, 16).unwrap();
        assert_eq!(view.len(), 16);
        assert_eq!(view.data()[0], 42);
        assert_eq!(view.data()[1], 43);

        view.close();
        whole.close();
        obj.destroy().unwrap();
    }

    #[test]
    fn copy_on_write_stays_private() {
        let Some(obj) = scratch_object("region-cow", 4096) else {
            return;
        };

        let mut shared = MemoryRegion::map(&obj, Protection::ReadWrite, 0, 4096).unwrap();
        shared.data_mut()[0] = 1;

        let mut cow = MemoryRegion::map(&obj, Protection::CopyOnWrite, 0, 4096).unwrap();
        cow.data_mut()[0] = 99;

        assert_eq!(shared.data()[0], 1, "private write leaked to the object");
        assert_eq!(cow.data()[0], 99);

        cow.close();
        shared.close();
        obj.destroy().unwrap();
    }

    #[test]
    fn empty_region_is_rejected() {
        let Some(obj) = scratch_object("region-empty", 4096) else {
            return;
        };
        let err = MemoryRegion::map(&obj, Protection::ReadOnly, 0, 0)
            .expect_err("zero-length map must fail");
        assert!(matches!(err, IpcError::InvalidArgument(_)));
        obj.destroy().unwrap();
    }

    #[test]
    fn flush_succeeds_on_shared_mapping() {
        let Some(obj) = scratch_object("region-flush", 4096) else {
            return;
        };
        let mut region = MemoryRegion::map(&obj, Protection::ReadWrite, 0, 4096).unwrap();
        region.data_mut()[7] = 7;
        region.flush(false).unwrap();
        region.flush(true).unwrap();
        region.close();
        obj.destroy().unwrap();
    }
}
