//! Shared-memory blocks and their integration into the object model.
//!
//! A [`SharedMemory`] block is an anonymous memory object (`memfd_create`)
//! sized once at allocation. Wrapping a block in an [`Object`] produces a
//! `shmem` value whose descriptor travels out-of-band with the frame; both
//! sides map the same pages, so writes are visible across the connection
//! without copying the region through the wire.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, RpcError};
use crate::object::{FdValue, Object, ShmemValue};

/// An anonymous, mappable memory object.
#[derive(Debug)]
pub struct SharedMemory {
    fd: FdValue,
    size: usize,
}

impl SharedMemory {
    /// Allocate a fresh block of `size` bytes.
    pub fn alloc(size: usize) -> Result<SharedMemory> {
        if size == 0 {
            return Err(RpcError::invalid_arguments(
                "shared memory blocks cannot be empty",
            ));
        }

        let raw = unsafe { libc::memfd_create(c"colloquy-shmem".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(RpcError::internal(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(RpcError::internal(format!(
                "ftruncate failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(SharedMemory {
            fd: FdValue::owned(fd),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the whole block read/write.
    pub fn map(&self) -> Result<Mapping> {
        map_region(self.fd.raw()?, self.size, 0)
    }

    pub(crate) fn fd(&self) -> &FdValue {
        &self.fd
    }
}

/// A live read/write mapping, unmapped on drop.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; synchronisation of its
// contents is the caller's responsibility, same as any &[u8]/&mut [u8].
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live MAP_SHARED mapping.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live MAP_SHARED mapping and we hold the
        // unique handle.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len were returned by mmap.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn map_region(raw: RawFd, size: usize, offset: usize) -> Result<Mapping> {
    if size == 0 {
        return Err(RpcError::invalid_arguments("cannot map an empty region"));
    }
    if offset % page_size() != 0 {
        return Err(RpcError::invalid_arguments(format!(
            "mapping offset {} is not page-aligned",
            offset
        )));
    }

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            raw,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(RpcError::internal(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(Mapping {
        ptr: ptr as *mut u8,
        len: size,
    })
}

impl Object {
    /// Wrap a shared memory block. The block's descriptor is shared with the
    /// resulting value, not duplicated.
    pub fn shmem(block: &SharedMemory) -> Object {
        Object::shmem_value(ShmemValue {
            fd: block.fd.clone(),
            size: block.size,
            offset: 0,
        })
    }

    /// Map the region referenced by a shmem value.
    pub fn shmem_map(&self) -> Result<Mapping> {
        let shmem = self.as_shmem()?;
        map_region(shmem.fd().raw()?, shmem.size(), shmem.offset())
    }

    pub fn shmem_size(&self) -> Result<usize> {
        Ok(self.as_shmem()?.size())
    }

    pub fn shmem_offset(&self) -> Result<usize> {
        Ok(self.as_shmem()?.offset())
    }

    /// Recover a [`SharedMemory`] handle from a shmem value.
    pub fn shmem_block(&self) -> Result<SharedMemory> {
        let shmem = self.as_shmem()?;
        Ok(SharedMemory {
            fd: shmem.fd().clone(),
            size: shmem.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn alloc_and_map() {
        let block = SharedMemory::alloc(4096).unwrap();
        assert_eq!(block.size(), 4096);

        let mut mapping = block.map().unwrap();
        assert_eq!(mapping.len(), 4096);

        mapping.as_mut_slice().fill(b'A');
        assert!(mapping.as_slice().iter().all(|b| *b == b'A'));
    }

    #[test]
    fn mappings_share_pages() {
        let block = SharedMemory::alloc(4096).unwrap();
        let mut writer = block.map().unwrap();
        let reader = block.map().unwrap();

        writer.as_mut_slice()[0] = b'B';
        assert_eq!(reader.as_slice()[0], b'B');
    }

    #[test]
    fn object_wraps_block_geometry() {
        let block = SharedMemory::alloc(1 << 20).unwrap();
        let obj = Object::shmem(&block);

        assert_eq!(obj.shmem_size().unwrap(), 1 << 20);
        assert_eq!(obj.shmem_offset().unwrap(), 0);

        let mut mapping = obj.shmem_map().unwrap();
        mapping.as_mut_slice()[42] = b'C';
        assert_eq!(block.map().unwrap().as_slice()[42], b'C');
    }

    #[test]
    fn recovered_block_maps_same_pages() {
        let block = SharedMemory::alloc(4096).unwrap();
        let obj = Object::shmem(&block);

        let recovered = obj.shmem_block().unwrap();
        let mut mapping = recovered.map().unwrap();
        mapping.as_mut_slice()[7] = b'D';
        assert_eq!(block.map().unwrap().as_slice()[7], b'D');
    }

    #[test]
    fn empty_alloc_fails() {
        let err = SharedMemory::alloc(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
