//! Anonymous shared memory mapping.
//!
//! The mapping is created with `MAP_SHARED` before the buffer process is
//! forked, so parent and child address the same physical pages at the same
//! virtual address. Each process unmaps its own view on drop.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::error::{BufferError, Result};

pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory. Access discipline for its contents is
// enforced by the types built on top of it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` zeroed bytes readable and writable by this process and any
    /// child forked after this call.
    pub fn new(len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| BufferError::InvalidArgument("shared region of 0 bytes".into()))?;

        // SAFETY: anonymous mapping with no address hint; the kernel picks a
        // fresh range that aliases nothing in this process.
        let addr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| match e {
            Errno::ENOMEM => BufferError::OutOfMemory {
                requested: len as u64,
            },
            e => BufferError::SharedMemory(format!("mmap of {len} bytes failed: {e}")),
        })?;

        debug!(len, "mapped shared region");
        Ok(Self {
            ptr: addr.cast(),
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned and nothing borrows
        // the region once its owner is dropped.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            warn!(len = self.len, "munmap failed: {e}");
        }
    }
}
