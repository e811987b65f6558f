//! Single-producer single-consumer byte ring in shared memory.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────── header (64 B) ────────────────┬──────── data (capacity) ────────┐
//! │ write_index │ read_index │ interrupted │ pad  │ bytes ...                       │
//! └───────────────────────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! `write_index` is only ever stored by the controller ([`RingProducer`]),
//! `read_index` only by the buffer process ([`RingConsumer`]). Each side
//! reads the other's index with acquire ordering and may see a stale value;
//! a stale value only ever understates the space available, so both sides
//! simply re-check.
//!
//! One byte is kept free so that `write_index == read_index` always means
//! empty.

pub mod shm;

use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{BufferError, Result};
use shm::SharedRegion;

/// Bytes reserved in front of the data area.
const HEADER_SIZE: usize = 64;

#[repr(C)]
struct RingHeader {
    /// Stored by the controller only.
    write_index: AtomicUsize,
    /// Stored by the buffer process only.
    read_index: AtomicUsize,
    /// Raised by the controller ahead of an urgent command, cleared by the
    /// buffer process when it handles the next request.
    interrupted: AtomicBool,
}

const _: () = assert!(std::mem::size_of::<RingHeader>() <= HEADER_SIZE);

/// Bytes between `read` and `write` in a ring of `capacity`.
fn used_between(write: usize, read: usize, capacity: usize) -> usize {
    if write >= read {
        write - read
    } else {
        capacity - (read - write)
    }
}

/// The shared ring itself. Reached through a [`RingProducer`] or
/// [`RingConsumer`], which carry the right to move one index each.
pub struct RingBuffer {
    region: SharedRegion,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(BufferError::InvalidArgument(format!(
                "ring capacity {capacity} is too small"
            )));
        }
        let region = SharedRegion::new(HEADER_SIZE + capacity)?;
        // SAFETY: the region is page aligned, at least HEADER_SIZE long and
        // not yet visible to anyone else.
        unsafe {
            ptr::write(
                region.as_ptr() as *mut RingHeader,
                RingHeader {
                    write_index: AtomicUsize::new(0),
                    read_index: AtomicUsize::new(0),
                    interrupted: AtomicBool::new(false),
                },
            );
        }
        Ok(Self { region, capacity })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: initialised in `new`, lives as long as the region.
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the region is HEADER_SIZE + capacity bytes long.
        unsafe { self.region.as_ptr().add(HEADER_SIZE) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written but not yet read. Approximate when called from the
    /// side that does not own the index being moved.
    pub fn used_space(&self) -> usize {
        let header = self.header();
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Acquire);
        used_between(write, read, self.capacity)
    }

    pub fn free_space(&self) -> usize {
        self.capacity - 1 - self.used_space()
    }

    /// Zero both indices. Only valid while neither side is touching the ring.
    pub fn reset(&self) {
        let header = self.header();
        header.write_index.store(0, Ordering::SeqCst);
        header.read_index.store(0, Ordering::SeqCst);
    }

    pub fn raise_interrupt(&self) {
        self.header().interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.header().interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.header().interrupted.load(Ordering::SeqCst)
    }
}

/// Writer half, held by the controller.
pub struct RingProducer {
    ring: Arc<RingBuffer>,
}

impl RingProducer {
    /// Copy as much of `bytes` as fits. Returns the number of bytes written,
    /// 0 when the ring is full. Never blocks.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let ring = &*self.ring;
        let header = ring.header();
        let cap = ring.capacity;
        let write = header.write_index.load(Ordering::Relaxed);
        let read = header.read_index.load(Ordering::Acquire);

        let free = cap - 1 - used_between(write, read, cap);
        let count = bytes.len().min(free);
        if count == 0 {
            return 0;
        }

        let first = count.min(cap - write);
        // SAFETY: [write, write + count) modulo cap lies entirely in the free
        // area, which the consumer never reads.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ring.data().add(write), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), ring.data(), count - first);
        }
        header
            .write_index
            .store((write + count) % cap, Ordering::Release);
        count
    }
}

impl Deref for RingProducer {
    type Target = RingBuffer;

    fn deref(&self) -> &RingBuffer {
        &self.ring
    }
}

/// Reader half, held by the buffer process.
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
}

impl RingConsumer {
    fn indices(&self) -> (usize, usize) {
        let header = self.ring.header();
        let read = header.read_index.load(Ordering::Relaxed);
        let write = header.write_index.load(Ordering::Acquire);
        (read, write)
    }

    /// Copy up to `out.len()` bytes out and advance. Returns the count read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = self.peek_copy(out);
        self.consume(count);
        count
    }

    /// The readable bytes that sit contiguously at the read index, at most
    /// `max` of them.
    pub fn peek(&self, max: usize) -> &[u8] {
        let cap = self.ring.capacity;
        let (read, write) = self.indices();
        let len = used_between(write, read, cap).min(cap - read).min(max);
        // SAFETY: [read, read + len) holds committed data the producer will
        // not touch until `consume` moves the read index, which needs
        // `&mut self` and so ends this borrow first.
        unsafe { std::slice::from_raw_parts(self.ring.data().add(read), len) }
    }

    /// Copy readable bytes into `out` across the wrap point without
    /// consuming them.
    pub fn peek_copy(&self, out: &mut [u8]) -> usize {
        let cap = self.ring.capacity;
        let (read, write) = self.indices();
        let count = used_between(write, read, cap).min(out.len());
        let first = count.min(cap - read);
        // SAFETY: see `peek`; both ranges are committed data.
        unsafe {
            ptr::copy_nonoverlapping(self.ring.data().add(read), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(
                self.ring.data(),
                out.as_mut_ptr().add(first),
                count - first,
            );
        }
        count
    }

    /// Advance the read index past `count` bytes already handled.
    pub fn consume(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let cap = self.ring.capacity;
        let (read, write) = self.indices();
        let count = count.min(used_between(write, read, cap));
        self.ring
            .header()
            .read_index
            .store((read + count) % cap, Ordering::Release);
    }

    /// Throw away everything written so far. Returns the number of bytes
    /// dropped.
    pub fn discard_all(&mut self) -> usize {
        let cap = self.ring.capacity;
        let (read, write) = self.indices();
        self.ring.header().read_index.store(write, Ordering::Release);
        used_between(write, read, cap)
    }
}

impl Deref for RingConsumer {
    type Target = RingBuffer;

    fn deref(&self) -> &RingBuffer {
        &self.ring
    }
}

/// Create a ring of `capacity` bytes (of which `capacity - 1` are usable)
/// in fresh shared memory and split it into its two halves.
pub fn create_shared_ring(capacity: usize) -> Result<(RingProducer, RingConsumer)> {
    let ring = Arc::new(RingBuffer::new(capacity)?);
    Ok((
        RingProducer {
            ring: Arc::clone(&ring),
        },
        RingConsumer { ring },
    ))
}
