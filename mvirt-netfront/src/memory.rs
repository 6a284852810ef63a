//! Page-sized guest frames for rings and packet buffers
//!
//! Every buffer the front-end grants to the backend is a whole 4 KiB frame of
//! guest memory. A `FramePool` hands frames out from a contiguous range and
//! takes them back lock-free when the owning `Page` is dropped.

use std::io;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use vm_memory::{
    Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap, GuestRegionMmap, MmapRegion,
};

use crate::protocol::PAGE_SIZE;

/// Page frame number of a guest address
pub fn pfn_of(addr: GuestAddress) -> u64 {
    addr.0 / PAGE_SIZE as u64
}

/// Create `size` bytes of anonymous guest memory starting at guest address 0.
pub fn create_guest_memory(size: usize) -> io::Result<GuestMemoryMmap> {
    let mmap_region =
        MmapRegion::new(size).map_err(|e| io::Error::other(format!("mmap region: {e:?}")))?;
    let region = GuestRegionMmap::new(mmap_region, GuestAddress(0))
        .ok_or_else(|| io::Error::other("guest region creation failed"))?;
    GuestMemoryMmap::from_regions(vec![region])
        .map_err(|e| io::Error::other(format!("guest memory: {e:?}")))
}

/// A contiguous range of guest memory split into `PAGE_SIZE` byte frames.
pub struct FramePool {
    mem: Arc<GuestMemoryMmap>,
    base_pfn: u64,
    count: usize,
    free: ArrayQueue<u64>,
}

impl FramePool {
    /// Create a pool over `count` frames starting at frame `base_pfn`.
    pub fn new(mem: Arc<GuestMemoryMmap>, base_pfn: u64, count: usize) -> Arc<Self> {
        let free = ArrayQueue::new(count.max(1));
        for pfn in base_pfn..base_pfn + count as u64 {
            // Capacity equals count, push cannot fail
            let _ = free.push(pfn);
        }

        tracing::debug!(base_pfn, count, "Frame pool created");

        Arc::new(Self {
            mem,
            base_pfn,
            count,
            free,
        })
    }

    /// Allocate one frame.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn alloc(self: &Arc<Self>) -> Option<Page> {
        self.free.pop().map(|pfn| Page {
            pool: Arc::clone(self),
            pfn,
        })
    }

    /// Number of frames currently free
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of frames managed by this pool
    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn memory(&self) -> &Arc<GuestMemoryMmap> {
        &self.mem
    }

    pub fn contains(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.count as u64
    }

    fn release(&self, pfn: u64) {
        // Only frames handed out by alloc() come back, so the queue has room
        let _ = self.free.push(pfn);
    }
}

/// One guest frame owned by the front-end.
///
/// Returned to its pool when dropped.
pub struct Page {
    pool: Arc<FramePool>,
    pfn: u64,
}

impl Page {
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.pfn * PAGE_SIZE as u64)
    }

    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.pool.mem
    }

    /// Copy `data` into the page at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), GuestMemoryError> {
        debug_assert!(offset + data.len() <= PAGE_SIZE);
        self.pool
            .mem
            .write_slice(data, GuestAddress(self.addr().0 + offset as u64))
    }

    /// Copy bytes out of the page starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), GuestMemoryError> {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        self.pool
            .mem
            .read_slice(buf, GuestAddress(self.addr().0 + offset as u64))
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<(), GuestMemoryError> {
        let zeros = [0u8; PAGE_SIZE];
        self.write(offset, &zeros[..len])
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.pool.release(self.pfn);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("pfn", &self.pfn).finish()
    }
}

/// A `(page, offset, length)` view: one link of a packet buffer chain.
#[derive(Debug)]
pub struct PacketBuffer {
    pub page: Page,
    pub offset: usize,
    pub length: usize,
}

impl PacketBuffer {
    pub fn new(page: Page, offset: usize, length: usize) -> Self {
        debug_assert!(offset + length <= PAGE_SIZE);
        Self {
            page,
            offset,
            length,
        }
    }

    /// Guest address of the first byte of the view
    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.page.addr().0 + self.offset as u64)
    }

    /// Copy the viewed bytes out.
    pub fn to_vec(&self) -> Result<Vec<u8>, GuestMemoryError> {
        let mut data = vec![0u8; self.length];
        self.page.read(self.offset, &mut data)?;
        Ok(data)
    }
}

/// A run of bytes in guest memory supplied by the caller of the transmit path.
///
/// Segments may cross page boundaries; the transmitter splits them per frame
/// when granting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub addr: GuestAddress,
    pub len: usize,
}

impl MemorySegment {
    pub fn new(addr: GuestAddress, len: usize) -> Self {
        Self { addr, len }
    }
}
