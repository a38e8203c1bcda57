//! Hardware Abstraction Layer for DMA memory.
//!
//! Platform code implements [`VirtioHal`] to hand out physically
//! contiguous, device-visible memory for virtqueue rings and to translate
//! consumer buffers into bus addresses.

use core::marker::PhantomData;
use core::ptr::NonNull;

use vpci_utils::InterruptMask;

use crate::TransportError;

/// Direction of buffer access for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    /// Driver writes to buffer, device reads.
    DriverToDevice,
    /// Device writes to buffer, driver reads.
    DeviceToDriver,
    /// Both driver and device may access.
    Both,
}

/// Hardware Abstraction Layer for virtio devices.
///
/// # Safety
///
/// Implementations must ensure:
/// - DMA memory is physically contiguous and page aligned
/// - The returned physical address is what the device must be given
/// - Memory returned by `dma_alloc` stays valid until `dma_dealloc`
///
/// The [`InterruptMask`] half masks local interrupts around every lock the
/// interrupt handler shares with caller context.
pub unsafe trait VirtioHal: InterruptMask {
    /// Allocate `pages` zeroed pages of DMA-capable memory.
    ///
    /// Returns `(physical_address, virtual_pointer)`, or `None` when the
    /// platform is out of DMA memory.
    fn dma_alloc(pages: usize, direction: BufferDirection) -> Option<(u64, NonNull<u8>)>;

    /// Release memory from `dma_alloc`.
    ///
    /// # Safety
    ///
    /// `paddr`, `vaddr` and `pages` must come from a single previous call to
    /// `dma_alloc` that has not been released yet.
    unsafe fn dma_dealloc(paddr: u64, vaddr: NonNull<u8>, pages: usize);

    /// Share a consumer buffer with the device, returning its bus address.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid until the matching `unshare`.
    unsafe fn share(buffer: NonNull<[u8]>, direction: BufferDirection) -> u64;

    /// Stop sharing a buffer. Copies back bounce-buffered data if needed.
    ///
    /// # Safety
    ///
    /// `paddr` and `buffer` must match a previous call to `share`.
    unsafe fn unshare(paddr: u64, buffer: NonNull<[u8]>, direction: BufferDirection);
}

/// Size of a page for DMA allocation.
pub const PAGE_SIZE: usize = 4096;

/// Calculate number of pages needed for a given size.
pub const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// An owned DMA allocation, released on drop.
pub struct Dma<H: VirtioHal> {
    paddr: u64,
    vaddr: NonNull<u8>,
    pages: usize,
    _hal: PhantomData<H>,
}

// SAFETY: The allocation is owned exclusively by this value; access to the
// memory is synchronized by the queue that owns it.
unsafe impl<H: VirtioHal> Send for Dma<H> {}
// SAFETY: See above.
unsafe impl<H: VirtioHal> Sync for Dma<H> {}

impl<H: VirtioHal> Dma<H> {
    /// Allocate enough pages for `bytes` and zero them.
    pub fn new(bytes: usize, direction: BufferDirection) -> Result<Self, TransportError> {
        let pages = pages_for(bytes.max(1));
        let Some((paddr, vaddr)) = H::dma_alloc(pages, direction) else {
            log::error!("[VIRTIO] DMA allocation of {} pages failed", pages);
            return Err(TransportError::ResourceExhaustion);
        };
        // SAFETY: dma_alloc returned `pages` pages at `vaddr`.
        unsafe { vaddr.as_ptr().write_bytes(0, pages * PAGE_SIZE) };
        Ok(Self {
            paddr,
            vaddr,
            pages,
            _hal: PhantomData,
        })
    }

    /// Bus address to program into the device.
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    /// CPU pointer to the start of the allocation.
    pub fn vaddr(&self) -> NonNull<u8> {
        self.vaddr
    }

    /// Allocation size in bytes (whole pages).
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Zero the whole allocation.
    pub fn clear(&self) {
        // SAFETY: Owned allocation of `len()` bytes.
        unsafe { self.vaddr.as_ptr().write_bytes(0, self.len()) };
    }
}

impl<H: VirtioHal> Drop for Dma<H> {
    fn drop(&mut self) {
        // SAFETY: Values came from `dma_alloc` in `new` and are released once.
        unsafe { H::dma_dealloc(self.paddr, self.vaddr, self.pages) };
    }
}
