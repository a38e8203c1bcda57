//! Register access for mapped BAR windows.
//!
//! Every mapped capability region is reached through [`RegisterIo`]. The
//! provided [`MmioWindow`] is the real-hardware implementation; tests plug
//! in simulated windows.

use core::ptr::NonNull;

use volatile::VolatilePtr;

/// Width-correct access to a little-endian register window.
///
/// Writes take `&self`: device registers are shared state that the device
/// itself mutates, so exclusive borrows would not describe them anyway.
/// Implementations return the all-ones pattern for reads outside the
/// window, which is what an unbacked PCI read produces.
pub trait RegisterIo: Send + Sync {
    /// Address the window starts at, as seen by the CPU.
    fn base_address(&self) -> usize;

    /// Window length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);

    /// 64-bit registers are written as two 32-bit halves, low half first.
    fn read64(&self, offset: usize) -> u64 {
        let lo = u64::from(self.read32(offset));
        let hi = u64::from(self.read32(offset + 4));
        lo | (hi << 32)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// A mapped BAR region accessed with volatile loads and stores.
pub struct MmioWindow {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: The window is plain device memory. Concurrent register access is
// serialized by the transport where the device requires it.
unsafe impl Send for MmioWindow {}
// SAFETY: See above.
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// Wrap an already-mapped region.
    ///
    /// # Safety
    ///
    /// `[base, base + len)` must be mapped device memory that stays mapped
    /// for the lifetime of the window, and every naturally aligned access
    /// inside it must be valid.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    fn in_bounds(&self, offset: usize, width: usize) -> bool {
        offset
            .checked_add(width)
            .is_some_and(|end| end <= self.len)
    }

    /// # Safety
    ///
    /// `offset..offset + size_of::<T>()` must lie inside the window.
    unsafe fn reg<T: Copy>(&self, offset: usize) -> VolatilePtr<'_, T> {
        // SAFETY: Bounds are checked by the caller and the mapping is valid
        // per `MmioWindow::new`.
        unsafe { VolatilePtr::new(self.base.byte_add(offset).cast::<T>()) }
    }
}

macro_rules! mmio_accessors {
    ($($read:ident / $write:ident: $ty:ty),* $(,)?) => {
        $(
            fn $read(&self, offset: usize) -> $ty {
                if !self.in_bounds(offset, size_of::<$ty>()) {
                    log::error!(
                        "[VIRTIO-PCI] Read past window end: offset {:#x}, len {:#x}",
                        offset,
                        self.len
                    );
                    return <$ty>::MAX;
                }
                // SAFETY: Bounds checked above.
                <$ty>::from_le(unsafe { self.reg::<$ty>(offset) }.read())
            }

            fn $write(&self, offset: usize, value: $ty) {
                if !self.in_bounds(offset, size_of::<$ty>()) {
                    log::error!(
                        "[VIRTIO-PCI] Write past window end: offset {:#x}, len {:#x}",
                        offset,
                        self.len
                    );
                    return;
                }
                // SAFETY: Bounds checked above.
                unsafe { self.reg::<$ty>(offset) }.write(value.to_le());
            }
        )*
    };
}

impl RegisterIo for MmioWindow {
    fn base_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.len
    }

    mmio_accessors! {
        read8 / write8: u8,
        read16 / write16: u16,
        read32 / write32: u32,
    }
}
