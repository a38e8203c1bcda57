//! Split virtqueue per Virtio 1.2 section 2.7.
//!
//! The descriptor table, available ring and used ring each live in their own
//! DMA allocation. Ownership is split: the driver only appends to the
//! available ring and writes descriptors of chains it owns, the device only
//! appends to the used ring. Indices are the synchronization points, and each
//! index publication is preceded by a fence.
//!
//! Driver-side bookkeeping (free list, shadow descriptors, avail index) sits
//! behind a spin lock that masks local interrupts while held. The used-ring
//! cursor is an atomic so the interrupt path can check for pending work
//! without taking that lock.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering, fence};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use vpci_utils::IrqSafeLock;

use crate::TransportError;
use crate::hal::{BufferDirection, Dma, VirtioHal};
use crate::transport::QueueAddresses;

/// Largest queue size the split ring format allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Largest total byte count one chain may describe.
pub const MAX_CHAIN_BYTES: u64 = 1 << 32;

/// Driver asks the device not to interrupt (no event index).
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Device asks the driver not to notify (no event index).
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

bitflags! {
    /// Descriptor flags per Virtio 1.2 section 2.7.5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1;
        /// Buffer is device write-only (otherwise read-only).
        const WRITE = 2;
        /// Buffer contains a list of buffer descriptors.
        const INDIRECT = 4;
    }
}

/// A single descriptor in the descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Descriptor {
    /// Bus address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

impl Descriptor {
    fn has_next(&self) -> bool {
        DescriptorFlags::from_bits_retain(self.flags).contains(DescriptorFlags::NEXT)
    }

    fn to_le(self) -> Self {
        Self {
            addr: self.addr.to_le(),
            len: self.len.to_le(),
            flags: self.flags.to_le(),
            next: self.next.to_le(),
        }
    }
}

/// Used ring entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UsedElem {
    /// Head of the completed chain.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

const _: () = {
    use core::mem::{offset_of, size_of};
    assert!(size_of::<Descriptor>() == 16);
    assert!(offset_of!(Descriptor, len) == 8);
    assert!(offset_of!(Descriptor, flags) == 12);
    assert!(offset_of!(Descriptor, next) == 14);
    assert!(size_of::<UsedElem>() == 8);
};

/// Byte layout of the three ring areas for a queue size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    size: u16,
}

impl RingLayout {
    pub const DESC_ALIGN: usize = 16;
    pub const AVAIL_ALIGN: usize = 2;
    pub const USED_ALIGN: usize = 4;

    const AVAIL_FLAGS: usize = 0;
    const AVAIL_IDX: usize = 2;
    const AVAIL_RING: usize = 4;
    const USED_FLAGS: usize = 0;
    const USED_IDX: usize = 2;
    const USED_RING: usize = 4;

    pub const fn new(size: u16) -> Self {
        Self { size }
    }

    pub const fn desc_bytes(self) -> usize {
        16 * self.size as usize
    }

    /// flags, idx, ring[size], used_event
    pub const fn avail_bytes(self) -> usize {
        6 + 2 * self.size as usize
    }

    /// flags, idx, ring[size], avail_event
    pub const fn used_bytes(self) -> usize {
        6 + 8 * self.size as usize
    }

    const fn avail_slot(self, slot: u16) -> usize {
        Self::AVAIL_RING + 2 * slot as usize
    }

    const fn used_event(self) -> usize {
        Self::AVAIL_RING + 2 * self.size as usize
    }

    const fn used_slot(self, slot: u16) -> usize {
        Self::USED_RING + 8 * slot as usize
    }

    const fn avail_event(self) -> usize {
        Self::USED_RING + 8 * self.size as usize
    }
}

/// Whether an index move from `old` to `new` crossed `event`.
///
/// Virtio 1.2 section 2.7.10: notify when `new - event - 1 < new - old`,
/// all arithmetic modulo 2^16.
pub fn vring_need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// One buffer of a chain: a bus address and a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

impl Segment {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Handle for a submitted chain: its head descriptor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u16);

impl Token {
    pub fn head(self) -> u16 {
        self.0
    }
}

/// A chain the device has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Bytes the device wrote into the chain's writable part.
    pub len: u32,
}

struct DriverState {
    free_head: u16,
    num_free: u16,
    avail_idx: u16,
    /// `avail_idx` at the last notification decision.
    last_kick: u16,
    interrupts_suppressed: bool,
    /// Driver copy of every descriptor. Reclaim only walks this.
    shadow: Vec<Descriptor>,
    /// Chain length for each in-flight head, 0 otherwise.
    in_flight: Vec<u16>,
}

impl DriverState {
    fn new(size: u16) -> Self {
        let mut shadow = vec![Descriptor::default(); usize::from(size)];
        for (i, desc) in shadow.iter_mut().enumerate() {
            desc.next = ((i + 1) % usize::from(size)) as u16;
        }
        Self {
            free_head: 0,
            num_free: size,
            avail_idx: 0,
            last_kick: 0,
            interrupts_suppressed: false,
            shadow,
            in_flight: vec![0; usize::from(size)],
        }
    }
}

/// A split virtqueue.
pub struct VirtQueue<H: VirtioHal> {
    index: u16,
    size: u16,
    layout: RingLayout,
    event_idx: bool,
    desc: Dma<H>,
    avail: Dma<H>,
    used: Dma<H>,
    state: IrqSafeLock<H, DriverState>,
    last_used: AtomicU16,
}

impl<H: VirtioHal> VirtQueue<H> {
    /// Allocate zeroed ring memory for a queue of `size` entries.
    ///
    /// `size` must be a power of two in `1..=32768`.
    pub fn new(index: u16, size: u16, event_idx: bool) -> Result<Self, TransportError> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            log::error!("[VIRTIO] queue {}: invalid size {}", index, size);
            return Err(TransportError::ConfigurationError);
        }
        let layout = RingLayout::new(size);
        let desc = Dma::new(layout.desc_bytes(), BufferDirection::DriverToDevice)?;
        let avail = Dma::new(layout.avail_bytes(), BufferDirection::DriverToDevice)?;
        let used = Dma::new(layout.used_bytes(), BufferDirection::DeviceToDriver)?;

        Ok(Self {
            index,
            size,
            layout,
            event_idx,
            desc,
            avail,
            used,
            state: IrqSafeLock::new(DriverState::new(size)),
            last_used: AtomicU16::new(0),
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    /// Bus addresses to program into the queue registers.
    pub fn addresses(&self) -> QueueAddresses {
        QueueAddresses {
            desc: self.desc.paddr(),
            driver: self.avail.paddr(),
            device: self.used.paddr(),
        }
    }

    pub fn num_free(&self) -> u16 {
        self.state.lock().num_free
    }

    /// Driver's available index (next slot to publish).
    pub fn avail_idx(&self) -> u16 {
        self.state.lock().avail_idx
    }

    /// Driver's used-ring cursor.
    pub fn last_used_idx(&self) -> u16 {
        self.last_used.load(Ordering::Acquire)
    }

    // --- ring memory accessors ---

    fn write_avail16(&self, offset: usize, value: u16) {
        // SAFETY: offset is inside the avail allocation per RingLayout.
        unsafe {
            self.avail
                .vaddr()
                .byte_add(offset)
                .cast::<u16>()
                .write_volatile(value.to_le());
        }
    }

    fn read_avail16(&self, offset: usize) -> u16 {
        // SAFETY: offset is inside the avail allocation per RingLayout.
        u16::from_le(unsafe {
            self.avail
                .vaddr()
                .byte_add(offset)
                .cast::<u16>()
                .read_volatile()
        })
    }

    fn read_used16(&self, offset: usize) -> u16 {
        // SAFETY: offset is inside the used allocation per RingLayout.
        u16::from_le(unsafe {
            self.used
                .vaddr()
                .byte_add(offset)
                .cast::<u16>()
                .read_volatile()
        })
    }

    fn read_used_elem(&self, slot: u16) -> UsedElem {
        // SAFETY: slot < size, so the element is inside the used allocation.
        let raw = unsafe {
            self.used
                .vaddr()
                .byte_add(self.layout.used_slot(slot))
                .cast::<UsedElem>()
                .read_volatile()
        };
        UsedElem {
            id: u32::from_le(raw.id),
            len: u32::from_le(raw.len),
        }
    }

    fn write_descriptor(&self, index: u16, desc: Descriptor) {
        // SAFETY: index < size, inside the descriptor allocation.
        unsafe {
            self.desc
                .vaddr()
                .cast::<Descriptor>()
                .add(usize::from(index))
                .write_volatile(desc.to_le());
        }
    }

    /// The used index as last written by the device.
    pub fn used_idx(&self) -> u16 {
        fence(Ordering::SeqCst);
        self.read_used16(RingLayout::USED_IDX)
    }

    /// Device's notification suppression flags.
    pub fn used_flags(&self) -> u16 {
        self.read_used16(RingLayout::USED_FLAGS)
    }

    /// Driver's interrupt suppression flags.
    pub fn avail_flags(&self) -> u16 {
        self.read_avail16(RingLayout::AVAIL_FLAGS)
    }

    /// The `used_event` field the device consults with event index.
    pub fn used_event(&self) -> u16 {
        self.read_avail16(self.layout.used_event())
    }

    /// Publish a chain: `readable` segments first, then `writable` ones.
    pub fn add(&self, readable: &[Segment], writable: &[Segment]) -> Result<Token, TransportError> {
        let total = readable.len() + writable.len();
        if total == 0 || total > usize::from(self.size) {
            log::error!(
                "[VIRTIO] queue {}: chain of {} segments does not fit size {}",
                self.index,
                total,
                self.size
            );
            return Err(TransportError::InvalidBuffer);
        }
        let bytes: u64 = readable
            .iter()
            .chain(writable)
            .map(|s| u64::from(s.len))
            .sum();
        if bytes > MAX_CHAIN_BYTES {
            log::error!(
                "[VIRTIO] queue {}: chain of {} bytes exceeds 4 GiB",
                self.index,
                bytes
            );
            return Err(TransportError::InvalidBuffer);
        }

        let mut state = self.state.lock();
        if usize::from(state.num_free) < total {
            return Err(TransportError::QueueFull);
        }

        let head = state.free_head;
        let mut current = head;
        let segments = readable
            .iter()
            .map(|s| (s, DescriptorFlags::empty()))
            .chain(writable.iter().map(|s| (s, DescriptorFlags::WRITE)));

        for (n, (segment, mut flags)) in segments.enumerate() {
            let link = state.shadow[usize::from(current)].next;
            if n + 1 < total {
                flags |= DescriptorFlags::NEXT;
            }
            let desc = Descriptor {
                addr: segment.addr,
                len: segment.len,
                flags: flags.bits(),
                next: link,
            };
            state.shadow[usize::from(current)] = desc;
            self.write_descriptor(current, desc);
            if n + 1 < total {
                current = link;
            }
        }

        state.free_head = state.shadow[usize::from(current)].next;
        state.num_free -= total as u16;
        state.in_flight[usize::from(head)] = total as u16;

        let slot = state.avail_idx & (self.size - 1);
        self.write_avail16(self.layout.avail_slot(slot), head);

        // Ring entry must be visible before the index that publishes it.
        fence(Ordering::SeqCst);
        state.avail_idx = state.avail_idx.wrapping_add(1);
        self.write_avail16(RingLayout::AVAIL_IDX, state.avail_idx);
        fence(Ordering::SeqCst);

        #[cfg(target_arch = "aarch64")]
        {
            use aarch64_cpu::asm::barrier;
            barrier::dsb(barrier::SY);
        }

        log::trace!(
            "[VIRTIO] queue {}: published head {} ({} descriptors), avail {}",
            self.index,
            head,
            total,
            state.avail_idx
        );
        Ok(Token(head))
    }

    /// Whether the device wants a doorbell for what was published since the
    /// last call.
    pub fn should_notify(&self) -> bool {
        let mut state = self.state.lock();
        // Our avail index write must be ordered before reading the
        // device's suppression state.
        fence(Ordering::SeqCst);
        let old = state.last_kick;
        let new = state.avail_idx;
        state.last_kick = new;

        if self.event_idx {
            let avail_event = self.read_used16(self.layout.avail_event());
            vring_need_event(avail_event, new, old)
        } else {
            self.used_flags() & VIRTQ_USED_F_NO_NOTIFY == 0
        }
    }

    /// Lock-free check for used entries past the cursor.
    pub fn pending(&self) -> bool {
        self.used_idx() != self.last_used.load(Ordering::Acquire)
    }

    /// Take the next completion, reclaiming its descriptors.
    ///
    /// Used entries naming something other than an in-flight head are
    /// logged and skipped; the cursor still moves past them.
    pub fn pop_used(&self) -> Option<Completion> {
        let mut state = self.state.lock();
        loop {
            let last = self.last_used.load(Ordering::Acquire);
            if self.used_idx() == last {
                return None;
            }
            // Entry contents are read only after observing the index.
            fence(Ordering::SeqCst);
            let elem = self.read_used_elem(last & (self.size - 1));
            let next = last.wrapping_add(1);
            self.last_used.store(next, Ordering::Release);
            if self.event_idx && !state.interrupts_suppressed {
                self.write_avail16(self.layout.used_event(), next);
            }

            let head = match u16::try_from(elem.id) {
                Ok(head) if head < self.size && state.in_flight[usize::from(head)] != 0 => head,
                _ => {
                    log::warn!(
                        "[VIRTIO] queue {}: used entry names descriptor {} which is not in flight",
                        self.index,
                        elem.id
                    );
                    continue;
                }
            };

            self.reclaim(&mut state, head);
            return Some(Completion {
                token: Token(head),
                len: elem.len,
            });
        }
    }

    fn reclaim(&self, state: &mut DriverState, head: u16) {
        let count = core::mem::replace(&mut state.in_flight[usize::from(head)], 0);
        let mut tail = head;
        for _ in 1..count {
            let desc = state.shadow[usize::from(tail)];
            if !desc.has_next() {
                break;
            }
            tail = desc.next;
        }
        state.shadow[usize::from(tail)].next = state.free_head;
        state.free_head = head;
        state.num_free += count;
    }

    /// Ask the device to stop (or resume) interrupting for this queue.
    ///
    /// With event index the `used_event` field is parked one behind the
    /// cursor; otherwise the `NO_INTERRUPT` flag is toggled.
    pub fn set_interrupt_suppressed(&self, suppressed: bool) {
        let mut state = self.state.lock();
        state.interrupts_suppressed = suppressed;
        let last = self.last_used.load(Ordering::Acquire);
        if self.event_idx {
            let event = if suppressed { last.wrapping_sub(1) } else { last };
            self.write_avail16(self.layout.used_event(), event);
        } else {
            let flags = if suppressed {
                VIRTQ_AVAIL_F_NO_INTERRUPT
            } else {
                0
            };
            self.write_avail16(RingLayout::AVAIL_FLAGS, flags);
        }
        fence(Ordering::SeqCst);
    }

    /// Return ring memory and cursors to their initial state.
    ///
    /// Only valid while the device is not using the queue (after a queue
    /// reset). Chains still in flight are dropped.
    pub fn reinit(&self) {
        let mut state = self.state.lock();
        let dropped = state.in_flight.iter().filter(|&&n| n != 0).count();
        if dropped > 0 {
            log::warn!(
                "[VIRTIO] queue {}: reset drops {} in-flight chains",
                self.index,
                dropped
            );
        }
        self.desc.clear();
        self.avail.clear();
        self.used.clear();
        *state = DriverState::new(self.size);
        self.last_used.store(0, Ordering::Release);
        fence(Ordering::SeqCst);
    }
}
