//! Simulated virtio-pci function for integration tests.
//!
//! The model owns a 256-byte config space with a capability chain and one
//! BAR whose windows follow the Virtio 1.x register semantics. Rings live in
//! heap memory handed out by [`TestHal`] (bus address == CPU address), so
//! the device side can walk them directly.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use log::{Level, LevelFilter, Metadata, Record};
use vpci_transport::queue::{Descriptor, DescriptorFlags, UsedElem};
use vpci_transport::regs::{cap, common_cfg, features, DeviceStatus};
use vpci_transport::{
    BufferDirection, InterruptMask, PAGE_SIZE, PciPlatform, PciTransport, RegisterIo, TransportConfig,
    TransportError, VirtioDevice, VirtioHal,
};

pub type SimDevice = VirtioDevice<PciTransport<SimPlatform>, TestHal>;

/// Probe and negotiate against `sim`.
pub fn attach(sim: &Sim, config: TransportConfig) -> Result<SimDevice, TransportError> {
    SimDevice::attach_pci(&mut sim.platform(), config)
}

// ============================================================================
// Logger
// ============================================================================

static LOGGER: StdoutLogger = StdoutLogger;
static LOGGER_INIT: Once = Once::new();

struct StdoutLogger;

impl log::Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

// ============================================================================
// DMA
// ============================================================================

thread_local! {
    static LIVE_PAGES: Cell<isize> = const { Cell::new(0) };
    static ALLOC_BUDGET: Cell<Option<usize>> = const { Cell::new(None) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static MASKS: Cell<usize> = const { Cell::new(0) };
}

/// Heap-backed HAL. Counters are per test thread.
pub struct TestHal;

impl TestHal {
    pub fn live_pages() -> isize {
        LIVE_PAGES.with(Cell::get)
    }

    /// Let `n` more allocations succeed, then fail. `None` lifts the limit.
    pub fn fail_after(n: Option<usize>) {
        ALLOC_BUDGET.with(|b| b.set(n));
    }

    /// The simulated CPU interrupt flag of this thread.
    pub fn interrupts_enabled() -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    /// Times interrupts were masked on this thread.
    pub fn masks() -> usize {
        MASKS.with(Cell::get)
    }
}

impl InterruptMask for TestHal {
    fn disable() -> u64 {
        MASKS.with(|c| c.set(c.get() + 1));
        u64::from(IRQ_ENABLED.with(|e| e.replace(false)))
    }

    fn restore(state: u64) {
        IRQ_ENABLED.with(|e| e.set(state != 0));
    }
}

fn page_layout(pages: usize) -> Layout {
    Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap()
}

// SAFETY: Heap pages are contiguous and page aligned; bus address equals
// the CPU address in the simulation.
unsafe impl VirtioHal for TestHal {
    fn dma_alloc(pages: usize, _direction: BufferDirection) -> Option<(u64, NonNull<u8>)> {
        let allowed = ALLOC_BUDGET.with(|b| match b.get() {
            None => true,
            Some(0) => false,
            Some(n) => {
                b.set(Some(n - 1));
                true
            }
        });
        if !allowed {
            return None;
        }
        // SAFETY: Non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(page_layout(pages)) })?;
        LIVE_PAGES.with(|c| c.set(c.get() + pages as isize));
        Some((ptr.as_ptr() as u64, ptr))
    }

    unsafe fn dma_dealloc(_paddr: u64, vaddr: NonNull<u8>, pages: usize) {
        LIVE_PAGES.with(|c| c.set(c.get() - pages as isize));
        unsafe { dealloc(vaddr.as_ptr(), page_layout(pages)) };
    }

    unsafe fn share(buffer: NonNull<[u8]>, _direction: BufferDirection) -> u64 {
        buffer.cast::<u8>().as_ptr() as u64
    }

    unsafe fn unshare(_paddr: u64, _buffer: NonNull<[u8]>, _direction: BufferDirection) {}
}

// ============================================================================
// Device model
// ============================================================================

pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const BAR: u8 = 4;
pub const CAP_START: u8 = 0x40;
pub const NOTIFY_MULTIPLIER: u32 = 4;

/// One capability placed in config space.
#[derive(Debug, Clone, Copy)]
pub struct CapSpec {
    pub id: u8,
    pub cfg_type: u8,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    pub cap_len: u8,
    pub multiplier: u32,
}

impl CapSpec {
    pub fn virtio(cfg_type: u8, offset: u32, length: u32) -> Self {
        let notify = cfg_type == cap::NOTIFY_CFG;
        Self {
            id: 0x09,
            cfg_type,
            bar: BAR,
            offset,
            length,
            cap_len: if notify { 20 } else { 16 },
            multiplier: if notify { NOTIFY_MULTIPLIER } else { 0 },
        }
    }

    /// A `virtio_pci_vndr_data` capability carrying `cap_len` bytes.
    pub fn vendor_data(cap_len: u8) -> Self {
        Self {
            id: 0x09,
            cfg_type: cap::VENDOR_CFG,
            bar: 0,
            offset: 0,
            length: 0,
            cap_len,
            multiplier: 0,
        }
    }

    /// A capability that is not vendor-specific (MSI-X).
    pub fn foreign() -> Self {
        Self {
            id: 0x11,
            cfg_type: 0,
            bar: 0,
            offset: 0,
            length: 0,
            cap_len: 12,
            multiplier: 0,
        }
    }
}

/// Layout of the simulated BAR: 4 KiB per region.
pub fn standard_caps() -> Vec<CapSpec> {
    vec![
        CapSpec::foreign(),
        CapSpec::virtio(cap::COMMON_CFG, 0x0000, 0x1000),
        CapSpec::virtio(cap::ISR_CFG, 0x1000, 0x1000),
        CapSpec::virtio(cap::DEVICE_CFG, 0x2000, 0x1000),
        CapSpec::virtio(cap::NOTIFY_CFG, 0x3000, 0x1000),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct QueueModel {
    pub max_size: u16,
    pub size: u16,
    pub enable: u16,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    pub notify_off: u16,
    pub reset_pending: u32,
    pub last_avail: u16,
    pub used_idx: u16,
}

impl QueueModel {
    fn new(max_size: u16, notify_off: u16) -> Self {
        Self {
            max_size,
            size: max_size,
            notify_off,
            ..Self::default()
        }
    }

    fn clear(&mut self) {
        *self = Self::new(self.max_size, self.notify_off);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Map { bar: u8, offset: u64 },
    Unmap { bar: u8, offset: u64 },
    IrqRequest,
    IrqRelease,
}

pub struct Model {
    pub config_space: [u8; 256],
    pub caps: Vec<CapSpec>,
    pub bar_sizes: [u64; 6],

    pub status: u8,
    pub status_writes: Vec<u8>,
    pub generation: u8,
    /// Config generation reads that bump the counter first.
    pub generation_flips: u32,
    pub device_features: u64,
    pub driver_features: u64,
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub queue_select: u16,
    pub queues: Vec<QueueModel>,
    pub isr: u32,
    pub isr_reads: u32,
    pub isr_acks: Vec<u32>,
    pub device_cfg: Vec<u8>,
    /// (offset inside notify region, value written)
    pub doorbells: Vec<(usize, u16)>,
    pub events: Vec<Event>,

    /// `cfg_type` whose region reads as all-ones.
    pub unbacked: Option<u8>,
    pub reject_features_ok: bool,
    pub stuck_reset: bool,
    pub refuse_disable: bool,
    pub fail_map: bool,
    pub fail_irq: bool,
    pub queue_reset_latency: u32,
}

impl Model {
    fn new(device_id: u16, caps: Vec<CapSpec>, queue_sizes: &[u16]) -> Self {
        let mut model = Self {
            config_space: [0; 256],
            caps,
            bar_sizes: [0, 0, 0, 0, 0x4000, 0],
            status: 0,
            status_writes: Vec::new(),
            generation: 0,
            generation_flips: 0,
            device_features: features::VERSION_1
                | features::RING_EVENT_IDX
                | features::RING_RESET
                | features::ANY_LAYOUT
                | VIRTIO_NET_F_MAC,
            driver_features: 0,
            device_feature_select: 0,
            driver_feature_select: 0,
            queue_select: 0,
            queues: queue_sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| QueueModel::new(size, i as u16))
                .collect(),
            isr: 0,
            isr_reads: 0,
            isr_acks: Vec::new(),
            device_cfg: vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56, 0x01, 0x00],
            doorbells: Vec::new(),
            events: Vec::new(),
            unbacked: None,
            reject_features_ok: false,
            stuck_reset: false,
            refuse_disable: false,
            fail_map: false,
            fail_irq: false,
            queue_reset_latency: 0,
        };
        model.config_space[0..2].copy_from_slice(&0x1AF4u16.to_le_bytes());
        model.config_space[2..4].copy_from_slice(&device_id.to_le_bytes());
        model.build_cap_chain();
        model
    }

    /// Lay the capabilities out back to back from `CAP_START`.
    pub fn build_cap_chain(&mut self) {
        self.config_space[0x34] = 0;
        self.config_space[0x40..].fill(0);
        let has_caps = !self.caps.is_empty();
        self.config_space[0x06] = if has_caps { 0x10 } else { 0 };
        if !has_caps {
            return;
        }
        self.config_space[0x34] = CAP_START;

        let mut pos = usize::from(CAP_START);
        let count = self.caps.len();
        for (i, spec) in self.caps.clone().iter().enumerate() {
            // Short capabilities are packed; the next one starts right after.
            let size = usize::from(spec.cap_len.max(4)).next_multiple_of(4);
            let next = if i + 1 == count { 0 } else { pos + size };
            let c = &mut self.config_space[pos..pos + 20];
            c[0] = spec.id;
            c[1] = next as u8;
            c[2] = spec.cap_len;
            c[3] = spec.cfg_type;
            if spec.cap_len >= 16 {
                c[4] = spec.bar;
                c[8..12].copy_from_slice(&spec.offset.to_le_bytes());
                c[12..16].copy_from_slice(&spec.length.to_le_bytes());
            }
            if spec.cap_len >= 20 {
                c[16..20].copy_from_slice(&spec.multiplier.to_le_bytes());
            }
            pos += size;
        }
    }

    /// Vendor capability covering `bar`/`offset`, if any.
    fn region(&self, bar: u8, offset: u64) -> Option<(u8, u64)> {
        self.caps
            .iter()
            .filter(|c| c.id == 0x09 && c.bar == bar)
            .find(|c| offset >= u64::from(c.offset) && offset < u64::from(c.offset) + u64::from(c.length))
            .map(|c| (c.cfg_type, offset - u64::from(c.offset)))
    }

    fn selected(&mut self) -> Option<&mut QueueModel> {
        self.queues.get_mut(usize::from(self.queue_select))
    }

    fn full_reset(&mut self) {
        self.status = 0;
        self.driver_features = 0;
        self.isr = 0;
        for queue in &mut self.queues {
            queue.clear();
        }
    }

    fn read(&mut self, bar: u8, offset: u64, width: usize) -> u64 {
        let all_ones = u64::MAX >> (64 - 8 * width);
        let Some((cfg_type, rel)) = self.region(bar, offset) else {
            return all_ones;
        };
        if self.unbacked == Some(cfg_type) {
            return all_ones;
        }
        let rel = rel as usize;
        match cfg_type {
            cap::COMMON_CFG => self.common_read(rel),
            cap::ISR_CFG => {
                self.isr_reads += 1;
                u64::from(std::mem::take(&mut self.isr))
            }
            cap::DEVICE_CFG => {
                let mut bytes = [0u8; 8];
                for (i, b) in bytes.iter_mut().take(width).enumerate() {
                    *b = self.device_cfg.get(rel + i).copied().unwrap_or(0xFF);
                }
                u64::from_le_bytes(bytes)
            }
            _ => 0,
        }
    }

    fn write(&mut self, bar: u8, offset: u64, width: usize, value: u64) {
        let Some((cfg_type, rel)) = self.region(bar, offset) else {
            return;
        };
        let rel = rel as usize;
        match cfg_type {
            cap::COMMON_CFG => self.common_write(rel, value as u32),
            cap::ISR_CFG => self.isr_acks.push(value as u32),
            cap::DEVICE_CFG => {
                for (i, b) in value.to_le_bytes().iter().take(width).enumerate() {
                    if let Some(slot) = self.device_cfg.get_mut(rel + i) {
                        *slot = *b;
                    }
                }
            }
            cap::NOTIFY_CFG => self.doorbells.push((rel, value as u16)),
            _ => {}
        }
    }

    fn common_read(&mut self, offset: usize) -> u64 {
        use common_cfg as c;
        let value: u32 = match offset {
            c::DEVICE_FEATURE_SELECT => self.device_feature_select,
            c::DEVICE_FEATURE => match self.device_feature_select {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            c::DRIVER_FEATURE_SELECT => self.driver_feature_select,
            c::DRIVER_FEATURE => match self.driver_feature_select {
                0 => self.driver_features as u32,
                1 => (self.driver_features >> 32) as u32,
                _ => 0,
            },
            c::CONFIG_MSIX_VECTOR | c::QUEUE_MSIX_VECTOR => u32::from(c::NO_VECTOR),
            c::NUM_QUEUES => self.queues.len() as u32,
            c::DEVICE_STATUS => u32::from(self.status),
            c::CONFIG_GENERATION => {
                if self.generation_flips > 0 {
                    self.generation_flips -= 1;
                    self.generation = self.generation.wrapping_add(1);
                }
                u32::from(self.generation)
            }
            c::QUEUE_SELECT => u32::from(self.queue_select),
            c::QUEUE_SIZE => self.selected().map_or(0, |q| u32::from(q.size)),
            c::QUEUE_ENABLE => self.selected().map_or(0, |q| u32::from(q.enable)),
            c::QUEUE_NOTIFY_OFF => self.selected().map_or(0, |q| u32::from(q.notify_off)),
            c::QUEUE_DESC => self.selected().map_or(0, |q| q.desc as u32),
            0x24 => self.selected().map_or(0, |q| (q.desc >> 32) as u32),
            c::QUEUE_DRIVER => self.selected().map_or(0, |q| q.driver as u32),
            0x2C => self.selected().map_or(0, |q| (q.driver >> 32) as u32),
            c::QUEUE_DEVICE => self.selected().map_or(0, |q| q.device as u32),
            0x34 => self.selected().map_or(0, |q| (q.device >> 32) as u32),
            c::QUEUE_NOTIFY_DATA => u32::from(self.queue_select),
            c::QUEUE_RESET => match self.selected() {
                Some(q) if q.reset_pending > 0 => {
                    q.reset_pending -= 1;
                    1
                }
                _ => 0,
            },
            _ => 0,
        };
        u64::from(value)
    }

    fn common_write(&mut self, offset: usize, value: u32) {
        use common_cfg as c;
        let refuse_disable = self.refuse_disable;
        let reset_latency = self.queue_reset_latency;
        match offset {
            c::DEVICE_FEATURE_SELECT => self.device_feature_select = value,
            c::DRIVER_FEATURE_SELECT => self.driver_feature_select = value,
            c::DRIVER_FEATURE => match self.driver_feature_select {
                0 => {
                    self.driver_features =
                        (self.driver_features & !0xFFFF_FFFF) | u64::from(value);
                }
                1 => {
                    self.driver_features =
                        (self.driver_features & 0xFFFF_FFFF) | (u64::from(value) << 32);
                }
                _ => {}
            },
            c::DEVICE_STATUS => {
                let status = value as u8;
                self.status_writes.push(status);
                if status == 0 {
                    if !self.stuck_reset {
                        self.full_reset();
                    }
                } else if self.reject_features_ok {
                    self.status = status & !DeviceStatus::FEATURES_OK.bits();
                } else {
                    self.status = status;
                }
            }
            c::QUEUE_SELECT => self.queue_select = value as u16,
            c::QUEUE_SIZE => {
                if let Some(q) = self.selected() {
                    q.size = value as u16;
                }
            }
            c::QUEUE_ENABLE => {
                if let Some(q) = self.selected() {
                    if value != 0 || !refuse_disable {
                        q.enable = value as u16;
                    }
                }
            }
            c::QUEUE_DESC => set_low(self.selected().map(|q| &mut q.desc), value),
            0x24 => set_high(self.selected().map(|q| &mut q.desc), value),
            c::QUEUE_DRIVER => set_low(self.selected().map(|q| &mut q.driver), value),
            0x2C => set_high(self.selected().map(|q| &mut q.driver), value),
            c::QUEUE_DEVICE => set_low(self.selected().map(|q| &mut q.device), value),
            0x34 => set_high(self.selected().map(|q| &mut q.device), value),
            c::QUEUE_RESET => {
                if value == 1 {
                    if let Some(q) = self.selected() {
                        q.enable = 0;
                        q.last_avail = 0;
                        q.used_idx = 0;
                        q.reset_pending = reset_latency;
                    }
                }
            }
            _ => {}
        }
    }
}

fn set_low(field: Option<&mut u64>, value: u32) {
    if let Some(f) = field {
        *f = (*f & !0xFFFF_FFFF) | u64::from(value);
    }
}

fn set_high(field: Option<&mut u64>, value: u32) {
    if let Some(f) = field {
        *f = (*f & 0xFFFF_FFFF) | (u64::from(value) << 32);
    }
}

// ============================================================================
// Shared handle and device-side ring processing
// ============================================================================

/// Shared handle to the model.
#[derive(Clone)]
pub struct Sim(Arc<Mutex<Model>>);

impl Sim {
    /// A network device with rx=256, tx=256 and an absent control queue.
    pub fn net() -> Self {
        Self::with_caps(0x1041, standard_caps(), &[256, 256, 0])
    }

    pub fn with_caps(device_id: u16, caps: Vec<CapSpec>, queue_sizes: &[u16]) -> Self {
        init_logger();
        Sim(Arc::new(Mutex::new(Model::new(device_id, caps, queue_sizes))))
    }

    pub fn model(&self) -> MutexGuard<'_, Model> {
        self.0.lock().unwrap()
    }

    pub fn platform(&self) -> SimPlatform {
        SimPlatform { sim: self.clone() }
    }

    /// Replace the capability list and rebuild config space.
    pub fn set_caps(&self, caps: Vec<CapSpec>) {
        let mut m = self.model();
        m.caps = caps;
        m.build_cap_chain();
    }

    /// Firmware left the device running and it ignores reset.
    pub fn stick_reset(&self) {
        let mut m = self.model();
        m.status = (DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER).bits();
        m.stuck_reset = true;
    }

    pub fn raise_isr(&self, bits: u32) {
        self.model().isr |= bits;
    }

    pub fn maps(&self) -> usize {
        self.count(|e| matches!(e, Event::Map { .. }))
    }

    pub fn unmaps(&self) -> usize {
        self.count(|e| matches!(e, Event::Unmap { .. }))
    }

    pub fn events(&self) -> Vec<Event> {
        self.model().events.clone()
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.model().events.iter().filter(|e| f(e)).count()
    }

    /// Consume the next available chain of `queue` and mark it used with
    /// up to `written` bytes. Returns the head index.
    pub fn complete(&self, queue: u16, written: u32) -> Option<u16> {
        let mut m = self.model();
        let q = m.queues.get_mut(usize::from(queue))?;
        if q.enable == 0 {
            return None;
        }
        // SAFETY: ring addresses are live heap allocations from TestHal
        // while the queue is enabled.
        unsafe {
            fence(Ordering::SeqCst);
            let avail_idx = read_u16(q.driver + 2);
            if avail_idx == q.last_avail {
                return None;
            }
            let slot = u64::from(q.last_avail % q.size);
            let head = read_u16(q.driver + 4 + 2 * slot);
            q.last_avail = q.last_avail.wrapping_add(1);

            let mut writable = 0u64;
            let mut index = head;
            for _ in 0..q.size {
                let desc = read_desc(q.desc, index);
                let flags = DescriptorFlags::from_bits_retain(desc.flags);
                if flags.contains(DescriptorFlags::WRITE) {
                    writable += u64::from(desc.len);
                }
                if !flags.contains(DescriptorFlags::NEXT) {
                    break;
                }
                index = desc.next;
            }
            let len = u64::from(written).min(writable) as u32;
            push_used(q, u32::from(head), len);
            m.isr |= 1;
            Some(head)
        }
    }

    /// Put an arbitrary element on the used ring.
    pub fn push_raw_used(&self, queue: u16, id: u32, len: u32) {
        let mut m = self.model();
        let q = &mut m.queues[usize::from(queue)];
        // SAFETY: see `complete`.
        unsafe { push_used(q, id, len) };
        m.isr |= 1;
    }

    /// Set or clear `VIRTQ_USED_F_NO_NOTIFY`.
    pub fn set_no_notify(&self, queue: u16, on: bool) {
        let m = self.model();
        let q = &m.queues[usize::from(queue)];
        // SAFETY: see `complete`.
        unsafe { write_u16(q.device, u16::from(on)) };
    }

    /// Read the driver's `used_event` field.
    pub fn used_event(&self, queue: u16) -> u16 {
        let m = self.model();
        let q = &m.queues[usize::from(queue)];
        // SAFETY: see `complete`.
        unsafe { read_u16(q.driver + 4 + 2 * u64::from(q.size)) }
    }

    /// Write the device's `avail_event` field.
    pub fn set_avail_event(&self, queue: u16, value: u16) {
        let m = self.model();
        let q = &m.queues[usize::from(queue)];
        // SAFETY: see `complete`.
        unsafe { write_u16(q.device + 4 + 8 * u64::from(q.size), value) };
    }

    /// Descriptor `index` of `queue`'s table, as the device sees it.
    pub fn descriptor(&self, queue: u16, index: u16) -> Descriptor {
        let m = self.model();
        // SAFETY: see `complete`.
        unsafe { read_desc(m.queues[usize::from(queue)].desc, index) }
    }
}

unsafe fn read_u16(addr: u64) -> u16 {
    u16::from_le(unsafe { (addr as *const u16).read_volatile() })
}

unsafe fn write_u16(addr: u64, value: u16) {
    unsafe { (addr as *mut u16).write_volatile(value.to_le()) };
}

unsafe fn read_desc(table: u64, index: u16) -> Descriptor {
    let raw = unsafe { (table as *const Descriptor).add(usize::from(index)).read_volatile() };
    Descriptor {
        addr: u64::from_le(raw.addr),
        len: u32::from_le(raw.len),
        flags: u16::from_le(raw.flags),
        next: u16::from_le(raw.next),
    }
}

unsafe fn push_used(q: &mut QueueModel, id: u32, len: u32) {
    let slot = u64::from(q.used_idx % q.size);
    let elem = UsedElem {
        id: id.to_le(),
        len: len.to_le(),
    };
    unsafe { ((q.device + 4 + 8 * slot) as *mut UsedElem).write_volatile(elem) };
    fence(Ordering::SeqCst);
    q.used_idx = q.used_idx.wrapping_add(1);
    unsafe { write_u16(q.device + 2, q.used_idx) };
}

// ============================================================================
// Platform
// ============================================================================

pub struct SimPlatform {
    sim: Sim,
}

/// A mapped slice of the simulated BAR.
pub struct SimWindow {
    sim: Sim,
    bar: u8,
    offset: u64,
    len: usize,
}

impl SimWindow {
    fn read(&self, offset: usize, width: usize) -> u64 {
        if offset + width > self.len {
            return u64::MAX >> (64 - 8 * width);
        }
        self.sim
            .model()
            .read(self.bar, self.offset + offset as u64, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) {
        if offset + width > self.len {
            return;
        }
        self.sim
            .model()
            .write(self.bar, self.offset + offset as u64, width, value);
    }
}

/// Fake CPU address of a BAR offset, for doorbell arithmetic checks.
pub fn bar_address(bar: u8, offset: u64) -> usize {
    0x4000_0000 + usize::from(bar) * 0x0100_0000 + offset as usize
}

impl RegisterIo for SimWindow {
    fn base_address(&self) -> usize {
        bar_address(self.bar, self.offset)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read8(&self, offset: usize) -> u8 {
        self.read(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.read(offset, 2) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read(offset, 4) as u32
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, 1, u64::from(value));
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, 2, u64::from(value));
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, 4, u64::from(value));
    }
}

impl Drop for SimWindow {
    fn drop(&mut self) {
        self.sim.model().events.push(Event::Unmap {
            bar: self.bar,
            offset: self.offset,
        });
    }
}

/// Registered interrupt handler; unregistered on drop.
pub struct SimIrq {
    sim: Sim,
}

impl Drop for SimIrq {
    fn drop(&mut self) {
        self.sim.model().events.push(Event::IrqRelease);
    }
}

impl PciPlatform for SimPlatform {
    type Window = SimWindow;
    type Irq = SimIrq;
    type Mask = TestHal;

    fn read_config_dword(&self, offset: u16) -> Option<u32> {
        let m = self.sim.model();
        let start = usize::from(offset);
        let bytes = m.config_space.get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bar_len(&self, bar: u8) -> u64 {
        self.sim
            .model()
            .bar_sizes
            .get(usize::from(bar))
            .copied()
            .unwrap_or(0)
    }

    fn map_bar(&mut self, bar: u8, offset: u64, length: usize) -> Option<SimWindow> {
        let mut m = self.sim.model();
        if m.fail_map {
            return None;
        }
        m.events.push(Event::Map { bar, offset });
        drop(m);
        Some(SimWindow {
            sim: self.sim.clone(),
            bar,
            offset,
            len: length,
        })
    }

    fn request_irq(&mut self) -> Option<SimIrq> {
        let mut m = self.sim.model();
        if m.fail_irq {
            return None;
        }
        m.events.push(Event::IrqRequest);
        Some(SimIrq {
            sim: self.sim.clone(),
        })
    }
}
