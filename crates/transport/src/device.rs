//! Consumer-facing device handle.
//!
//! [`VirtioDevice`] ties a [`Transport`] to the negotiation state machine
//! and the set of open virtqueues. Device-type drivers (net, block, ...)
//! are built on top of it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use vpci_utils::{IrqSafeReadGuard, IrqSafeRwLock, poll_until};

use crate::TransportError;
use crate::config::TransportConfig;
use crate::hal::{BufferDirection, VirtioHal};
use crate::negotiate::{self, InitState, StateCell};
use crate::pci::{PciPlatform, PciTransport};
use crate::queue::{Completion, MAX_QUEUE_SIZE, Segment, Token, VirtQueue};
use crate::regs::{DeviceStatus, features};
use crate::transport::{AccessWidth, Transport};

/// Per-queue event handler, called from interrupt context.
///
/// Must be short and must not block: the only guarantee is that it runs
/// before the next interrupt of the same device is handled.
pub type QueueCallback = Box<dyn Fn(u16) + Send + Sync>;

/// Configuration-change handler, called from interrupt context with the
/// freshly read status byte.
pub type ConfigCallback = Box<dyn Fn(DeviceStatus) + Send + Sync>;

/// A queue the consumer wants opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub index: u16,
    pub name: &'static str,
    /// Absent required queues fail `open`; absent optional ones are skipped.
    pub required: bool,
    /// Upper bound on this queue's size.
    pub max_size: u16,
}

impl QueueSpec {
    pub const fn required(index: u16, name: &'static str) -> Self {
        Self {
            index,
            name,
            required: true,
            max_size: MAX_QUEUE_SIZE,
        }
    }

    pub const fn optional(index: u16, name: &'static str) -> Self {
        Self {
            index,
            name,
            required: false,
            max_size: MAX_QUEUE_SIZE,
        }
    }

    pub const fn with_max_size(mut self, max_size: u16) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Largest power of two not above any of the limits.
pub fn choose_queue_size(device_max: u16, requested: u16, config_max: u16) -> u16 {
    let limit = device_max.min(requested).min(config_max).min(MAX_QUEUE_SIZE);
    match limit {
        0 => 0,
        n => 1 << (15 - n.leading_zeros()),
    }
}

pub(crate) struct QueueSlot<H: VirtioHal> {
    pub(crate) name: &'static str,
    pub(crate) queue: VirtQueue<H>,
    pub(crate) callback: Option<QueueCallback>,
}

impl<H: VirtioHal> QueueSlot<H> {
    pub(crate) fn index(&self) -> u16 {
        self.queue.index()
    }
}

/// A virtio device driven through transport `T` with DMA from HAL `H`.
pub struct VirtioDevice<T: Transport, H: VirtioHal> {
    transport: T,
    config: TransportConfig,
    state: StateCell,
    negotiated: AtomicU64,
    /// Open queues, sorted by index.
    pub(crate) queues: IrqSafeRwLock<H, Vec<QueueSlot<H>>>,
    pub(crate) config_callback: IrqSafeRwLock<H, Option<ConfigCallback>>,
}

impl<P: PciPlatform, H: VirtioHal> VirtioDevice<PciTransport<P>, H> {
    /// Probe a PCI function and negotiate features.
    pub fn attach_pci(platform: &mut P, config: TransportConfig) -> Result<Self, TransportError> {
        let transport = PciTransport::probe(platform)?;
        Self::attach(transport, config)
    }
}

impl<T: Transport, H: VirtioHal> VirtioDevice<T, H> {
    /// Negotiate features over an already probed transport.
    ///
    /// On failure the transport is dropped, releasing its interrupt and
    /// regions.
    pub fn attach(transport: T, config: TransportConfig) -> Result<Self, TransportError> {
        let device = Self {
            transport,
            config,
            state: StateCell::new(),
            negotiated: AtomicU64::new(0),
            queues: IrqSafeRwLock::new(Vec::new()),
            config_callback: IrqSafeRwLock::new(None),
        };
        device.negotiate()?;
        log::info!(
            "[VIRTIO] {:?} attached, features {:#x}",
            device.transport.device_type(),
            device.negotiated_features()
        );
        Ok(device)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> InitState {
        self.state.get()
    }

    pub fn negotiated_features(&self) -> u64 {
        self.negotiated.load(Ordering::Acquire)
    }

    pub fn has_feature(&self, bit: u64) -> bool {
        self.negotiated_features() & bit == bit
    }

    /// Run the handshake up to `FeaturesOk`.
    ///
    /// Valid on a fresh device or after [`reset`](Self::reset).
    pub fn negotiate(&self) -> Result<u64, TransportError> {
        if !self.queues.read().is_empty() {
            log::error!("[VIRTIO] Cannot renegotiate with queues open");
            return Err(TransportError::NotReady);
        }
        let negotiated = negotiate::negotiate(
            &self.transport,
            &self.state,
            self.config.driver_features,
            self.config.reset_poll_limit,
        )?;
        self.negotiated.store(negotiated, Ordering::Release);
        Ok(negotiated)
    }

    /// Device size of queue `index`, `None` when the queue does not exist.
    pub fn probe(&self, index: u16) -> Option<u16> {
        if index >= self.transport.num_queues() {
            return None;
        }
        match self.transport.max_queue_size(index) {
            0 => None,
            size => Some(size),
        }
    }

    /// Create and enable the listed queues, then set `DRIVER_OK`.
    ///
    /// If anything fails, the queues created by this call are torn down in
    /// reverse order and the device stays in `FeaturesOk`.
    pub fn open(&self, specs: &[QueueSpec]) -> Result<(), TransportError> {
        if self.state.get() != InitState::FeaturesOk {
            log::error!("[VIRTIO] open in state {:?}", self.state.get());
            return Err(TransportError::NotReady);
        }
        let mut table = self.queues.write();
        let mut created: Vec<QueueSlot<H>> = Vec::with_capacity(specs.len());

        for spec in specs {
            match self.create_queue(spec, &table, &created) {
                Ok(Some(slot)) => created.push(slot),
                Ok(None) => {}
                Err(e) => {
                    self.rollback(created);
                    return Err(e);
                }
            }
        }

        if let Err(e) = negotiate::set_driver_ok(&self.transport, &self.state) {
            self.rollback(created);
            return Err(e);
        }

        let opened = created.len();
        table.extend(created);
        table.sort_by_key(QueueSlot::index);
        log::info!("[VIRTIO] {} queues open, device live", opened);
        Ok(())
    }

    fn create_queue(
        &self,
        spec: &QueueSpec,
        table: &[QueueSlot<H>],
        created: &[QueueSlot<H>],
    ) -> Result<Option<QueueSlot<H>>, TransportError> {
        if table.iter().chain(created).any(|s| s.index() == spec.index) {
            log::error!("[VIRTIO] queue {} ({}) already open", spec.index, spec.name);
            return Err(TransportError::ConfigurationError);
        }
        let Some(device_max) = self.probe(spec.index) else {
            if spec.required {
                log::error!(
                    "[VIRTIO] required queue {} ({}) not present",
                    spec.index,
                    spec.name
                );
                return Err(TransportError::ConfigurationError);
            }
            log::debug!(
                "[VIRTIO] optional queue {} ({}) not present",
                spec.index,
                spec.name
            );
            return Ok(None);
        };

        let size = choose_queue_size(device_max, spec.max_size, self.config.max_queue_size);
        if size == 0 {
            log::error!("[VIRTIO] queue {} ({}): size limit is zero", spec.index, spec.name);
            return Err(TransportError::ConfigurationError);
        }
        let queue = VirtQueue::new(
            spec.index,
            size,
            self.has_feature(features::RING_EVENT_IDX),
        )?;
        self.transport
            .setup_queue(spec.index, size, queue.addresses())?;
        log::debug!(
            "[VIRTIO] queue {} ({}) size {} (device max {})",
            spec.index,
            spec.name,
            size,
            device_max
        );
        Ok(Some(QueueSlot {
            name: spec.name,
            queue,
            callback: None,
        }))
    }

    fn rollback(&self, mut created: Vec<QueueSlot<H>>) {
        while let Some(slot) = created.pop() {
            if let Err(slot) = self.release_queue(slot) {
                core::mem::forget(slot);
            }
        }
    }

    /// Disable a queue on the device, then free its memory.
    ///
    /// Gives the slot back when the device still reports the queue enabled;
    /// its memory must not be freed then.
    fn release_queue(&self, slot: QueueSlot<H>) -> Result<(), QueueSlot<H>> {
        let index = slot.index();
        self.transport.disable_queue(index);
        if self.transport.queue_enabled(index) {
            log::error!(
                "[VIRTIO] queue {} ({}) still enabled after disable",
                index,
                slot.name
            );
            return Err(slot);
        }
        drop(slot);
        log::trace!("[VIRTIO] queue {} released", index);
        Ok(())
    }

    fn live(&self) -> Result<(), TransportError> {
        match self.state.get() {
            InitState::DriverOk => Ok(()),
            InitState::Failed => Err(TransportError::DeviceFailed),
            _ => Err(TransportError::NotReady),
        }
    }

    fn with_queue<R>(
        &self,
        index: u16,
        f: impl FnOnce(&VirtQueue<H>) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let table = self.queues.read();
        let Some(slot) = table.iter().find(|s| s.index() == index) else {
            log::error!("[VIRTIO] queue {} is not open", index);
            return Err(TransportError::NotReady);
        };
        f(&slot.queue)
    }

    /// Publish a single-direction chain.
    ///
    /// `DriverToDevice` chains are device-readable, `DeviceToDriver` chains
    /// device-writable. Mixed chains go through [`submit_chain`](Self::submit_chain).
    pub fn submit(
        &self,
        queue: u16,
        segments: &[Segment],
        direction: BufferDirection,
    ) -> Result<Token, TransportError> {
        match direction {
            BufferDirection::DriverToDevice => self.submit_chain(queue, segments, &[]),
            BufferDirection::DeviceToDriver => self.submit_chain(queue, &[], segments),
            BufferDirection::Both => {
                log::error!("[VIRTIO] queue {}: a chain has one direction per segment", queue);
                Err(TransportError::InvalidBuffer)
            }
        }
    }

    /// Publish a chain of device-readable then device-writable segments.
    pub fn submit_chain(
        &self,
        queue: u16,
        readable: &[Segment],
        writable: &[Segment],
    ) -> Result<Token, TransportError> {
        self.live()?;
        self.with_queue(queue, |q| q.add(readable, writable))
    }

    /// Ring the doorbell unless the device suppressed notifications.
    ///
    /// Returns whether the doorbell was written.
    pub fn notify(&self, queue: u16) -> Result<bool, TransportError> {
        self.live()?;
        let wanted = self.with_queue(queue, |q| Ok(q.should_notify()))?;
        if wanted {
            self.transport.notify(queue)?;
        } else {
            log::trace!("[VIRTIO] queue {}: notification suppressed", queue);
        }
        Ok(wanted)
    }

    /// Completions that arrived since the last drain.
    ///
    /// The iterator is lazy and bounded by the entries present when it was
    /// created; calling again picks up anything newer.
    pub fn poll_completions(&self, queue: u16) -> Result<Completions<'_, H>, TransportError> {
        let table = self.queues.read();
        let Some(position) = table.iter().position(|s| s.index() == queue) else {
            log::error!("[VIRTIO] queue {} is not open", queue);
            return Err(TransportError::NotReady);
        };
        let q = &table[position].queue;
        let remaining = q.used_idx().wrapping_sub(q.last_used_idx());
        Ok(Completions {
            table,
            position,
            remaining,
        })
    }

    /// Whether `queue` has completions waiting.
    pub fn pending(&self, queue: u16) -> bool {
        self.with_queue(queue, |q| Ok(q.pending()))
            .unwrap_or(false)
    }

    /// Free descriptors left in `queue`.
    pub fn num_free(&self, queue: u16) -> Result<u16, TransportError> {
        self.with_queue(queue, |q| Ok(q.num_free()))
    }

    /// Turn used-buffer interrupts for `queue` off or back on.
    pub fn set_interrupt_suppression(
        &self,
        queue: u16,
        suppressed: bool,
    ) -> Result<(), TransportError> {
        self.with_queue(queue, |q| {
            q.set_interrupt_suppressed(suppressed);
            Ok(())
        })
    }

    /// Install the event handler for an open queue.
    pub fn register_queue_callback(
        &self,
        queue: u16,
        callback: QueueCallback,
    ) -> Result<(), TransportError> {
        let mut table = self.queues.write();
        let Some(slot) = table.iter_mut().find(|s| s.index() == queue) else {
            log::error!("[VIRTIO] queue {} is not open", queue);
            return Err(TransportError::NotReady);
        };
        slot.callback = Some(callback);
        Ok(())
    }

    pub fn register_config_callback(&self, callback: ConfigCallback) {
        *self.config_callback.write() = Some(callback);
    }

    /// Indices of the open queues, ascending.
    pub fn open_queues(&self) -> Vec<u16> {
        self.queues.read().iter().map(QueueSlot::index).collect()
    }

    pub fn read_device_config(
        &self,
        offset: usize,
        width: AccessWidth,
    ) -> Result<u32, TransportError> {
        self.transport.read_config(offset, width)
    }

    pub fn write_device_config(
        &self,
        offset: usize,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), TransportError> {
        self.transport.write_config(offset, width, value)
    }

    /// Run `read` until the config generation is the same before and after.
    pub fn read_device_config_consistent<R>(
        &self,
        mut read: impl FnMut(&Self) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let outcome = poll_until(self.config.generation_retry_limit, || {
            let before = self.transport.config_generation();
            let result = read(self);
            let after = self.transport.config_generation();
            match result {
                Err(e) => Some(Err(e)),
                Ok(value) if before == after => Some(Ok(value)),
                Ok(_) => None,
            }
        });
        match outcome {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "[VIRTIO] config generation kept changing over {} reads",
                    e.attempts
                );
                Err(TransportError::Timeout)
            }
        }
    }

    /// Re-read the status byte; `DeviceFailed` once the device has reset
    /// itself or asked for a reset.
    pub fn check_status(&self) -> Result<DeviceStatus, TransportError> {
        negotiate::check_status(&self.transport, &self.state)
    }

    /// Disable one queue and free its memory.
    pub fn destroy_queue(&self, index: u16) -> Result<(), TransportError> {
        let mut table = self.queues.write();
        let Some(position) = table.iter().position(|s| s.index() == index) else {
            return Err(TransportError::NotReady);
        };
        let slot = table.remove(position);
        match self.release_queue(slot) {
            Ok(()) => Ok(()),
            Err(slot) => {
                // Keep the memory alive while the device may still use it.
                table.insert(position, slot);
                Err(TransportError::IoError)
            }
        }
    }

    /// Reset one queue in place (`VIRTIO_F_RING_RESET`).
    ///
    /// In-flight chains are dropped; the queue comes back empty with the
    /// same size and addresses.
    pub fn reset_queue(&self, index: u16) -> Result<(), TransportError> {
        if !self.has_feature(features::RING_RESET) {
            log::error!("[VIRTIO] queue reset without RING_RESET");
            return Err(TransportError::NotReady);
        }
        self.live()?;
        self.with_queue(index, |q| {
            self.transport
                .reset_queue(index, self.config.reset_poll_limit)?;
            q.reinit();
            self.transport.setup_queue(index, q.size(), q.addresses())?;
            log::debug!("[VIRTIO] queue {} reset", index);
            Ok(())
        })
    }

    /// Full device reset: status 0, then every queue is freed.
    ///
    /// If the device never confirms the reset, queues stay allocated and
    /// `Timeout` is returned.
    pub fn reset(&self) -> Result<(), TransportError> {
        negotiate::reset_device(&self.transport, self.config.reset_poll_limit)?;
        self.state.set(InitState::Reset);
        self.negotiated.store(0, Ordering::Release);

        let mut table = self.queues.write();
        while let Some(slot) = table.pop() {
            if let Err(slot) = self.release_queue(slot) {
                core::mem::forget(slot);
            }
        }
        log::info!("[VIRTIO] device reset");
        Ok(())
    }
}

impl<T: Transport, H: VirtioHal> Drop for VirtioDevice<T, H> {
    fn drop(&mut self) {
        if self.reset().is_err() {
            let leaked = self.queues.get_mut().len();
            log::error!(
                "[VIRTIO] reset did not complete; leaking {} queues the device may still use",
                leaked
            );
            for slot in self.queues.get_mut().drain(..) {
                core::mem::forget(slot);
            }
        }
    }
}

/// Lazy drain of one queue's used ring. See [`VirtioDevice::poll_completions`].
///
/// Holds the queue table, and with it masked interrupts, until dropped.
pub struct Completions<'a, H: VirtioHal> {
    table: IrqSafeReadGuard<'a, H, Vec<QueueSlot<H>>>,
    position: usize,
    remaining: u16,
}

impl<H: VirtioHal> Iterator for Completions<'_, H> {
    type Item = Completion;

    fn next(&mut self) -> Option<Completion> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let completion = self.table[self.position].queue.pop_used();
        if completion.is_none() {
            self.remaining = 0;
        }
        completion
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(usize::from(self.remaining)))
    }
}
