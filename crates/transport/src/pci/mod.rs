//! Virtio over PCI.
//!
//! [`PciTransport::probe`] identifies the function, maps its capability
//! regions and registers its interrupt. Afterwards it serves every
//! [`Transport`] operation through those regions. Anything that depends on
//! `queue_select` or a feature selector holds the single selector token for
//! the whole select-then-access sequence.

pub mod caps;
pub mod common;

use vpci_utils::{InterruptMask, IrqSafeLock, poll_until};

use self::caps::{RegionRole, RegionSet};
use self::common::{CommonCfg, SelectedQueue};
use crate::TransportError;
use crate::mmio::RegisterIo;
use crate::regs::{DeviceStatus, IsrStatus, pci};
use crate::transport::{AccessWidth, DeviceType, QueueAddresses, Transport};

/// What the transport needs from the bus layer.
///
/// Resources are released by dropping them: a `Window` unmaps its region,
/// an `Irq` unregisters the handler.
pub trait PciPlatform {
    type Window: RegisterIo;
    type Irq;
    /// Masks interrupts while the selector token is held.
    type Mask: InterruptMask;

    /// Read a dword of configuration space. `offset` is dword aligned.
    fn read_config_dword(&self, offset: u16) -> Option<u32>;

    /// Size of a BAR in bytes, 0 when the BAR is not implemented.
    fn bar_len(&self, bar: u8) -> u64;

    /// Map `length` bytes of `bar` starting at `offset`.
    fn map_bar(&mut self, bar: u8, offset: u64, length: usize) -> Option<Self::Window>;

    /// Register the device's (shared) interrupt line.
    fn request_irq(&mut self) -> Option<Self::Irq>;
}

/// A probed virtio PCI function.
pub struct PciTransport<P: PciPlatform> {
    device_type: DeviceType,
    device_id: u16,
    // Field order is drop order: the IRQ goes before the regions.
    _irq: P::Irq,
    regions: RegionSet<P::Window>,
    selector: IrqSafeLock<P::Mask, ()>,
}

impl<P: PciPlatform> PciTransport<P> {
    /// Identify the function, map its regions and register its interrupt.
    ///
    /// On failure everything acquired so far is released in reverse order.
    pub fn probe(platform: &mut P) -> Result<Self, TransportError> {
        let Some(id) = platform.read_config_dword(pci::ID_OFFSET) else {
            log::error!("[VIRTIO-PCI] Cannot read device identity");
            return Err(TransportError::IoError);
        };
        let vendor_id = id as u16;
        let device_id = (id >> 16) as u16;
        if vendor_id != pci::VENDOR_ID_VIRTIO {
            log::error!(
                "[VIRTIO-PCI] Vendor {:#06x} is not a virtio vendor",
                vendor_id
            );
            return Err(TransportError::ConfigurationError);
        }
        let device_type = DeviceType::from_pci_device_id(device_id);
        if device_type == DeviceType::Invalid {
            log::warn!("[VIRTIO-PCI] Unknown device id {:#06x}", device_id);
        }

        let capabilities = caps::walk_capabilities(platform)?;
        let regions = caps::map_regions(platform, &capabilities)?;

        let Some(irq) = platform.request_irq() else {
            log::error!("[VIRTIO-PCI] Failed to register interrupt handler");
            return Err(TransportError::ResourceExhaustion);
        };

        log::info!(
            "[VIRTIO-PCI] {:?} device {:#06x}: {} regions mapped",
            device_type,
            device_id,
            regions.len()
        );
        Ok(Self {
            device_type,
            device_id,
            _irq: irq,
            regions,
            selector: IrqSafeLock::new(()),
        })
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn regions(&self) -> &RegionSet<P::Window> {
        &self.regions
    }

    fn common(&self) -> CommonCfg<'_, P::Window> {
        CommonCfg::new(self.regions.common())
    }

    /// Select `queue`, holding the selector token until the handle drops.
    pub fn select_queue(&self, queue: u16) -> SelectedQueue<'_, '_, P::Window, P::Mask> {
        self.common().select(self.selector.lock(), queue)
    }

    /// Byte offset of a doorbell inside the notify region.
    fn doorbell_offset(&self, notify_off: u16) -> Result<usize, TransportError> {
        let Some(notify) = self.regions.window(RegionRole::Notify) else {
            log::error!("[VIRTIO-PCI] Device has no notify region");
            return Err(TransportError::ConfigurationError);
        };
        let offset = usize::from(notify_off) * self.regions.notify_off_multiplier() as usize;
        if offset + 2 > notify.len() {
            log::error!(
                "[VIRTIO-PCI] Doorbell offset {:#x} outside notify region of {:#x} bytes",
                offset,
                notify.len()
            );
            return Err(TransportError::ConfigurationError);
        }
        Ok(offset)
    }

    /// CPU address of the doorbell for `queue`.
    ///
    /// This is `notify base + queue_notify_off * notify_off_multiplier`.
    pub fn notify_address(&self, queue: u16) -> Result<usize, TransportError> {
        let notify_off = self.select_queue(queue).notify_off();
        let offset = self.doorbell_offset(notify_off)?;
        let base = self
            .regions
            .window(RegionRole::Notify)
            .map_or(0, RegisterIo::base_address);
        Ok(base + offset)
    }

    fn device_window(
        &self,
        offset: usize,
        width: AccessWidth,
    ) -> Result<&P::Window, TransportError> {
        let Some(window) = self.regions.window(RegionRole::Device) else {
            log::error!(
                "[VIRTIO-PCI] No device config region for access at {:#x}",
                offset
            );
            return Err(TransportError::ConfigurationError);
        };
        if offset + width.bytes() > window.len() {
            log::error!(
                "[VIRTIO-PCI] Device config access {:#x}+{} beyond {:#x} bytes",
                offset,
                width.bytes(),
                window.len()
            );
            return Err(TransportError::ConfigurationError);
        }
        Ok(window)
    }
}

impl<P: PciPlatform> Transport for PciTransport<P> {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn read_status(&self) -> DeviceStatus {
        self.common().status()
    }

    fn write_status(&self, status: DeviceStatus) {
        log::trace!("[VIRTIO-PCI] status <- {:#04x}", status.bits());
        self.common().set_status(status);
    }

    fn read_device_features(&self) -> u64 {
        let token = self.selector.lock();
        self.common().device_features(&token)
    }

    fn write_driver_features(&self, features: u64) {
        let token = self.selector.lock();
        self.common().set_driver_features(&token, features);
    }

    fn read_driver_features(&self) -> u64 {
        let token = self.selector.lock();
        self.common().driver_features(&token)
    }

    fn num_queues(&self) -> u16 {
        self.common().num_queues()
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        self.select_queue(queue).size()
    }

    fn setup_queue(
        &self,
        queue: u16,
        size: u16,
        addrs: QueueAddresses,
    ) -> Result<(), TransportError> {
        let selected = self.select_queue(queue);
        // Refuse queues whose doorbell cannot be rung before enabling them.
        self.doorbell_offset(selected.notify_off())?;
        selected.set_size(size);
        selected.set_addresses(addrs);
        selected.set_enabled(true);
        log::trace!(
            "[VIRTIO-PCI] queue {} enabled: size {} desc {:#x} driver {:#x} device {:#x}",
            queue,
            size,
            addrs.desc,
            addrs.driver,
            addrs.device
        );
        Ok(())
    }

    fn disable_queue(&self, queue: u16) {
        self.select_queue(queue).set_enabled(false);
    }

    fn queue_enabled(&self, queue: u16) -> bool {
        self.select_queue(queue).enabled()
    }

    fn reset_queue(&self, queue: u16, poll_limit: u32) -> Result<(), TransportError> {
        let selected = self.select_queue(queue);
        selected.request_reset();
        poll_until(poll_limit, || (!selected.reset_pending()).then_some(())).map_err(|e| {
            log::error!(
                "[VIRTIO-PCI] queue {} reset still pending after {} polls",
                queue,
                e.attempts
            );
            TransportError::Timeout
        })
    }

    fn notify(&self, queue: u16) -> Result<(), TransportError> {
        let selected = self.select_queue(queue);
        let offset = self.doorbell_offset(selected.notify_off())?;
        if let Some(notify) = self.regions.window(RegionRole::Notify) {
            log::trace!("[VIRTIO-PCI] doorbell queue {} at +{:#x}", queue, offset);
            notify.write16(offset, queue);
        }
        Ok(())
    }

    fn config_generation(&self) -> u8 {
        self.common().generation()
    }

    fn read_config(&self, offset: usize, width: AccessWidth) -> Result<u32, TransportError> {
        let window = self.device_window(offset, width)?;
        Ok(match width {
            AccessWidth::U8 => u32::from(window.read8(offset)),
            AccessWidth::U16 => u32::from(window.read16(offset)),
            AccessWidth::U32 => window.read32(offset),
        })
    }

    fn write_config(
        &self,
        offset: usize,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), TransportError> {
        let window = self.device_window(offset, width)?;
        match width {
            AccessWidth::U8 => window.write8(offset, value as u8),
            AccessWidth::U16 => window.write16(offset, value as u16),
            AccessWidth::U32 => window.write32(offset, value),
        }
        Ok(())
    }

    fn read_isr(&self) -> Option<IsrStatus> {
        self.regions
            .window(RegionRole::Isr)
            .map(|isr| IsrStatus::from_bits_retain(isr.read32(0)))
    }

    fn ack_isr(&self, isr: IsrStatus) {
        if let Some(window) = self.regions.window(RegionRole::Isr) {
            window.write32(0, isr.bits());
        }
    }
}
