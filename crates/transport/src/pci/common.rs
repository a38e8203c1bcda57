//! Typed access to the common configuration window.

use vpci_utils::{InterruptMask, IrqSafeLockGuard};

use crate::mmio::RegisterIo;
use crate::regs::{DeviceStatus, common_cfg};
use crate::transport::QueueAddresses;

/// Device-global registers of the common configuration block.
pub struct CommonCfg<'a, W: RegisterIo> {
    window: &'a W,
}

impl<'a, W: RegisterIo> CommonCfg<'a, W> {
    pub fn new(window: &'a W) -> Self {
        Self { window }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.window.read8(common_cfg::DEVICE_STATUS))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.window.write8(common_cfg::DEVICE_STATUS, status.bits());
    }

    pub fn generation(&self) -> u8 {
        self.window.read8(common_cfg::CONFIG_GENERATION)
    }

    pub fn num_queues(&self) -> u16 {
        self.window.read16(common_cfg::NUM_QUEUES)
    }

    /// Both 32-bit feature windows. Requires the selector token.
    pub fn device_features<M: InterruptMask>(&self, _token: &IrqSafeLockGuard<'_, M, ()>) -> u64 {
        let w = self.window;
        w.write32(common_cfg::DEVICE_FEATURE_SELECT, common_cfg::FEATURE_SELECT_LOW);
        let low = u64::from(w.read32(common_cfg::DEVICE_FEATURE));
        w.write32(common_cfg::DEVICE_FEATURE_SELECT, common_cfg::FEATURE_SELECT_HIGH);
        let high = u64::from(w.read32(common_cfg::DEVICE_FEATURE));
        (high << 32) | low
    }

    pub fn set_driver_features<M: InterruptMask>(
        &self,
        _token: &IrqSafeLockGuard<'_, M, ()>,
        features: u64,
    ) {
        let w = self.window;
        w.write32(common_cfg::DRIVER_FEATURE_SELECT, common_cfg::FEATURE_SELECT_LOW);
        w.write32(common_cfg::DRIVER_FEATURE, features as u32);
        w.write32(common_cfg::DRIVER_FEATURE_SELECT, common_cfg::FEATURE_SELECT_HIGH);
        w.write32(common_cfg::DRIVER_FEATURE, (features >> 32) as u32);
    }

    pub fn driver_features<M: InterruptMask>(&self, _token: &IrqSafeLockGuard<'_, M, ()>) -> u64 {
        let w = self.window;
        w.write32(common_cfg::DRIVER_FEATURE_SELECT, common_cfg::FEATURE_SELECT_LOW);
        let low = u64::from(w.read32(common_cfg::DRIVER_FEATURE));
        w.write32(common_cfg::DRIVER_FEATURE_SELECT, common_cfg::FEATURE_SELECT_HIGH);
        let high = u64::from(w.read32(common_cfg::DRIVER_FEATURE));
        (high << 32) | low
    }

    /// Select `queue` for the lifetime of the returned handle.
    pub fn select<'g, M: InterruptMask>(
        &self,
        token: IrqSafeLockGuard<'g, M, ()>,
        queue: u16,
    ) -> SelectedQueue<'a, 'g, W, M> {
        self.window.write16(common_cfg::QUEUE_SELECT, queue);
        SelectedQueue {
            window: self.window,
            queue,
            _token: token,
        }
    }
}

/// A queue held selected in `queue_select`.
///
/// Owning the selector token means no other register sequence can move
/// `queue_select` until this handle is dropped.
pub struct SelectedQueue<'a, 'g, W: RegisterIo, M: InterruptMask> {
    window: &'a W,
    queue: u16,
    _token: IrqSafeLockGuard<'g, M, ()>,
}

impl<W: RegisterIo, M: InterruptMask> SelectedQueue<'_, '_, W, M> {
    pub fn index(&self) -> u16 {
        self.queue
    }

    pub fn size(&self) -> u16 {
        self.window.read16(common_cfg::QUEUE_SIZE)
    }

    pub fn set_size(&self, size: u16) {
        self.window.write16(common_cfg::QUEUE_SIZE, size);
    }

    pub fn enabled(&self) -> bool {
        self.window.read16(common_cfg::QUEUE_ENABLE) != 0
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.window
            .write16(common_cfg::QUEUE_ENABLE, u16::from(enabled));
    }

    pub fn notify_off(&self) -> u16 {
        self.window.read16(common_cfg::QUEUE_NOTIFY_OFF)
    }

    pub fn set_addresses(&self, addrs: QueueAddresses) {
        self.window.write64(common_cfg::QUEUE_DESC, addrs.desc);
        self.window.write64(common_cfg::QUEUE_DRIVER, addrs.driver);
        self.window.write64(common_cfg::QUEUE_DEVICE, addrs.device);
    }

    pub fn addresses(&self) -> QueueAddresses {
        QueueAddresses {
            desc: self.window.read64(common_cfg::QUEUE_DESC),
            driver: self.window.read64(common_cfg::QUEUE_DRIVER),
            device: self.window.read64(common_cfg::QUEUE_DEVICE),
        }
    }

    pub fn request_reset(&self) {
        self.window.write16(common_cfg::QUEUE_RESET, 1);
    }

    pub fn reset_pending(&self) -> bool {
        self.window.read16(common_cfg::QUEUE_RESET) != 0
    }
}
