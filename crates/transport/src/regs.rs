//! Register layouts shared by the PCI transport.
//!
//! Offsets and bit values per Virtio 1.2 section 4.1 (Virtio Over PCI Bus)
//! and section 2.1 (Device Status Field). Every multi-byte field is
//! little-endian on the wire.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Device status byte per Virtio 1.2 section 2.1.
    ///
    /// Bits accumulate during the handshake. Writing zero resets the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest noticed the device.
        const ACKNOWLEDGE = 1;
        /// Guest knows how to drive the device.
        const DRIVER = 2;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Device hit an error it cannot recover from without a reset.
        const DEVICE_NEEDS_RESET = 64;
        /// Driver gave up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// ISR status register bits per Virtio 1.2 section 4.1.4.5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrStatus: u32 {
        /// One or more virtqueues have used buffers.
        const QUEUE = 1;
        /// Device configuration changed.
        const CONFIG = 2;
        // Remaining bits are device-specific.
        const _ = !0;
    }
}

impl IsrStatus {
    /// Bits outside the queue and config bits.
    pub fn device_specific(self) -> u32 {
        self.bits() & !(Self::QUEUE | Self::CONFIG).bits()
    }
}

/// Feature bits common to all devices (Virtio 1.2 section 6).
pub mod features {
    pub const NOTIFY_ON_EMPTY: u64 = 1 << 24;
    pub const ANY_LAYOUT: u64 = 1 << 27;
    pub const RING_INDIRECT_DESC: u64 = 1 << 28;
    pub const RING_EVENT_IDX: u64 = 1 << 29;
    pub const VERSION_1: u64 = 1 << 32;
    pub const ACCESS_PLATFORM: u64 = 1 << 33;
    pub const RING_PACKED: u64 = 1 << 34;
    pub const IN_ORDER: u64 = 1 << 35;
    pub const ORDER_PLATFORM: u64 = 1 << 36;
    pub const SR_IOV: u64 = 1 << 37;
    pub const NOTIFICATION_DATA: u64 = 1 << 38;
    pub const NOTIF_CONFIG_DATA: u64 = 1 << 39;
    pub const RING_RESET: u64 = 1 << 40;
}

/// PCI configuration header fields the transport reads.
pub mod pci {
    pub const VENDOR_ID_VIRTIO: u16 = 0x1AF4;
    /// Vendor/device id dword.
    pub const ID_OFFSET: u16 = 0x00;
    /// Command/status dword. The status word is the upper half.
    pub const COMMAND_STATUS_OFFSET: u16 = 0x04;
    pub const STATUS_CAP_LIST: u16 = 0x10;
    pub const CAPABILITY_LIST: u16 = 0x34;
    pub const CAP_ID_VNDR: u8 = 0x09;
    pub const STD_NUM_BARS: u8 = 6;
    /// Dword-aligned capability slots after the 64-byte standard header.
    pub const MAX_CAPABILITIES: usize = 48;

    pub const DEVICE_ID_MODERN_BASE: u16 = 0x1040;
    pub const DEVICE_ID_TRANSITIONAL_FIRST: u16 = 0x1000;
    pub const DEVICE_ID_TRANSITIONAL_LAST: u16 = 0x103F;
}

/// Byte offsets of fields inside a virtio vendor capability.
pub mod cap {
    /// cap_vndr, cap_next, cap_len, cfg_type
    pub const VNDR: u16 = 0;
    /// bar, id, padding[2]
    pub const BAR: u16 = 4;
    pub const OFFSET: u16 = 8;
    pub const LENGTH: u16 = 12;
    /// notify_off_multiplier, notify capabilities only
    pub const NOTIFY_OFF_MULTIPLIER: u16 = 16;

    pub const COMMON_CFG: u8 = 1;
    pub const NOTIFY_CFG: u8 = 2;
    pub const ISR_CFG: u8 = 3;
    pub const DEVICE_CFG: u8 = 4;
    pub const PCI_CFG: u8 = 5;
    pub const SHARED_MEMORY_CFG: u8 = 8;
    pub const VENDOR_CFG: u8 = 9;
}

/// `struct virtio_pci_cap`, 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawPciCap {
    pub cap_vndr: u8,
    pub cap_next: u8,
    pub cap_len: u8,
    pub cfg_type: u8,
    pub bar: u8,
    pub id: u8,
    pub padding: [u8; 2],
    /// Little-endian on the wire.
    pub offset: u32,
    /// Little-endian on the wire.
    pub length: u32,
}

/// Size of `struct virtio_pci_cap`.
pub const PCI_CAP_LEN: u8 = 16;
/// Size of `struct virtio_pci_notify_cap`.
pub const PCI_NOTIFY_CAP_LEN: u8 = 20;

/// `struct virtio_pci_common_cfg`.
///
/// Never dereferenced; it only pins the offsets in [`common_cfg`] so a
/// layout mistake fails the build.
#[repr(C, packed(4))]
#[allow(dead_code)]
struct CommonCfgLayout {
    device_feature_select: u32,
    device_feature: u32,
    driver_feature_select: u32,
    driver_feature: u32,
    config_msix_vector: u16,
    num_queues: u16,
    device_status: u8,
    config_generation: u8,
    queue_select: u16,
    queue_size: u16,
    queue_msix_vector: u16,
    queue_enable: u16,
    queue_notify_off: u16,
    queue_desc: u64,
    queue_driver: u64,
    queue_device: u64,
    queue_notify_data: u16,
    queue_reset: u16,
}

/// Byte offsets inside the common configuration window.
pub mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0C;
    pub const CONFIG_MSIX_VECTOR: usize = 0x10;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const CONFIG_GENERATION: usize = 0x15;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_MSIX_VECTOR: usize = 0x1A;
    pub const QUEUE_ENABLE: usize = 0x1C;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
    pub const QUEUE_NOTIFY_DATA: usize = 0x38;
    pub const QUEUE_RESET: usize = 0x3A;

    /// Full block size, the minimum length a common capability may declare.
    pub const SIZE: usize = 0x3C;

    /// Feature selector values for the two 32-bit windows.
    pub const FEATURE_SELECT_LOW: u32 = 0;
    pub const FEATURE_SELECT_HIGH: u32 = 1;

    /// MSI-X "no vector" value.
    pub const NO_VECTOR: u16 = 0xFFFF;
}

// Compile-time layout verification
const _: () = {
    use core::mem::{offset_of, size_of};
    assert!(size_of::<RawPciCap>() == PCI_CAP_LEN as usize);
    assert!(offset_of!(RawPciCap, offset) == cap::OFFSET as usize);
    assert!(offset_of!(RawPciCap, length) == cap::LENGTH as usize);

    assert!(size_of::<CommonCfgLayout>() == common_cfg::SIZE);
    assert!(offset_of!(CommonCfgLayout, device_feature) == common_cfg::DEVICE_FEATURE);
    assert!(offset_of!(CommonCfgLayout, driver_feature_select) == common_cfg::DRIVER_FEATURE_SELECT);
    assert!(offset_of!(CommonCfgLayout, driver_feature) == common_cfg::DRIVER_FEATURE);
    assert!(offset_of!(CommonCfgLayout, num_queues) == common_cfg::NUM_QUEUES);
    assert!(offset_of!(CommonCfgLayout, device_status) == common_cfg::DEVICE_STATUS);
    assert!(offset_of!(CommonCfgLayout, config_generation) == common_cfg::CONFIG_GENERATION);
    assert!(offset_of!(CommonCfgLayout, queue_select) == common_cfg::QUEUE_SELECT);
    assert!(offset_of!(CommonCfgLayout, queue_size) == common_cfg::QUEUE_SIZE);
    assert!(offset_of!(CommonCfgLayout, queue_msix_vector) == common_cfg::QUEUE_MSIX_VECTOR);
    assert!(offset_of!(CommonCfgLayout, queue_enable) == common_cfg::QUEUE_ENABLE);
    assert!(offset_of!(CommonCfgLayout, queue_notify_off) == common_cfg::QUEUE_NOTIFY_OFF);
    assert!(offset_of!(CommonCfgLayout, queue_desc) == common_cfg::QUEUE_DESC);
    assert!(offset_of!(CommonCfgLayout, queue_driver) == common_cfg::QUEUE_DRIVER);
    assert!(offset_of!(CommonCfgLayout, queue_device) == common_cfg::QUEUE_DEVICE);
    assert!(offset_of!(CommonCfgLayout, queue_notify_data) == common_cfg::QUEUE_NOTIFY_DATA);
    assert!(offset_of!(CommonCfgLayout, queue_reset) == common_cfg::QUEUE_RESET);
};
