//! Transport abstraction.
//!
//! [`Transport`] is the seam between the device logic (negotiation,
//! virtqueues, interrupt dispatch) and the bus that carries the registers.
//! [`crate::pci::PciTransport`] is the implementation for Virtio over PCI.

use crate::TransportError;
use crate::regs::{DeviceStatus, IsrStatus, pci};

/// Virtio device type identifiers per Virtio 1.2 section 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Invalid = 0,
    Network = 1,
    Block = 2,
    Console = 3,
    Entropy = 4,
    Balloon = 5,
    IoMemory = 6,
    Rpmsg = 7,
    Scsi = 8,
    Transport9P = 9,
    Mac80211 = 10,
    RprocSerial = 11,
    Caif = 12,
    MemoryBalloon = 13,
    Gpu = 16,
    Timer = 17,
    Input = 18,
    Socket = 19,
    Crypto = 20,
    SignalDist = 21,
    Pstore = 22,
    Iommu = 23,
    Memory = 24,
}

impl From<u32> for DeviceType {
    fn from(value: u32) -> Self {
        match value {
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            3 => DeviceType::Console,
            4 => DeviceType::Entropy,
            5 => DeviceType::Balloon,
            6 => DeviceType::IoMemory,
            7 => DeviceType::Rpmsg,
            8 => DeviceType::Scsi,
            9 => DeviceType::Transport9P,
            10 => DeviceType::Mac80211,
            11 => DeviceType::RprocSerial,
            12 => DeviceType::Caif,
            13 => DeviceType::MemoryBalloon,
            16 => DeviceType::Gpu,
            17 => DeviceType::Timer,
            18 => DeviceType::Input,
            19 => DeviceType::Socket,
            20 => DeviceType::Crypto,
            21 => DeviceType::SignalDist,
            22 => DeviceType::Pstore,
            23 => DeviceType::Iommu,
            24 => DeviceType::Memory,
            _ => DeviceType::Invalid,
        }
    }
}

impl DeviceType {
    /// Derive the device type from a PCI device id.
    ///
    /// Modern ids are `0x1040 + type`; transitional ids `0x1000..=0x103F`
    /// go through the fixed transitional table.
    pub fn from_pci_device_id(device_id: u16) -> Self {
        match device_id {
            pci::DEVICE_ID_TRANSITIONAL_FIRST..=pci::DEVICE_ID_TRANSITIONAL_LAST => {
                match device_id {
                    0x1000 => DeviceType::Network,
                    0x1001 => DeviceType::Block,
                    0x1002 => DeviceType::Balloon,
                    0x1003 => DeviceType::Console,
                    0x1004 => DeviceType::Scsi,
                    0x1005 => DeviceType::Entropy,
                    0x1009 => DeviceType::Transport9P,
                    _ => DeviceType::Invalid,
                }
            }
            id if id >= pci::DEVICE_ID_MODERN_BASE => {
                DeviceType::from(u32::from(id - pci::DEVICE_ID_MODERN_BASE))
            }
            _ => DeviceType::Invalid,
        }
    }
}

/// Width of a device-specific configuration access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    U8,
    U16,
    U32,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::U8 => 1,
            AccessWidth::U16 => 2,
            AccessWidth::U32 => 4,
        }
    }

    /// Only 1, 2 and 4 byte accesses are defined for the config window.
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(AccessWidth::U8),
            2 => Some(AccessWidth::U16),
            4 => Some(AccessWidth::U32),
            _ => None,
        }
    }
}

/// Bus addresses of one queue's three ring areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAddresses {
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
}

/// Register-level operations every Virtio transport provides.
///
/// All methods take `&self`: interrupt context and caller context both hold
/// shared references, and implementations serialize whatever register
/// sequences need it (queue selection in particular).
pub trait Transport {
    /// Get the device type.
    fn device_type(&self) -> DeviceType;

    /// Read the device status byte.
    fn read_status(&self) -> DeviceStatus;

    /// Write the device status byte. Writing empty status resets the device.
    fn write_status(&self, status: DeviceStatus);

    /// Read the 64 feature bits the device offers.
    fn read_device_features(&self) -> u64;

    /// Write the 64 feature bits the driver accepts.
    fn write_driver_features(&self, features: u64);

    /// Read back the driver feature bits.
    fn read_driver_features(&self) -> u64;

    /// Number of queues the device exposes.
    fn num_queues(&self) -> u16;

    /// Device maximum size for `queue`; 0 when the queue does not exist.
    fn max_queue_size(&self, queue: u16) -> u16;

    /// Program size and ring addresses for `queue`, then enable it.
    fn setup_queue(
        &self,
        queue: u16,
        size: u16,
        addrs: QueueAddresses,
    ) -> Result<(), TransportError>;

    /// Clear the queue enable bit.
    fn disable_queue(&self, queue: u16);

    /// Whether the device reports the queue as enabled.
    fn queue_enabled(&self, queue: u16) -> bool;

    /// Start a per-queue reset and wait (bounded) for the device to finish it.
    fn reset_queue(&self, queue: u16, poll_limit: u32) -> Result<(), TransportError>;

    /// Ring the doorbell for `queue`.
    fn notify(&self, queue: u16) -> Result<(), TransportError>;

    /// Configuration generation counter.
    fn config_generation(&self) -> u8;

    /// Read the device-specific configuration region.
    fn read_config(&self, offset: usize, width: AccessWidth) -> Result<u32, TransportError>;

    /// Write the device-specific configuration region.
    fn write_config(
        &self,
        offset: usize,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), TransportError>;

    /// Read (and on real hardware, clear) the ISR status.
    ///
    /// `None` when the transport has no ISR region.
    fn read_isr(&self) -> Option<IsrStatus>;

    /// Write the observed ISR value back.
    fn ack_isr(&self, isr: IsrStatus);
}
