//! Virtio 1.x transport over PCI.
//!
//! Layers, leaf first:
//! - [`regs`]: register and capability layouts
//! - [`pci`]: capability walk, region mapping and the PCI [`Transport`]
//! - [`negotiate`]: device status handshake and feature negotiation
//! - [`queue`]: split virtqueues
//! - [`device`]: the consumer API (open, submit, poll, notify, config)
//! - [`interrupt`]: ISR demultiplexing into queue and config handlers
//!
//! Platform code supplies a [`pci::PciPlatform`] (config space, BARs, IRQ)
//! and a [`VirtioHal`] (DMA memory).

#![no_std]

extern crate alloc;

pub mod config;
pub mod device;
pub mod hal;
pub mod interrupt;
pub mod mmio;
pub mod negotiate;
pub mod pci;
pub mod queue;
pub mod regs;
pub mod transport;

use vpci_error::define_transport_error;

pub use config::TransportConfig;
pub use device::{Completions, QueueSpec, VirtioDevice};
pub use hal::{BufferDirection, Dma, PAGE_SIZE, VirtioHal};
pub use interrupt::IrqReturn;
pub use mmio::{MmioWindow, RegisterIo};
pub use negotiate::InitState;
pub use pci::{PciPlatform, PciTransport};
pub use queue::{Completion, Segment, Token, VirtQueue};
pub use regs::{DeviceStatus, IsrStatus, features};
pub use transport::{AccessWidth, DeviceType, Transport};
pub use vpci_utils::InterruptMask;

define_transport_error! {
    /// Errors from the virtio-pci transport.
    pub enum TransportError(0x0B) {
        /// Missing or malformed capability, bad length or BAR index
        ConfigurationError = 0x01 => "Invalid device configuration",
        /// A mapped region reads as all-ones
        IoError = 0x02 => "Device region not backed",
        /// Device rejected the feature set or a status bit did not stick
        NegotiationError = 0x03 => "Feature negotiation failed",
        /// Out of DMA memory, address space or interrupt lines
        ResourceExhaustion = 0x04 => "Resource allocation failed",
        /// No free descriptors; retry after completions are drained
        QueueFull = 0x05 => "Virtqueue full",
        /// A bounded hardware poll ran out
        Timeout = 0x06 => "Device did not respond in time",
        /// Empty chain, chain longer than the queue, or over 4 GiB
        InvalidBuffer = 0x07 => "Invalid buffer chain",
        /// Operation issued in the wrong lifecycle state
        NotReady = 0x08 => "Device or queue not ready",
        /// Device reset itself or requested a reset while live
        DeviceFailed = 0x09 => "Device failed",
    }
    recoverable: [QueueFull]
}
