#![no_std]

//! Shared primitives for the virtio-pci workspace.
//!
//! - Interrupt-masking locks over `spin`
//! - Bounded polling for hardware handshakes

pub mod irq;
pub mod poll;

// Interrupt context and caller context share these, so they must never sleep.
pub use irq::{
    InterruptMask, IrqSafeLock, IrqSafeLockGuard, IrqSafeReadGuard, IrqSafeRwLock,
    IrqSafeWriteGuard,
};

pub use poll::{Exhausted, poll_until};
