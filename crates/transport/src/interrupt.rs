//! Interrupt demultiplexer.
//!
//! One entry point per device, called by the platform's interrupt delivery.
//! The ISR read clears the register on real hardware, so it is read exactly
//! once per invocation. Nothing here returns an error: there is no caller to
//! hand it to, so failures are logged.

use crate::device::VirtioDevice;
use crate::hal::VirtioHal;
use crate::regs::IsrStatus;
use crate::transport::Transport;

/// Result of an interrupt invocation, for shared-line bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The device raised the interrupt and it was serviced.
    Handled,
    /// The ISR was clear; another device on the line raised it.
    NotOurs,
}

impl<T: Transport, H: VirtioHal> VirtioDevice<T, H> {
    /// Service one interrupt.
    pub fn handle_interrupt(&self) -> IrqReturn {
        let Some(isr) = self.transport().read_isr() else {
            return IrqReturn::NotOurs;
        };
        if isr.is_empty() {
            return IrqReturn::NotOurs;
        }
        log::trace!("[VIRTIO-IRQ] isr {:#x}", isr.bits());

        if isr.contains(IsrStatus::QUEUE) {
            self.dispatch_queue_events();
        }
        if isr.contains(IsrStatus::CONFIG) {
            self.dispatch_config_change();
        }
        let other = isr.device_specific();
        if other != 0 {
            log::debug!("[VIRTIO-IRQ] ignoring device-specific bits {:#x}", other);
        }

        if self.config().isr_write_back {
            self.transport().ack_isr(isr);
        }
        IrqReturn::Handled
    }

    /// Call the handler of every open queue with unseen used entries, in
    /// ascending queue index order. Returns how many handlers ran.
    pub fn dispatch_queue_events(&self) -> usize {
        let table = self.queues.read();
        let mut dispatched = 0;
        for slot in table.iter() {
            if !slot.queue.pending() {
                continue;
            }
            match &slot.callback {
                Some(callback) => {
                    callback(slot.queue.index());
                    dispatched += 1;
                }
                None => log::trace!(
                    "[VIRTIO-IRQ] queue {} ({}) has completions but no handler",
                    slot.queue.index(),
                    slot.name
                ),
            }
        }
        dispatched
    }

    fn dispatch_config_change(&self) {
        if let Err(e) = self.check_status() {
            log::warn!("[VIRTIO-IRQ] configuration change: {}", e);
        }
        let status = self.transport().read_status();
        log::debug!("[VIRTIO-IRQ] configuration changed, status {:#04x}", status.bits());
        if let Some(callback) = self.config_callback.read().as_ref() {
            callback(status);
        }
    }
}
