//! Feature negotiation state machine (Virtio 1.2 section 3.1.1).
//!
//! `Reset -> Acknowledged -> DriverPresent -> FeaturesNegotiating ->
//! FeaturesOk -> DriverOk`, with `Failed` reachable from anywhere. Status
//! bits only accumulate; the one way back is a full reset.

use core::sync::atomic::{AtomicU8, Ordering};

use vpci_utils::poll_until;

use crate::TransportError;
use crate::regs::{DeviceStatus, features};
use crate::transport::Transport;

/// Handshake progress as tracked by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitState {
    Reset = 0,
    Acknowledged = 1,
    DriverPresent = 2,
    FeaturesNegotiating = 3,
    FeaturesOk = 4,
    DriverOk = 5,
    Failed = 6,
}

impl InitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => InitState::Reset,
            1 => InitState::Acknowledged,
            2 => InitState::DriverPresent,
            3 => InitState::FeaturesNegotiating,
            4 => InitState::FeaturesOk,
            5 => InitState::DriverOk,
            _ => InitState::Failed,
        }
    }
}

/// [`InitState`] readable from interrupt context without locking.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(InitState::Reset as u8))
    }

    pub fn get(&self) -> InitState {
        InitState::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: InitState) {
        log::trace!("[VIRTIO] state {:?} -> {:?}", self.get(), state);
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Write 0 to the status byte and wait for the device to report 0.
pub fn reset_device<T: Transport + ?Sized>(
    transport: &T,
    poll_limit: u32,
) -> Result<(), TransportError> {
    transport.write_status(DeviceStatus::empty());
    poll_until(poll_limit, || transport.read_status().is_empty().then_some(())).map_err(|e| {
        log::error!(
            "[VIRTIO] Device still reports status {:#04x} after {} polls",
            transport.read_status().bits(),
            e.attempts
        );
        TransportError::Timeout
    })
}

fn add_status<T: Transport + ?Sized>(transport: &T, bits: DeviceStatus) {
    let status = transport.read_status();
    transport.write_status(status | bits);
}

/// Mark the device failed and put it back into reset.
pub fn fail<T: Transport + ?Sized>(transport: &T, state: &StateCell, poll_limit: u32) {
    add_status(transport, DeviceStatus::FAILED);
    if reset_device(transport, poll_limit).is_err() {
        log::warn!("[VIRTIO] Reset after failure did not complete");
    }
    state.set(InitState::Failed);
}

/// Drive the handshake from any state to `FeaturesOk`.
///
/// Returns the negotiated feature set. On failure the device has been
/// marked FAILED and reset.
pub fn negotiate<T: Transport + ?Sized>(
    transport: &T,
    state: &StateCell,
    desired: u64,
    poll_limit: u32,
) -> Result<u64, TransportError> {
    if let Err(e) = reset_device(transport, poll_limit) {
        state.set(InitState::Failed);
        return Err(e);
    }
    state.set(InitState::Reset);

    add_status(transport, DeviceStatus::ACKNOWLEDGE);
    state.set(InitState::Acknowledged);
    add_status(transport, DeviceStatus::DRIVER);
    state.set(InitState::DriverPresent);

    state.set(InitState::FeaturesNegotiating);
    let offered = transport.read_device_features();
    let negotiated = offered & desired;
    if negotiated & features::VERSION_1 == 0 {
        log::warn!(
            "[VIRTIO] VERSION_1 not negotiated (offered {:#x}, desired {:#x})",
            offered,
            desired
        );
    }
    transport.write_driver_features(negotiated);

    add_status(transport, DeviceStatus::FEATURES_OK);
    if !transport.read_status().contains(DeviceStatus::FEATURES_OK) {
        log::error!(
            "[VIRTIO] Device rejected features {:#x} (offered {:#x})",
            negotiated,
            offered
        );
        fail(transport, state, poll_limit);
        return Err(TransportError::NegotiationError);
    }
    state.set(InitState::FeaturesOk);

    log::debug!(
        "[VIRTIO] features offered {:#x}, negotiated {:#x}",
        offered,
        negotiated
    );
    Ok(negotiated)
}

/// Final handshake step: the device becomes live.
pub fn set_driver_ok<T: Transport + ?Sized>(
    transport: &T,
    state: &StateCell,
) -> Result<(), TransportError> {
    if state.get() != InitState::FeaturesOk {
        log::error!("[VIRTIO] DRIVER_OK requested in state {:?}", state.get());
        return Err(TransportError::NotReady);
    }
    add_status(transport, DeviceStatus::DRIVER_OK);
    state.set(InitState::DriverOk);
    Ok(())
}

/// Status bits the driver has set by the time it reaches `state`.
pub fn expected_status(state: InitState) -> DeviceStatus {
    let base = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
    match state {
        InitState::Reset | InitState::Failed => DeviceStatus::empty(),
        InitState::Acknowledged => DeviceStatus::ACKNOWLEDGE,
        InitState::DriverPresent | InitState::FeaturesNegotiating => base,
        InitState::FeaturesOk => base | DeviceStatus::FEATURES_OK,
        InitState::DriverOk => base | DeviceStatus::FEATURES_OK | DeviceStatus::DRIVER_OK,
    }
}

/// Re-read the status byte and detect device-initiated failure.
///
/// A set `DEVICE_NEEDS_RESET` or a vanished `FEATURES_OK`/`DRIVER_OK` moves
/// the driver to `Failed`.
pub fn check_status<T: Transport + ?Sized>(
    transport: &T,
    state: &StateCell,
) -> Result<DeviceStatus, TransportError> {
    let status = transport.read_status();
    let current = state.get();
    if current == InitState::Failed {
        return Err(TransportError::DeviceFailed);
    }
    let expected = expected_status(current);
    if status.contains(DeviceStatus::DEVICE_NEEDS_RESET) || !status.contains(expected) {
        log::warn!(
            "[VIRTIO] Device status {:#04x} in state {:?} (expected {:#04x})",
            status.bits(),
            current,
            expected.bits()
        );
        state.set(InitState::Failed);
        return Err(TransportError::DeviceFailed);
    }
    Ok(status)
}
