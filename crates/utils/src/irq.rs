//! Locks that mask local interrupts while held.
//!
//! Data shared between caller context and an interrupt handler must not be
//! held with interrupts enabled: if the handler fires on the same CPU and
//! takes the same spin lock, it spins forever. These wrappers mask
//! interrupts through an [`InterruptMask`] before acquiring and restore the
//! saved state after releasing.

use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Local interrupt control supplied by the platform.
pub trait InterruptMask {
    /// Mask interrupts on this CPU and return the previous state.
    fn disable() -> u64;

    /// Return to a state previously returned by [`InterruptMask::disable`].
    fn restore(state: u64);
}

/// Spin mutex that masks interrupts while held.
pub struct IrqSafeLock<M, T> {
    inner: Mutex<T>,
    _mask: PhantomData<fn() -> M>,
}

impl<M: InterruptMask, T> IrqSafeLock<M, T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
            _mask: PhantomData,
        }
    }

    /// Mask interrupts, then acquire.
    pub fn lock(&self) -> IrqSafeLockGuard<'_, M, T> {
        let state = M::disable();
        let guard = self.inner.lock();
        IrqSafeLockGuard {
            guard: ManuallyDrop::new(guard),
            state,
            _mask: PhantomData,
        }
    }

    /// Acquire without spinning. Interrupts are restored on failure.
    pub fn try_lock(&self) -> Option<IrqSafeLockGuard<'_, M, T>> {
        let state = M::disable();
        if let Some(guard) = self.inner.try_lock() {
            Some(IrqSafeLockGuard {
                guard: ManuallyDrop::new(guard),
                state,
                _mask: PhantomData,
            })
        } else {
            M::restore(state);
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqSafeLockGuard<'a, M: InterruptMask, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    state: u64,
    _mask: PhantomData<fn() -> M>,
}

impl<M: InterruptMask, T> Deref for IrqSafeLockGuard<'_, M, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<M: InterruptMask, T> DerefMut for IrqSafeLockGuard<'_, M, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<M: InterruptMask, T> Drop for IrqSafeLockGuard<'_, M, T> {
    fn drop(&mut self) {
        // SAFETY: The guard is dropped once, here, before interrupts return.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        M::restore(self.state);
    }
}

/// Reader-writer spin lock that masks interrupts while held.
pub struct IrqSafeRwLock<M, T> {
    inner: RwLock<T>,
    _mask: PhantomData<fn() -> M>,
}

impl<M: InterruptMask, T> IrqSafeRwLock<M, T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: RwLock::new(data),
            _mask: PhantomData,
        }
    }

    pub fn read(&self) -> IrqSafeReadGuard<'_, M, T> {
        let state = M::disable();
        let guard = self.inner.read();
        IrqSafeReadGuard {
            guard: ManuallyDrop::new(guard),
            state,
            _mask: PhantomData,
        }
    }

    /// Shared access without spinning. Fails while a writer holds the lock.
    pub fn try_read(&self) -> Option<IrqSafeReadGuard<'_, M, T>> {
        let state = M::disable();
        if let Some(guard) = self.inner.try_read() {
            Some(IrqSafeReadGuard {
                guard: ManuallyDrop::new(guard),
                state,
                _mask: PhantomData,
            })
        } else {
            M::restore(state);
            None
        }
    }

    pub fn write(&self) -> IrqSafeWriteGuard<'_, M, T> {
        let state = M::disable();
        let guard = self.inner.write();
        IrqSafeWriteGuard {
            guard: ManuallyDrop::new(guard),
            state,
            _mask: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct IrqSafeReadGuard<'a, M: InterruptMask, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    state: u64,
    _mask: PhantomData<fn() -> M>,
}

impl<M: InterruptMask, T> Deref for IrqSafeReadGuard<'_, M, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<M: InterruptMask, T> Drop for IrqSafeReadGuard<'_, M, T> {
    fn drop(&mut self) {
        // SAFETY: Dropped once, before interrupts are restored.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        M::restore(self.state);
    }
}

pub struct IrqSafeWriteGuard<'a, M: InterruptMask, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    state: u64,
    _mask: PhantomData<fn() -> M>,
}

impl<M: InterruptMask, T> Deref for IrqSafeWriteGuard<'_, M, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<M: InterruptMask, T> DerefMut for IrqSafeWriteGuard<'_, M, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<M: InterruptMask, T> Drop for IrqSafeWriteGuard<'_, M, T> {
    fn drop(&mut self) {
        // SAFETY: Dropped once, before interrupts are restored.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        M::restore(self.state);
    }
}
