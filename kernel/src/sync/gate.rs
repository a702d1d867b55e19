// SPDX-License-Identifier: MPL-2.0

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use log::error;

use crate::config::GATE_SPIN_TIMEOUT;
use crate::cpu;
use crate::error::{KernelError, Result};

/// A reader/writer gate.
///
/// The gate serialises access to a kernel object across cores: many readers
/// or one writer, with the exclusive owner tracked by thread identity so
/// that the owner can stack read acquisitions (n acquires require n
/// releases). A writer that arrives while readers hold the gate raises a
/// writer-waiting flag which blocks new readers, preventing writer
/// starvation.
///
/// Acquisition spins; it is never a scheduling suspension point. The
/// scheduler requires all gates to be released before a thread loses the
/// CPU. A spin that exceeds [`GATE_SPIN_TIMEOUT`] iterations is reported as
/// a probable deadlock in debug builds.
///
/// Acquiring through [`Gate::write_destroy`] marks the gate defunct once
/// the final release happens; every later acquisition fails. The kill path
/// uses this to fence a dying object while teardown proceeds.
///
/// An owner that already holds the gate for writing must pass the guard (or
/// `&mut` borrows of it) down the call stack instead of re-acquiring; a
/// recursive write acquisition is reported as a bug.
pub struct Gate<T> {
    spin: AtomicBool,
    state: UnsafeCell<GateState>,
    val: UnsafeCell<T>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GateMode {
    Unlocked,
    Read,
    Write,
}

struct GateState {
    /// Thread token of the exclusive owner (the writer, or the first
    /// reader in). Zero when unowned.
    owner: usize,
    mode: GateMode,
    /// Number of outstanding acquisitions.
    refcount: u32,
    /// A writer has arrived; stop admitting new readers.
    writer_waiting: bool,
    /// The current write owner acquired with destroy; seal on release.
    destroy_pending: bool,
    /// Sealed: all further acquisitions fail.
    defunct: bool,
}

impl<T> Gate<T> {
    pub const fn new(val: T) -> Self {
        Self {
            spin: AtomicBool::new(false),
            state: UnsafeCell::new(GateState {
                owner: 0,
                mode: GateMode::Unlocked,
                refcount: 0,
                writer_waiting: false,
                destroy_pending: false,
                defunct: false,
            }),
            val: UnsafeCell::new(val),
        }
    }

    /// Acquire the gate for shared reading, spinning until admitted.
    ///
    /// Fails only if the gate has been marked defunct.
    pub fn read(&self) -> Result<GateReadGuard<T>> {
        let me = cpu::current_token();
        let mut spins: u32 = 0;
        loop {
            self.acquire_spin();
            let state = unsafe { &mut *self.state.get() };

            if state.defunct {
                self.release_spin();
                return Err(KernelError::Failure);
            }

            match state.mode {
                GateMode::Unlocked => {
                    state.owner = me;
                    state.mode = GateMode::Read;
                    state.refcount = 1;
                    self.release_spin();
                    return Ok(GateReadGuard {
                        inner: self,
                        _not_send: PhantomData,
                    });
                }
                GateMode::Read => {
                    // the owner may stack reads even against a waiting
                    // writer; everyone else must let the writer in first
                    if state.owner == me || !state.writer_waiting {
                        state.refcount += 1;
                        self.release_spin();
                        return Ok(GateReadGuard {
                            inner: self,
                            _not_send: PhantomData,
                        });
                    }
                }
                GateMode::Write => {
                    if state.owner == me {
                        self.release_spin();
                        error!("gate: read acquisition inside own write hold");
                        debug_assert!(false, "recursive gate entry under write");
                        return Err(KernelError::Failure);
                    }
                }
            }

            self.release_spin();
            spins = Self::note_contention(spins);
            core::hint::spin_loop();
        }
    }

    /// Acquire the gate exclusively, spinning until admitted.
    pub fn write(&self) -> Result<GateWriteGuard<T>> {
        self.write_inner(false)
    }

    /// Acquire the gate exclusively and mark it defunct when the returned
    /// guard is released. Later acquirers fail.
    pub fn write_destroy(&self) -> Result<GateWriteGuard<T>> {
        self.write_inner(true)
    }

    fn write_inner(&self, destroy: bool) -> Result<GateWriteGuard<T>> {
        let me = cpu::current_token();
        let mut spins: u32 = 0;
        loop {
            self.acquire_spin();
            let state = unsafe { &mut *self.state.get() };

            if state.defunct {
                self.release_spin();
                return Err(KernelError::Failure);
            }

            match state.mode {
                GateMode::Unlocked => {
                    state.owner = me;
                    state.mode = GateMode::Write;
                    state.refcount = 1;
                    state.writer_waiting = false;
                    state.destroy_pending = destroy;
                    self.release_spin();
                    return Ok(GateWriteGuard {
                        inner: self,
                        _not_send: PhantomData,
                    });
                }
                GateMode::Read | GateMode::Write if state.owner == me => {
                    self.release_spin();
                    error!("gate: write acquisition while already held by owner");
                    debug_assert!(false, "recursive gate write entry");
                    return Err(KernelError::Failure);
                }
                _ => {
                    state.writer_waiting = true;
                }
            }

            self.release_spin();
            spins = Self::note_contention(spins);
            core::hint::spin_loop();
        }
    }

    /// Try a shared acquisition without spinning.
    pub fn try_read(&self) -> Option<GateReadGuard<T>> {
        let me = cpu::current_token();
        self.acquire_spin();
        let state = unsafe { &mut *self.state.get() };
        let admitted = !state.defunct
            && match state.mode {
                GateMode::Unlocked => {
                    state.owner = me;
                    state.mode = GateMode::Read;
                    state.refcount = 1;
                    true
                }
                GateMode::Read if state.owner == me || !state.writer_waiting => {
                    state.refcount += 1;
                    true
                }
                _ => false,
            };
        self.release_spin();
        admitted.then(|| GateReadGuard {
            inner: self,
            _not_send: PhantomData,
        })
    }

    /// Whether the gate has been sealed by a destroy release.
    pub fn is_defunct(&self) -> bool {
        self.acquire_spin();
        let defunct = unsafe { &*self.state.get() }.defunct;
        self.release_spin();
        defunct
    }

    /// Current owner token and acquisition count, for invariant checks.
    pub fn owner_and_refcount(&self) -> (usize, u32) {
        self.acquire_spin();
        let state = unsafe { &*self.state.get() };
        let snapshot = (state.owner, state.refcount);
        self.release_spin();
        snapshot
    }

    fn release_acquisition(&self) {
        self.acquire_spin();
        let state = unsafe { &mut *self.state.get() };
        state.refcount -= 1;
        if state.refcount == 0 {
            state.owner = 0;
            state.mode = GateMode::Unlocked;
            if state.destroy_pending {
                state.destroy_pending = false;
                state.defunct = true;
            }
        }
        self.release_spin();
    }

    fn acquire_spin(&self) {
        while self
            .spin
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn release_spin(&self) {
        self.spin.store(false, Ordering::Release);
    }

    fn note_contention(spins: u32) -> u32 {
        let spins = spins.wrapping_add(1);
        if spins == GATE_SPIN_TIMEOUT {
            error!("gate: waited too long for acquisition, probable deadlock");
            debug_assert!(false, "gate spin timeout");
        }
        spins
    }
}

// Safety. The gate arbitrates all access to the inner value at runtime.
unsafe impl<T: Send> Send for Gate<T> {}
unsafe impl<T: Send + Sync> Sync for Gate<T> {}

impl<T: fmt::Debug> fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Gate { .. }")
    }
}

/// A guard providing shared access.
pub struct GateReadGuard<'a, T> {
    inner: &'a Gate<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T> Deref for GateReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.inner.val.get() }
    }
}

impl<'a, T> Drop for GateReadGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.release_acquisition();
    }
}

/// A guard providing exclusive access.
pub struct GateWriteGuard<'a, T> {
    inner: &'a Gate<T>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T> Deref for GateWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.inner.val.get() }
    }
}

impl<'a, T> DerefMut for GateWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.inner.val.get() }
    }
}

impl<'a, T> Drop for GateWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.release_acquisition();
    }
}
