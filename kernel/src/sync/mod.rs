// SPDX-License-Identifier: MPL-2.0

//! Kernel synchronisation primitives: the word spinlock and the
//! owner-tracked reader/writer gate.

mod gate;
mod spin;

pub use self::gate::{Gate, GateReadGuard, GateWriteGuard};
pub use self::spin::{SpinLock, SpinLockGuard};
