// SPDX-License-Identifier: MPL-2.0

//! Processes and threads: the records, the pid/tid registry, roles and
//! credentials, creation and destruction.

mod credentials;
mod lifecycle;
#[allow(clippy::module_inception)]
mod process;
mod table;
mod thread;

pub use self::credentials::{Credentials, IdTriple};
pub use self::lifecycle::{kill_process, kill_thread, exit_process};
pub use self::process::{
    process_new, IrqEntry, PhysBlock, Process, ProcessFlags, ProcessInner, SignalState,
};
pub use self::table::{Registry, Role, ROLE_COUNT};
pub use self::thread::{
    create_thread, duplicate_thread, GrantedPriority, SavedRegisters, Thread, ThreadFlags,
    ThreadInner, ThreadState,
};

/// Process id, unique across the live registry.
pub type Pid = u32;
/// Thread id, unique within its process.
pub type Tid = u32;
