// SPDX-License-Identifier: MPL-2.0

//! The portable core of the diosix microkernel.
//!
//! Everything hardware-specific lives behind [`port::Port`]; the core
//! holds the process/thread model, the cooperative priority scheduler,
//! synchronous message-passing IPC with priority inheritance, the virtual
//! memory manager and the gate primitive that serialises access to kernel
//! objects across cores.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod cpu;
pub mod error;
pub mod ipc;
pub mod mm;
pub mod port;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;

mod prelude;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

use alloc::sync::Arc;

use spin::Once;

use crate::cpu::CpuTable;
use crate::error::Result;
use crate::mm::{KernelHeap, PhysStacks};
use crate::port::Port;
use crate::process::{Pid, Registry, Thread, Tid};
use crate::sched::SchedGlobal;

/// A virtual address.
pub type Vaddr = usize;
/// A physical address.
pub type Paddr = usize;
/// An opaque, port-managed page-table root.
pub type PageTableRoot = usize;

/// The assembled kernel: every subsystem singleton behind its own lock,
/// reachable from one place.
pub struct Kernel {
    port: &'static dyn Port,
    cpus: CpuTable,
    registry: Registry,
    phys: PhysStacks,
    heap: KernelHeap,
    sched: SchedGlobal,
}

impl Kernel {
    /// Build the kernel around a port and the boot memory map. The frame
    /// stacks are filled here; the heap and scheduler pools follow in
    /// [`Kernel::late_init`] once the kernel has a fixed home.
    pub fn new(port: &'static dyn Port, info: &boot::BootInfo) -> Self {
        let (phys, _stack_region) = PhysStacks::init(
            &info.regions,
            info.kernel_image.clone(),
            &info.payload_ranges(),
        );
        Self {
            port,
            cpus: CpuTable::new(port.cpu_count()),
            registry: Registry::new(),
            phys,
            heap: KernelHeap::new(),
            sched: SchedGlobal::new(),
        }
    }

    /// Second-stage initialisation: prime the heap while contiguous frame
    /// runs are plentiful and build the scheduler's sleep pool.
    pub fn late_init(&self) -> Result<()> {
        self.heap.prime(self.port, &self.phys, 16 * config::PAGE_SIZE)?;
        sched::initialise(self)?;
        Ok(())
    }

    pub fn port(&self) -> &'static dyn Port {
        self.port
    }

    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn phys(&self) -> &PhysStacks {
        &self.phys
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    pub fn sched(&self) -> &SchedGlobal {
        &self.sched
    }

    /// Allocate kernel heap memory.
    pub fn malloc(&self, size: usize) -> Result<*mut u8> {
        self.heap.alloc(self.port, &self.phys, size)
    }

    pub fn heap_free(&self, addr: *mut u8) -> Result<()> {
        self.heap.free(addr)
    }

    pub fn realloc(&self, addr: *mut u8, new_size: usize) -> Result<*mut u8> {
        self.heap.realloc(self.port, &self.phys, addr, new_size)
    }

    /// The thread executing on this CPU.
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.cpus.cpu(cpu::this_cpu()).current()
    }

    /// Resolve a (pid, tid) pair through the registry.
    pub fn find_thread(&self, pid: Pid, tid: Tid) -> Option<Arc<Thread>> {
        self.registry
            .find(pid)?
            .inner()
            .read()
            .ok()?
            .find_thread(tid)
    }
}

static KERNEL: Once<&'static Kernel> = Once::new();

/// Install the kernel singleton. Called once from the port's boot path.
pub fn install(kernel: &'static Kernel) {
    KERNEL.call_once(|| kernel);
}

/// The installed kernel.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not installed")
}

/// Bring the operating system up: scheduler pools, payload processes, the
/// first pick, then hand over to the port to enter userland.
pub fn start(kernel: &'static Kernel, info: &boot::BootInfo) -> Result<()> {
    kernel.late_init()?;
    boot::bring_up(kernel, info)?;
    sched::pick(kernel);
    kernel.port().kickstart();
    Ok(())
}
